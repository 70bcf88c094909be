//! Configuration loader (§4.9): a TOML document plus CLI overrides,
//! deserialized into one typed `Config` rather than a stringly-typed map.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{App, Arg};
use serde::Deserialize;

use crate::error::{MeshErrorKind, MeshResult};

fn default_heartbeat_us() -> u64 {
    50_000
}
fn default_timeout_us() -> u64 {
    1_000_000
}
fn default_keepalive_us() -> u64 {
    250_000
}
fn default_retry_us() -> u64 {
    5_000_000
}
fn default_mtu() -> usize {
    1500
}
fn default_queue_cap() -> usize {
    64
}
fn default_max_remote_routes() -> usize {
    4096
}
fn default_hop_penalty() -> u32 {
    1
}
fn default_broadcast_window() -> usize {
    1024
}
fn default_broadcast_age_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Outbound dial address; absent means this entry is accept-only and
    /// exists purely to be displayed in logs/status once it connects in.
    pub connect: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_heartbeat_us")]
    pub heartbeat_us: u64,
    #[serde(default = "default_timeout_us")]
    pub timeout_us: u64,
    #[serde(default = "default_keepalive_us")]
    pub keepalive_us: u64,
    #[serde(default = "default_retry_us")]
    pub retry_us: u64,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_queue_cap")]
    pub max_waiting_data_packets: usize,
    #[serde(default = "default_queue_cap")]
    pub max_waiting_proto_packets: usize,
    #[serde(default = "default_max_remote_routes")]
    pub max_remote_routes: usize,
    #[serde(default = "default_hop_penalty")]
    pub hop_penalty: u32,
    #[serde(default = "default_broadcast_window")]
    pub broadcast_window: usize,
    #[serde(default = "default_broadcast_age_ms")]
    pub broadcast_age_ms: u64,
    #[serde(default)]
    pub peer: Vec<PeerConfig>,
    #[serde(default)]
    pub listen: Vec<ListenConfig>,
    pub status_path: Option<PathBuf>,
}

impl Config {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_micros(self.heartbeat_us)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us)
    }
    pub fn keepalive(&self) -> Duration {
        Duration::from_micros(self.keepalive_us)
    }
    pub fn retry(&self) -> Duration {
        Duration::from_micros(self.retry_us)
    }
    pub fn broadcast_age(&self) -> Duration {
        Duration::from_millis(self.broadcast_age_ms)
    }

    /// Parse a TOML document into a `Config`. A malformed or
    /// missing-required-field document is a fatal `ConfigInvalid` error,
    /// never a panic.
    pub fn from_toml_str(raw: &str) -> MeshResult<Config> {
        toml::from_str(raw).map_err(|e| MeshErrorKind::ConfigInvalid(e.to_string()).into())
    }

    pub fn from_path(path: &Path) -> MeshResult<Config> {
        let raw = fs::read_to_string(path).map_err(|e| MeshErrorKind::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        Config::from_toml_str(&raw)
    }
}

/// Parsed command line: the config file path plus operator overrides that
/// don't belong in the file (foreground mode, verbosity).
pub struct Cli {
    pub config_path: PathBuf,
    pub foreground: bool,
    pub verbose: u64,
}

pub fn parse_cli<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = App::new("meshvpnd")
        .about("peer-to-peer virtual network daemon")
        .arg(Arg::with_name("config").short("c").long("config").takes_value(true).default_value("/etc/meshvpnd.toml"))
        .arg(Arg::with_name("foreground").short("f").long("foreground").help("stay attached to the controlling terminal"))
        .arg(Arg::with_name("verbose").short("v").multiple(true).help("increase log verbosity, may be repeated"))
        .get_matches_from(args);

    Cli {
        config_path: PathBuf::from(matches.value_of("config").expect("has default_value")),
        foreground: matches.is_present("foreground"),
        verbose: matches.occurrences_of("verbose"),
    }
}
