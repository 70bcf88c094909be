//! Thin entry point: parse configuration, initialize logging, harden the
//! process, then hand off to the daemon context's main loop.

use std::process::ExitCode;

use log::error;

use meshvpnd::config::{parse_cli, Config};
use meshvpnd::context::{install_signal_handler, lock_memory_best_effort, Daemon};
use meshvpnd::error::MeshErrorKind;
use meshvpnd::tunnel::NullTunnel;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_POLL_INIT: u8 = 2;
const EXIT_INTERFACE_INIT: u8 = 3;
const EXIT_MEMORY_LOCK: u8 = 4;
const EXIT_COMM_INIT: u8 = 5;
const EXIT_LOCAL_SECURITY: u8 = 6;

fn main() -> ExitCode {
    let cli = parse_cli(std::env::args_os());

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = match Config::from_path(&cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration from {}: {}", cli.config_path.display(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = lock_memory_best_effort(false) {
        error!("memory lock hardening failed: {}", e);
        return ExitCode::from(EXIT_MEMORY_LOCK);
    }

    let terminate = match install_signal_handler() {
        Ok(flag) => flag,
        Err(e) => {
            error!("failed to install signal handler: {}", e);
            return ExitCode::from(EXIT_LOCAL_SECURITY);
        }
    };

    // A real tun/tap adapter is platform-specific and outside this
    // design's testable surface (§4.12); wire in one here for a given
    // platform. Until then the daemon still handshakes, routes, and
    // forwards between peers with no local interface traffic.
    let tunnel = NullTunnel;

    let mut daemon = match Daemon::new(config, tunnel, terminate) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to initialize daemon: {}", e);
            return ExitCode::from(match e.kind() {
                MeshErrorKind::ConfigInvalid(detail) if detail.contains("poll init") => EXIT_POLL_INIT,
                MeshErrorKind::ConfigInvalid(detail) if detail.contains("bind") || detail.contains("listen") => EXIT_INTERFACE_INIT,
                _ => EXIT_COMM_INIT,
            });
        }
    };

    if cli.foreground {
        log::info!("running in foreground");
    }

    if let Err(e) = daemon.run() {
        error!("daemon exited with error: {}", e);
        return ExitCode::from(EXIT_COMM_INIT);
    }

    ExitCode::from(EXIT_OK)
}
