//! Status export (§4.11): a periodic, machine-readable snapshot written to
//! `status_path` for operational visibility. Diagnostic-only — nothing
//! reads it back in, and a write failure is logged, never fatal.

use std::fs;
use std::path::Path;

use log::warn;
use serde::Serialize;

use crate::broadcast::BroadcastWindow;
use crate::channel::SecureChannel;
use crate::connection::State;
use crate::registry::PeerRegistry;
use crate::route::RouteTable;

#[derive(Serialize)]
pub struct PeerStatus {
    pub id: usize,
    pub state: &'static str,
    pub ping_us: u32,
    pub proto_queue_depth: usize,
    pub data_queue_depth: usize,
    pub route_overflow: bool,
}

#[derive(Serialize)]
pub struct Snapshot {
    pub peers: Vec<PeerStatus>,
    pub route_table_size: usize,
    pub broadcast_window_occupancy: usize,
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Inactive => "inactive",
        State::RetryTimeout => "retry_timeout",
        State::Connecting => "connecting",
        State::SslConnecting => "ssl_connecting",
        State::Accepting => "accepting",
        State::Active => "active",
        State::Closing => "closing",
    }
}

pub fn build_snapshot<C>(registry: &PeerRegistry<C>, routes: &RouteTable, broadcast: &BroadcastWindow) -> Snapshot
where
    C: SecureChannel,
{
    let peers = registry
        .iter()
        .map(|(id, conn)| PeerStatus {
            id: id.0,
            state: state_name(conn.state),
            ping_us: conn.ping_us,
            proto_queue_depth: conn.proto_q.len(),
            data_queue_depth: conn.data_q.len(),
            route_overflow: conn.route_overflow,
        })
        .collect();

    Snapshot { peers, route_table_size: routes.len(), broadcast_window_occupancy: broadcast.occupancy() }
}

/// Write the snapshot to `path` as JSON. Any failure is logged at `warn`
/// and swallowed — status export must never take down the main loop.
pub fn export(path: &Path, snapshot: &Snapshot) {
    let body = match serde_json::to_string_pretty(snapshot) {
        Ok(body) => body,
        Err(e) => {
            warn!("failed to serialize status snapshot: {}", e);
            return;
        }
    };
    if let Err(e) = fs::write(path, body) {
        warn!("failed to write status snapshot to {}: {}", path.display(), e);
    }
}
