//! Inbound message handlers (§4.3): the routing/forwarding/control logic
//! that needs cross-connection state a single `Connection` doesn't own.

use std::time::Instant;

use crate::broadcast::BroadcastWindow;
use crate::codec::{Message, RouteRecord, WITHDRAW_DIST};
use crate::error::{MeshResult, SoftError};
use crate::hwaddr::HwAddr;
use crate::peer_id::PeerId;
use crate::registry::PeerRegistry;
use crate::route::{Candidate, RouteTable, Via};
use crate::tunnel::{TunnelInterface, TunnelStatus};
use crate::channel::SecureChannel;

/// Side effects a single dispatched message can trigger beyond the direct
/// mutation already applied to the connection it arrived on.
#[derive(Default)]
pub struct DispatchEffects {
    /// The route table changed (or may have); the driver should recompute
    /// and flush diffs at the next tick.
    pub routes_dirty: bool,
    /// A peer's incremental update overflowed its cap; send it a
    /// `route_request` once the current inbound batch finishes.
    pub resync: Option<PeerId>,
}

/// Collect every candidate route the table should consider: local tunnel
/// addresses (cost 0, dist 0) plus each active peer's reported routes
/// costed per §4.5's formula.
pub fn collect_candidates<C, T>(registry: &PeerRegistry<C>, tunnel: &T, hop_penalty: u32) -> Vec<Candidate>
where
    C: SecureChannel,
    T: TunnelInterface,
{
    let mut candidates = Vec::new();

    for addr in tunnel.local_addrs() {
        candidates.push(Candidate { addr: *addr, via: Via::Local, cost: 0, dist: 0 });
    }

    for (id, conn) in registry.iter() {
        if conn.state != crate::connection::State::Active {
            continue;
        }
        for (addr, remote) in conn.remote_routes.iter() {
            let cost = crate::route::remote_cost(conn.ping_us, remote.ping, remote.dist, hop_penalty);
            candidates.push(Candidate { addr: *addr, via: Via::Peer(id), cost, dist: remote.dist.saturating_add(1) });
        }
    }

    candidates
}

/// Build a full route-set from the current table, suitable for answering a
/// `route_request` or for an initial post-handshake advertisement.
pub fn build_route_set(table: &RouteTable) -> Message {
    let records = table
        .iter()
        .map(|(addr, entry)| RouteRecord { addr: *addr, ping: entry.cost, dist: entry.dist })
        .collect();
    Message::RouteSet(records)
}

/// Build a route-diff from the table's accumulated pending changes.
pub fn build_route_diff(table: &mut RouteTable) -> Message {
    let records = table
        .take_pending_diff()
        .into_iter()
        .map(|change| match change.entry {
            Some(entry) => RouteRecord { addr: change.addr, ping: entry.cost, dist: entry.dist },
            None => RouteRecord { addr: change.addr, ping: 0, dist: WITHDRAW_DIST },
        })
        .collect();
    Message::RouteDiff(records)
}

fn frame_dest(frame: &[u8]) -> Option<HwAddr> {
    HwAddr::from_slice(frame.get(0..6)?)
}

fn frame_origin(frame: &[u8]) -> Option<HwAddr> {
    HwAddr::from_slice(frame.get(6..12)?)
}

/// Dispatch one message received from `from`. Mutates `registry` (the
/// sending connection's own bookkeeping was already updated by
/// `Connection::on_readable`'s caller before this runs for ping/pong/route
/// messages that are pure connection state; this function handles the
/// messages that also touch the table, the tunnel, or other peers).
pub fn handle_inbound<C, T>(
    from: PeerId,
    msg: Message,
    registry: &mut PeerRegistry<C>,
    routes: &mut RouteTable,
    broadcast: &mut BroadcastWindow,
    tunnel: &mut T,
    now: Instant,
) -> MeshResult<DispatchEffects>
where
    C: SecureChannel,
    T: TunnelInterface,
{
    let mut effects = DispatchEffects::default();

    match msg {
        Message::Data(frame) => {
            let dest = match frame_dest(&frame) {
                Some(d) => d,
                None => return Ok(effects),
            };
            match routes.get(&dest) {
                Some(entry) if entry.via == Via::Local => {
                    let _ = tunnel.write_frame(&frame);
                }
                Some(entry) => {
                    if let Via::Peer(next) = entry.via {
                        if next != from {
                            if let Some(conn) = registry.get_mut(next) {
                                if conn.can_write_data() {
                                    let _ = conn.enqueue_data(&Message::Data(frame));
                                }
                            }
                        }
                    }
                }
                None => {}
            }
        }

        Message::Broadcast { id, frame } => {
            let origin = match frame_origin(&frame) {
                Some(o) => o,
                None => return Ok(effects),
            };
            if broadcast.observe((origin, id), now) {
                let _ = tunnel.write_frame(&frame);
                let outbound = Message::Broadcast { id, frame: frame.clone() };
                for (peer_id, conn) in registry.iter_mut() {
                    if peer_id == from || conn.state != crate::connection::State::Active {
                        continue;
                    }
                    if conn.can_write_data() {
                        let _ = conn.enqueue_data(&outbound);
                    }
                }
            }
        }

        Message::RouteSet(records) => {
            if let Some(conn) = registry.get_mut(from) {
                match conn.apply_route_set(&records) {
                    Ok(()) => effects.routes_dirty = true,
                    Err(SoftError::RouteCapExceeded) => effects.resync = Some(from),
                    Err(_) => {}
                }
            }
        }

        Message::RouteDiff(records) => {
            if let Some(conn) = registry.get_mut(from) {
                match conn.apply_route_diff(&records) {
                    Ok(()) => effects.routes_dirty = true,
                    Err(SoftError::RouteCapExceeded) => {
                        effects.routes_dirty = true;
                        effects.resync = Some(from);
                    }
                    Err(_) => {}
                }
            }
        }

        Message::Ping(id) => {
            if let Some(conn) = registry.get_mut(from) {
                conn.handle_ping(id)?;
            }
        }

        Message::Pong(id) => {
            if let Some(conn) = registry.get_mut(from) {
                conn.handle_pong(id, now);
            }
        }

        Message::RouteRequest => {
            let reply = build_route_set(routes);
            if let Some(conn) = registry.get_mut(from) {
                conn.enqueue_proto(&reply)?;
            }
        }
    }

    Ok(effects)
}

/// Check `tunnel` for a locally-originated frame and route/forward it,
/// matching the outbound half of the data path described in §2's data-flow
/// summary. Returns once the tunnel reports `WouldBlock` (nothing more to
/// drain this tick — edge-triggered readiness will wake us again).
pub fn drain_tunnel<C, T>(registry: &mut PeerRegistry<C>, routes: &RouteTable, broadcast: &mut BroadcastWindow, tunnel: &mut T)
where
    C: SecureChannel,
    T: TunnelInterface,
{
    loop {
        let frame = match tunnel.read_frame() {
            TunnelStatus::Ready(frame) => frame,
            TunnelStatus::WouldBlock => break,
            TunnelStatus::Err(_) => break,
        };

        let dest = match frame_dest(&frame) {
            Some(d) => d,
            None => continue,
        };

        if dest.is_broadcast() {
            // Locally-originated broadcasts are not re-delivered to the
            // tunnel; only flooded to every active peer, tagged with a
            // fresh id so the receiving peers' broadcast windows can
            // de-duplicate it (§4.6).
            let id = broadcast.next_local_id();
            let outbound = Message::Broadcast { id, frame };
            for (_, conn) in registry.iter_mut() {
                if conn.state != crate::connection::State::Active || !conn.can_write_data() {
                    continue;
                }
                let _ = conn.enqueue_data(&outbound);
            }
            continue;
        }

        if let Some(entry) = routes.get(&dest) {
            if let Via::Peer(next) = entry.via {
                if let Some(conn) = registry.get_mut(next) {
                    if conn.can_write_data() {
                        let _ = conn.enqueue_data(&Message::Data(frame));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FakeChannel;
    use crate::connection::{Connection, Timings};
    use bytes::Bytes;
    use std::time::Duration;

    fn timings() -> Timings {
        Timings { timeout: Duration::from_millis(300), keepalive: Duration::from_millis(100), retry: Duration::from_millis(200) }
    }

    fn active_conn(id: PeerId) -> Connection<FakeChannel> {
        let mut conn = Connection::new_inbound(id, 8, 1500, 8, 8, timings());
        conn.attach_channel(FakeChannel::new());
        conn.advance_handshake().unwrap();
        conn
    }

    fn ethernet_frame(dest: u8, src: u8, payload: &[u8]) -> Bytes {
        let mut bytes = vec![dest; 6];
        bytes.extend(vec![src; 6]);
        bytes.extend_from_slice(payload);
        Bytes::from(bytes)
    }

    #[test]
    fn positive_data_for_local_address_is_delivered_to_tunnel() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let mut routes = RouteTable::new(100);
        let local = HwAddr::from_bytes([9; 6]);
        routes.recompute(vec![Candidate { addr: local, via: Via::Local, cost: 0, dist: 0 }]);
        routes.take_pending_diff();
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![local]);

        let from = registry.insert_with(|id| active_conn(id));
        let frame = ethernet_frame(9, 1, b"hello");
        handle_inbound(from, Message::Data(frame), &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();

        assert_eq!(tunnel.delivered().len(), 1);
    }

    #[test]
    fn positive_data_for_unknown_address_is_dropped() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let mut routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        let from = registry.insert_with(|id| active_conn(id));
        let frame = ethernet_frame(0xcc, 1, b"hello");
        handle_inbound(from, Message::Data(frame), &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();

        assert!(tunnel.delivered().is_empty());
    }

    #[test]
    fn positive_data_forwarded_to_via_peer() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let mut routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        let sender = registry.insert_with(|id| active_conn(id));
        let next_hop = registry.insert_with(|id| active_conn(id));

        let dest = HwAddr::from_bytes([7; 6]);
        routes.recompute(vec![Candidate { addr: dest, via: Via::Peer(next_hop), cost: 3, dist: 1 }]);
        routes.take_pending_diff();

        let frame = ethernet_frame(7, 1, b"payload");
        handle_inbound(sender, Message::Data(frame), &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();

        assert_eq!(registry.get(next_hop).unwrap().data_q.len(), 1);
    }

    #[test]
    fn positive_broadcast_delivered_once_and_forwarded_excluding_sender() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let mut routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        let sender = registry.insert_with(|id| active_conn(id));
        let other = registry.insert_with(|id| active_conn(id));

        let frame = ethernet_frame(0xff, 1, b"bcast");
        let msg = Message::Broadcast { id: 1, frame };
        handle_inbound(sender, msg.clone(), &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();

        assert_eq!(tunnel.delivered().len(), 1);
        assert_eq!(registry.get(other).unwrap().data_q.len(), 1);
        assert_eq!(registry.get(sender).unwrap().data_q.len(), 0);

        // Re-delivery of the same (origin, id) is suppressed entirely.
        handle_inbound(sender, msg, &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();
        assert_eq!(tunnel.delivered().len(), 1);
        assert_eq!(registry.get(other).unwrap().data_q.len(), 1);
    }

    #[test]
    fn positive_route_request_replies_with_full_set() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let mut routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        let from = registry.insert_with(|id| active_conn(id));
        handle_inbound(from, Message::RouteRequest, &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();

        assert_eq!(registry.get(from).unwrap().proto_q.len(), 1);
    }

    #[test]
    fn positive_route_set_overflow_requests_resync() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let mut routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        let from = registry.insert_with(|id| Connection::new_inbound(id, 1, 1500, 8, 8, timings()));
        let oversize: Vec<RouteRecord> = (0..5).map(|i| RouteRecord { addr: HwAddr::from_bytes([i; 6]), ping: 0, dist: 0 }).collect();
        let effects =
            handle_inbound(from, Message::RouteSet(oversize), &mut registry, &mut routes, &mut broadcast, &mut tunnel, Instant::now()).unwrap();

        assert_eq!(effects.resync, Some(from));
    }

    #[test]
    fn positive_collect_candidates_includes_local_and_remote() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let peer = registry.insert_with(|id| active_conn(id));
        let remote_addr = HwAddr::from_bytes([3; 6]);
        registry.get_mut(peer).unwrap().remote_routes.insert(remote_addr, crate::connection::RemoteRoute { ping: 5, dist: 0 });

        let local_addr = HwAddr::from_bytes([1; 6]);
        let tunnel = crate::tunnel::FakeTunnel::new(vec![local_addr]);
        let candidates = collect_candidates(&registry, &tunnel, 1);

        assert!(candidates.iter().any(|c| c.addr == local_addr && c.via == Via::Local));
        assert!(candidates.iter().any(|c| c.addr == remote_addr && c.via == Via::Peer(peer)));
    }

    #[test]
    fn positive_locally_originated_broadcast_is_flooded_as_broadcast_message() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let peer = registry.insert_with(|id| active_conn(id));
        let routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        let frame = ethernet_frame(0xff, 1, b"flood");
        tunnel.inject(&frame);
        drain_tunnel(&mut registry, &routes, &mut broadcast, &mut tunnel);

        let conn = registry.get_mut(peer).unwrap();
        assert_eq!(conn.data_q.len(), 1);
        let sent = conn.data_q.front_remaining().unwrap();
        // type byte 2 is TYPE_BROADCAST, not TYPE_DATA (1).
        assert_eq!(sent[0], 2);
    }

    #[test]
    fn positive_two_local_broadcasts_get_distinct_ids() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let peer = registry.insert_with(|id| active_conn(id));
        let routes = RouteTable::new(100);
        let mut broadcast = BroadcastWindow::new(8, Duration::from_secs(60));
        let mut tunnel = crate::tunnel::FakeTunnel::new(vec![]);

        tunnel.inject(&ethernet_frame(0xff, 1, b"first"));
        tunnel.inject(&ethernet_frame(0xff, 1, b"second"));
        drain_tunnel(&mut registry, &routes, &mut broadcast, &mut tunnel);

        let conn = registry.get_mut(peer).unwrap();
        assert_eq!(conn.data_q.len(), 2);
        let first = conn.data_q.front_remaining().unwrap().to_vec();
        conn.data_q.advance(first.len());
        let second = conn.data_q.front_remaining().unwrap();
        // bytes 4..8 of the encoded frame are the broadcast id (after the
        // 4-byte header); distinct injections must get distinct ids.
        assert_ne!(&first[4..8], &second[4..8]);
    }
}
