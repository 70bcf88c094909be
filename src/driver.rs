//! Periodic driver (§4.8): the fixed-heartbeat tick that retries dead
//! connections, services keepalive, recomputes routes, and flushes diffs.
//!
//! Starting an actual outbound socket is a context-level concern (it needs
//! a live `mio::Poll` to register the new handle against), so `tick` only
//! reports which peers are now due for a connect attempt; the caller
//! performs the connect and calls `Connection::attach_channel`.

use std::time::Instant;

use log::{debug, info, warn};

use crate::channel::SecureChannel;
use crate::connection::State;
use crate::dispatch::{build_route_diff, build_route_set, collect_candidates};
use crate::error::MeshResult;
use crate::peer_id::PeerId;
use crate::registry::PeerRegistry;
use crate::route::RouteTable;
use crate::tunnel::TunnelInterface;

/// What the caller must act on after a tick completes.
#[derive(Default)]
pub struct TickOutcome {
    /// Connections whose retry window has expired and should now be dialed.
    pub to_connect: Vec<PeerId>,
    /// Connections reaped this tick (drained `closing`); already removed
    /// from the registry, caller should deregister their poll handle.
    pub reaped: Vec<PeerId>,
    /// Whether the route table changed this tick.
    pub routes_changed: bool,
}

pub struct Driver {
    hop_penalty: u32,
}

impl Driver {
    pub fn new(hop_penalty: u32) -> Driver {
        Driver { hop_penalty }
    }

    pub fn tick<C, T>(&self, now: Instant, registry: &mut PeerRegistry<C>, routes: &mut RouteTable, tunnel: &T) -> MeshResult<TickOutcome>
    where
        C: SecureChannel,
        T: TunnelInterface,
    {
        let mut outcome = TickOutcome::default();

        self.service_retries(now, registry, &mut outcome);
        self.service_keepalives(now, registry)?;
        self.reap_closed(registry, &mut outcome);

        let candidates = collect_candidates(registry, tunnel, self.hop_penalty);
        routes.recompute(candidates);
        if routes.has_pending_changes() {
            outcome.routes_changed = true;
            self.flush_route_changes(registry, routes)?;
        }

        Ok(outcome)
    }

    fn service_retries<C>(&self, now: Instant, registry: &mut PeerRegistry<C>, outcome: &mut TickOutcome)
    where
        C: SecureChannel,
    {
        for (id, conn) in registry.iter_mut() {
            if conn.state != State::Inactive && conn.state != State::RetryTimeout {
                continue;
            }
            if conn.reconnect_addr.is_none() {
                continue;
            }
            let due = match conn.last_retry {
                Some(t) => now.duration_since(t) >= conn.timings.retry,
                None => true,
            };
            if due {
                outcome.to_connect.push(id);
            }
        }
    }

    fn service_keepalives<C>(&self, now: Instant, registry: &mut PeerRegistry<C>) -> MeshResult<()>
    where
        C: SecureChannel,
    {
        let mut dead = Vec::new();
        for (id, conn) in registry.iter_mut() {
            if conn.service_keepalive(now)? {
                dead.push(id);
            }
        }
        for id in dead {
            if let Some(conn) = registry.get_mut(id) {
                warn!("{} missed keepalive, closing", id);
                conn.close(now, true);
            }
        }
        Ok(())
    }

    fn reap_closed<C>(&self, registry: &mut PeerRegistry<C>, outcome: &mut TickOutcome)
    where
        C: SecureChannel,
    {
        let doomed: Vec<PeerId> = registry.iter().filter(|(_, c)| c.is_drained_closing()).map(|(id, _)| id).collect();
        for id in doomed {
            registry.remove(id);
            info!("{} reaped", id);
            outcome.reaped.push(id);
        }
    }

    fn flush_route_changes<C>(&self, registry: &mut PeerRegistry<C>, routes: &mut RouteTable) -> MeshResult<()>
    where
        C: SecureChannel,
    {
        let message = if routes.should_send_full_set() { build_route_set(routes) } else { build_route_diff(routes) };
        debug!("flushing route update to {} active peers", registry.active_ids().len());
        for (_, conn) in registry.iter_mut() {
            if conn.state == State::Active {
                conn.enqueue_proto(&message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FakeChannel;
    use crate::connection::{Connection, RemoteRoute, Timings};
    use crate::hwaddr::HwAddr;
    use crate::tunnel::FakeTunnel;
    use std::time::Duration;

    fn timings() -> Timings {
        Timings { timeout: Duration::from_millis(300), keepalive: Duration::from_millis(100), retry: Duration::from_millis(200) }
    }

    #[test]
    fn positive_inactive_past_retry_window_is_due_to_connect() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let id = registry.insert_with(|id| Connection::new_outbound(id, "peer:655".into(), 8, 1500, 8, 8, timings()));

        let driver = Driver::new(1);
        let mut routes = RouteTable::new(100);
        let tunnel = FakeTunnel::new(vec![]);
        let outcome = driver.tick(Instant::now(), &mut registry, &mut routes, &tunnel).unwrap();

        assert_eq!(outcome.to_connect, vec![id]);
    }

    #[test]
    fn positive_keepalive_timeout_transitions_to_retry_and_is_reconnect_due() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let id = registry.insert_with(|id| {
            let mut conn = Connection::new_outbound(id, "peer:655".into(), 8, 1500, 8, 8, timings());
            conn.attach_channel(FakeChannel::new());
            conn.advance_handshake().unwrap();
            conn
        });
        let now = Instant::now();
        registry.get_mut(id).unwrap().on_activated(now);

        let driver = Driver::new(1);
        let mut routes = RouteTable::new(100);
        let tunnel = FakeTunnel::new(vec![]);

        // First tick past keepalive sends the ping.
        driver.tick(now + Duration::from_millis(150), &mut registry, &mut routes, &tunnel).unwrap();
        assert!(registry.get(id).unwrap().has_pending_ping());

        // Second tick past timeout declares it dead and moves to retry.
        driver.tick(now + Duration::from_millis(150) + Duration::from_millis(350), &mut registry, &mut routes, &tunnel).unwrap();
        assert_eq!(registry.get(id).unwrap().state, State::RetryTimeout);
    }

    #[test]
    fn positive_recompute_and_flush_sends_route_diff_to_active_peers() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let peer = registry.insert_with(|id| {
            let mut conn = Connection::new_inbound(id, 8, 1500, 8, 8, timings());
            conn.attach_channel(FakeChannel::new());
            conn.advance_handshake().unwrap();
            conn
        });

        let driver = Driver::new(1);
        let mut routes = RouteTable::new(100);
        let local = HwAddr::from_bytes([1; 6]);
        let tunnel = FakeTunnel::new(vec![local]);

        let outcome = driver.tick(Instant::now(), &mut registry, &mut routes, &tunnel).unwrap();
        assert!(outcome.routes_changed);
        assert_eq!(registry.get(peer).unwrap().proto_q.len(), 1);
    }

    #[test]
    fn positive_drained_closing_connection_is_reaped() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let id = registry.insert_with(|id| {
            let mut conn = Connection::new_inbound(id, 8, 1500, 8, 8, timings());
            conn.attach_channel(FakeChannel::new());
            conn.close(Instant::now(), false);
            conn
        });

        let driver = Driver::new(1);
        let mut routes = RouteTable::new(100);
        let tunnel = FakeTunnel::new(vec![]);
        let outcome = driver.tick(Instant::now(), &mut registry, &mut routes, &tunnel).unwrap();

        assert_eq!(outcome.reaped, vec![id]);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn positive_active_peer_remote_route_feeds_recompute() {
        let mut registry: PeerRegistry<FakeChannel> = PeerRegistry::new();
        let peer = registry.insert_with(|id| {
            let mut conn = Connection::new_inbound(id, 8, 1500, 8, 8, timings());
            conn.attach_channel(FakeChannel::new());
            conn.advance_handshake().unwrap();
            conn
        });
        let remote_addr = HwAddr::from_bytes([5; 6]);
        registry.get_mut(peer).unwrap().remote_routes.insert(remote_addr, RemoteRoute { ping: 2, dist: 0 });

        let driver = Driver::new(1);
        let mut routes = RouteTable::new(100);
        let tunnel = FakeTunnel::new(vec![]);
        driver.tick(Instant::now(), &mut registry, &mut routes, &tunnel).unwrap();

        assert!(routes.get(&remote_addr).is_some());
    }
}
