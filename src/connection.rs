//! Per-peer connection state machine (§4.1, §4.3, §4.4).
//!
//! A `Connection` owns everything needed to drive one peer's wire protocol:
//! the secure channel, the inbound parser, and the two outbound queues. It
//! does *not* own the route table, the registry, or the broadcast window —
//! those are process-wide and passed in by the caller (`driver`/`context`)
//! when a received message needs cross-connection effects.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::Interest;

use crate::channel::{ChannelStatus, SecureChannel};
use crate::codec::{FrameParser, Message};
use crate::error::{MeshError, MeshErrorKind, MeshResult, SoftError};
use crate::hwaddr::HwAddr;
use crate::peer_id::PeerId;
use crate::squeue::SendQueue;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Inactive,
    RetryTimeout,
    Connecting,
    SslConnecting,
    Accepting,
    Active,
    Closing,
}

/// A route reported by the peer: `(ping, dist)`. `dist == WITHDRAW_DIST`
/// is never stored here — the diff handler removes the key instead.
#[derive(Copy, Clone, Debug)]
pub struct RemoteRoute {
    pub ping: u32,
    pub dist: u16,
}

/// Timing configuration a connection needs to drive its own state
/// machine; shared (by value, it's tiny) across every connection.
#[derive(Copy, Clone, Debug)]
pub struct Timings {
    pub timeout: Duration,
    pub keepalive: Duration,
    pub retry: Duration,
}

/// Default "ping" cost used before the first round trip has been
/// measured. Matches the reference system's choice of a small nonzero
/// default so routes through an unmeasured peer aren't infinitely
/// expensive, just slightly discouraged versus an already-measured one.
pub const UNMEASURED_PING_US: u32 = 1;

pub struct Connection<C> {
    pub id: PeerId,
    pub state: State,
    pub channel: Option<C>,

    recv_buf: BytesMut,
    parser: FrameParser,

    pub proto_q: SendQueue,
    pub data_q: SendQueue,
    sending_from_data_q: bool,

    pub ping_us: u32,
    /// When we last *sent* a ping, answered or not — drives the keepalive
    /// interval independently of whether a reply has arrived yet.
    last_ping_at: Option<Instant>,
    /// `Some((id, sent_at))` while a sent ping has not yet been answered.
    pending_ping: Option<(u8, Instant)>,
    next_ping_id: u8,

    pub last_retry: Option<Instant>,
    pub reconnect_addr: Option<String>,

    pub remote_routes: HashMap<HwAddr, RemoteRoute>,
    pub max_remote_routes: usize,
    pub route_overflow: bool,

    pub timings: Timings,
    mtu: usize,
}

impl<C> Connection<C>
where
    C: SecureChannel,
{
    fn new(
        id: PeerId,
        state: State,
        reconnect_addr: Option<String>,
        max_remote_routes: usize,
        mtu: usize,
        proto_cap: usize,
        data_cap: usize,
        timings: Timings,
    ) -> Connection<C> {
        Connection {
            id,
            state,
            channel: None,
            recv_buf: BytesMut::new(),
            parser: FrameParser::new(),
            proto_q: SendQueue::new(proto_cap),
            data_q: SendQueue::new(data_cap),
            sending_from_data_q: false,
            ping_us: UNMEASURED_PING_US,
            last_ping_at: None,
            pending_ping: None,
            next_ping_id: 0,
            last_retry: None,
            reconnect_addr,
            remote_routes: HashMap::new(),
            max_remote_routes,
            route_overflow: false,
            timings,
            mtu,
        }
    }

    /// Create a fresh outbound connection, starting in `Inactive` until the
    /// periodic driver sees its retry window expire.
    pub fn new_outbound(
        id: PeerId,
        reconnect_addr: String,
        max_remote_routes: usize,
        mtu: usize,
        proto_cap: usize,
        data_cap: usize,
        timings: Timings,
    ) -> Connection<C> {
        Connection::new(id, State::Inactive, Some(reconnect_addr), max_remote_routes, mtu, proto_cap, data_cap, timings)
    }

    /// Create a fresh inbound connection, already `Accepting` a transport
    /// handshake initiated by a listener.
    pub fn new_inbound(
        id: PeerId,
        max_remote_routes: usize,
        mtu: usize,
        proto_cap: usize,
        data_cap: usize,
        timings: Timings,
    ) -> Connection<C> {
        Connection::new(id, State::Accepting, None, max_remote_routes, mtu, proto_cap, data_cap, timings)
    }

    pub fn can_write_proto(&self) -> bool {
        self.proto_q.has_room()
    }

    pub fn can_write_data(&self) -> bool {
        self.data_q.has_room()
    }

    /// Enqueue a control message. Overflow here is a design error (the
    /// caller is expected to have checked `can_write_proto` for anything
    /// that can legitimately be backpressured), so it is fatal.
    pub fn enqueue_proto(&mut self, msg: &Message) -> MeshResult<()> {
        if !self.proto_q.push(msg.encode()) {
            return Err(MeshErrorKind::ProtoQueueFull.into());
        }
        Ok(())
    }

    /// Enqueue a forwarded data or broadcast frame. Overflow is a benign
    /// drop; returns `Err(SoftError::DataQueueFull)` so the caller can
    /// count/log it without treating it as fatal.
    pub fn enqueue_data(&mut self, msg: &Message) -> Result<(), SoftError> {
        if self.data_q.push(msg.encode()) {
            Ok(())
        } else {
            Err(SoftError::DataQueueFull)
        }
    }

    /// Whether this connection currently has a handle registered and
    /// should be polled at all (i.e. it isn't idle/retrying).
    pub fn has_handle(&self) -> bool {
        self.channel.is_some()
    }

    /// The `mio` interest this connection's handle should be registered
    /// with, given its current state and queue occupancy.
    pub fn poll_interest(&self) -> Option<Interest> {
        if !self.has_handle() {
            return None;
        }
        match self.state {
            State::Connecting => Some(Interest::WRITABLE),
            State::SslConnecting | State::Accepting => Some(Interest::READABLE.add(Interest::WRITABLE)),
            State::Active | State::Closing => {
                let want_write = !self.proto_q.is_empty() || !self.data_q.is_empty();
                if want_write {
                    Some(Interest::READABLE.add(Interest::WRITABLE))
                } else {
                    Some(Interest::READABLE)
                }
            }
            State::Inactive | State::RetryTimeout => None,
        }
    }

    /// Attach a freshly-connected/accepted channel and move to
    /// `SslConnecting`, where the handshake is driven by `advance_handshake`.
    pub fn attach_channel(&mut self, channel: C) {
        self.channel = Some(channel);
        self.state = State::SslConnecting;
    }

    /// Drive the transport handshake. Returns `Ok(true)` once the
    /// handshake has completed and the connection has moved to `Active`.
    pub fn advance_handshake(&mut self) -> MeshResult<bool> {
        let channel = match &mut self.channel {
            Some(c) => c,
            None => return Ok(false),
        };
        match channel.handshake_step() {
            ChannelStatus::Ready(()) => {
                self.state = State::Active;
                Ok(true)
            }
            ChannelStatus::WantRead | ChannelStatus::WantWrite => Ok(false),
            ChannelStatus::Closed => Err(MeshErrorKind::TransportHandshake("channel closed during handshake".into()).into()),
            ChannelStatus::Err(e) => Err(MeshErrorKind::TransportHandshake(e.to_string()).into()),
        }
    }

    /// Called once on entry to `Active`: resets ping bookkeeping so a
    /// keepalive is issued promptly, per §4.1.
    pub fn on_activated(&mut self, now: Instant) {
        self.last_ping_at = Some(now);
    }

    /// Whether we (vs. the remote side) should send the initial
    /// route-request on entering `Active` — tie-break: the client
    /// (outbound) side does, per §4.1.
    pub fn is_client(&self) -> bool {
        self.reconnect_addr.is_some()
    }

    /// Read available bytes from the channel and parse as many complete
    /// messages as are now buffered. Transitions to `Closing` on a
    /// protocol violation or hard I/O error; a `WouldBlock`-equivalent is
    /// not an error, it just means there's nothing more to parse yet.
    pub fn on_readable(&mut self) -> MeshResult<Vec<Message>> {
        let channel = match &mut self.channel {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        loop {
            let mut chunk = [0u8; 4096];
            match channel.read(&mut chunk) {
                ChannelStatus::Ready(0) => break,
                ChannelStatus::Ready(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                ChannelStatus::WantRead => break,
                ChannelStatus::WantWrite => break,
                ChannelStatus::Closed => {
                    self.state = State::Closing;
                    break;
                }
                ChannelStatus::Err(e) => {
                    self.state = State::Closing;
                    return Err(MeshError::from(e));
                }
            }
        }

        let mut messages = Vec::new();
        loop {
            match self.parser.decode(&mut self.recv_buf, self.mtu) {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => break,
                Err(e) => {
                    self.state = State::Closing;
                    return Err(e);
                }
            }
        }
        Ok(messages)
    }

    /// Flush as much of `proto_q` (strict priority) then `data_q` as the
    /// channel will accept, resuming a partially-written buffer before
    /// ever switching queues or starting a new one.
    pub fn on_writable(&mut self) -> MeshResult<()> {
        let channel = match &mut self.channel {
            Some(c) => c,
            None => return Ok(()),
        };

        loop {
            // A buffer already in flight on data_q must finish before proto
            // priority is honored again, or a proto message enqueued
            // mid-write would land in the middle of it and desync the
            // peer's frame parser.
            let draining_data = if self.sending_from_data_q && !self.data_q.is_empty() {
                true
            } else if !self.proto_q.is_empty() {
                self.sending_from_data_q = false;
                false
            } else if !self.data_q.is_empty() {
                self.sending_from_data_q = true;
                true
            } else {
                self.sending_from_data_q = false;
                break;
            };

            let queue = if draining_data { &mut self.data_q } else { &mut self.proto_q };
            let remaining = match queue.front_remaining() {
                Some(bytes) => bytes,
                None => break,
            };
            let remaining_len = remaining.len();

            match channel.write(remaining) {
                ChannelStatus::Ready(0) => break,
                ChannelStatus::Ready(n) => {
                    queue.advance(n);
                    if draining_data && n >= remaining_len {
                        self.sending_from_data_q = false;
                    }
                }
                ChannelStatus::WantWrite => break,
                ChannelStatus::WantRead => break,
                ChannelStatus::Closed => {
                    self.state = State::Closing;
                    break;
                }
                ChannelStatus::Err(e) => {
                    self.state = State::Closing;
                    return Err(MeshError::from(e));
                }
            }
        }
        Ok(())
    }

    pub fn sending_from_data_q(&self) -> bool {
        self.sending_from_data_q
    }

    /// Send a keepalive ping if one is due and none is outstanding.
    /// Returns `true` if the connection should be declared dead because a
    /// pending ping is older than `timeout`.
    pub fn service_keepalive(&mut self, now: Instant) -> MeshResult<bool> {
        if self.state != State::Active {
            return Ok(false);
        }

        if let Some((_, sent_at)) = self.pending_ping {
            if now.duration_since(sent_at) > self.timings.timeout {
                return Ok(true);
            }
            return Ok(false);
        }

        let due = match self.last_ping_at {
            Some(t) => now.duration_since(t) > self.timings.keepalive,
            None => true,
        };
        if due {
            self.send_ping(now)?;
        }
        Ok(false)
    }

    fn send_ping(&mut self, now: Instant) -> MeshResult<()> {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.enqueue_proto(&Message::Ping(id))?;
        self.last_ping_at = Some(now);
        self.pending_ping = Some((id, now));
        Ok(())
    }

    /// A peer asked us for our liveness; reply with its id echoed back.
    pub fn handle_ping(&mut self, id: u8) -> MeshResult<()> {
        self.enqueue_proto(&Message::Pong(id))
    }

    /// A pong arrived; if it matches our outstanding ping, update the
    /// cached RTT and clear the pending marker (invariant #3: updated at
    /// most once per sent ping).
    pub fn handle_pong(&mut self, id: u8, now: Instant) {
        if let Some((expected_id, sent_at)) = self.pending_ping {
            if expected_id == id {
                self.ping_us = now.duration_since(sent_at).as_micros() as u32;
                self.pending_ping = None;
            }
        }
    }

    pub fn has_pending_ping(&self) -> bool {
        self.pending_ping.is_some()
    }

    /// Replace this peer's remote routes wholesale (route-set). Clears
    /// `route_overflow` per §4.3. An oversize set is rejected atomically
    /// per the resolved Open Question (b): the previous table is kept.
    pub fn apply_route_set(&mut self, records: &[crate::codec::RouteRecord]) -> Result<(), SoftError> {
        if records.len() > self.max_remote_routes {
            self.route_overflow = true;
            return Err(SoftError::RouteCapExceeded);
        }

        self.remote_routes.clear();
        for record in records {
            if !record.is_withdraw() {
                self.remote_routes.insert(record.addr, RemoteRoute { ping: record.ping, dist: record.dist });
            }
        }
        self.route_overflow = false;
        Ok(())
    }

    /// Apply a route-diff incrementally. If applying it would exceed the
    /// cap, the overflow flag is set and the caller should request a
    /// resync; entries already applied before the cap was hit stay
    /// applied (unlike `apply_route_set`'s atomic rejection — this is an
    /// incremental update, not a full replacement).
    pub fn apply_route_diff(&mut self, records: &[crate::codec::RouteRecord]) -> Result<(), SoftError> {
        let mut overflowed = false;
        for record in records {
            if record.is_withdraw() {
                self.remote_routes.remove(&record.addr);
                continue;
            }
            if !self.remote_routes.contains_key(&record.addr) && self.remote_routes.len() >= self.max_remote_routes {
                overflowed = true;
                continue;
            }
            self.remote_routes.insert(record.addr, RemoteRoute { ping: record.ping, dist: record.dist });
        }

        if overflowed {
            self.route_overflow = true;
            Err(SoftError::RouteCapExceeded)
        } else {
            Ok(())
        }
    }

    /// Close this connection, preferring to fall back to retrying if a
    /// reconnect address is configured (per the `active -> retry_timeout`
    /// and timeout-driven transitions of §4.1).
    pub fn close(&mut self, now: Instant, retry_if_configured: bool) {
        if retry_if_configured && self.reconnect_addr.is_some() {
            self.state = State::RetryTimeout;
            self.last_retry = Some(now);
        } else {
            self.state = State::Closing;
        }
        if let Some(channel) = &mut self.channel {
            channel.shutdown();
        }
    }

    /// Hard reset: drop the channel immediately regardless of queue state.
    pub fn reset(&mut self) {
        self.channel = None;
        self.state = State::Inactive;
        self.pending_ping = None;
        self.remote_routes.clear();
        self.route_overflow = false;
    }

    /// Whether this connection is ready to be reaped by the registry:
    /// `Closing` with both queues drained.
    pub fn is_drained_closing(&self) -> bool {
        self.state == State::Closing && self.proto_q.is_empty() && self.data_q.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FakeChannel, WriteScript};
    use crate::codec::RouteRecord;

    fn timings() -> Timings {
        Timings { timeout: Duration::from_millis(300), keepalive: Duration::from_millis(100), retry: Duration::from_millis(200) }
    }

    fn outbound() -> Connection<FakeChannel> {
        Connection::new_outbound(PeerId(1), "peer.example:655".into(), 4, 1500, 8, 8, timings())
    }

    fn inbound() -> Connection<FakeChannel> {
        Connection::new_inbound(PeerId(2), 4, 1500, 8, 8, timings())
    }

    #[test]
    fn positive_outbound_starts_inactive_inbound_starts_accepting() {
        assert_eq!(outbound().state, State::Inactive);
        assert_eq!(inbound().state, State::Accepting);
    }

    #[test]
    fn positive_handshake_completes_and_activates() {
        let mut conn = outbound();
        conn.attach_channel(FakeChannel::new().with_handshake_steps(2));
        assert_eq!(conn.state, State::SslConnecting);

        assert!(!conn.advance_handshake().unwrap());
        assert!(!conn.advance_handshake().unwrap());
        assert!(conn.advance_handshake().unwrap());
        assert_eq!(conn.state, State::Active);
    }

    #[test]
    fn negative_handshake_closed_is_transport_error() {
        let mut conn = outbound();
        let mut chan = FakeChannel::new();
        chan.closed = true;
        conn.attach_channel(chan);
        let err = conn.advance_handshake().unwrap_err();
        assert!(matches!(err.kind(), MeshErrorKind::TransportHandshake(_)));
    }

    #[test]
    fn positive_proto_queue_overflow_is_fatal() {
        let mut conn = outbound();
        for _ in 0..8 {
            conn.enqueue_proto(&Message::RouteRequest).unwrap();
        }
        assert!(conn.enqueue_proto(&Message::RouteRequest).is_err());
    }

    #[test]
    fn positive_data_queue_overflow_is_soft_drop() {
        let mut conn = outbound();
        for _ in 0..8 {
            conn.enqueue_data(&Message::Data(bytes::Bytes::from_static(b"x"))).unwrap();
        }
        assert_eq!(conn.enqueue_data(&Message::Data(bytes::Bytes::from_static(b"x"))), Err(SoftError::DataQueueFull));
    }

    #[test]
    fn positive_ping_pong_roundtrip_updates_rtt_once() {
        let mut conn = outbound();
        conn.attach_channel(FakeChannel::new());
        conn.advance_handshake().unwrap();
        let now = Instant::now();
        conn.on_activated(now);

        assert!(!conn.service_keepalive(now).unwrap());
        let soon = now + Duration::from_millis(150);
        assert!(!conn.service_keepalive(soon).unwrap());
        assert!(conn.has_pending_ping());

        conn.handle_pong(0, soon + Duration::from_millis(5));
        assert!(!conn.has_pending_ping());
        assert!(conn.ping_us > 0);

        // A stale pong for an id we're no longer waiting on changes nothing.
        let rtt_before = conn.ping_us;
        conn.handle_pong(0, soon + Duration::from_millis(50));
        assert_eq!(conn.ping_us, rtt_before);
    }

    #[test]
    fn positive_pending_ping_older_than_timeout_is_dead() {
        let mut conn = outbound();
        conn.attach_channel(FakeChannel::new());
        conn.advance_handshake().unwrap();
        let now = Instant::now();
        conn.on_activated(now);
        conn.service_keepalive(now + Duration::from_millis(150)).unwrap();
        assert!(conn.has_pending_ping());

        let dead = conn.service_keepalive(now + Duration::from_millis(150) + Duration::from_millis(350)).unwrap();
        assert!(dead);
    }

    #[test]
    fn positive_route_set_replaces_wholesale_and_clears_overflow() {
        let mut conn = outbound();
        conn.route_overflow = true;
        let records = vec![RouteRecord { addr: HwAddr::from_bytes([1; 6]), ping: 5, dist: 0 }];
        conn.apply_route_set(&records).unwrap();
        assert!(!conn.route_overflow);
        assert_eq!(conn.remote_routes.len(), 1);
    }

    #[test]
    fn negative_oversize_route_set_is_rejected_atomically() {
        let mut conn = outbound();
        let initial = vec![RouteRecord { addr: HwAddr::from_bytes([1; 6]), ping: 5, dist: 0 }];
        conn.apply_route_set(&initial).unwrap();

        let oversize: Vec<RouteRecord> = (0..10)
            .map(|i| RouteRecord { addr: HwAddr::from_bytes([i; 6]), ping: 0, dist: 0 })
            .collect();
        assert_eq!(conn.apply_route_set(&oversize), Err(SoftError::RouteCapExceeded));
        assert!(conn.route_overflow);
        // Previous table is unchanged.
        assert_eq!(conn.remote_routes.len(), 1);
    }

    #[test]
    fn positive_route_diff_withdraw_of_unknown_is_noop() {
        let mut conn = outbound();
        let withdraw = vec![RouteRecord { addr: HwAddr::from_bytes([9; 6]), ping: 0, dist: crate::codec::WITHDRAW_DIST }];
        conn.apply_route_diff(&withdraw).unwrap();
        assert!(conn.remote_routes.is_empty());
    }

    #[test]
    fn positive_route_diff_overflow_sets_flag_but_keeps_earlier_entries() {
        let mut conn = outbound();
        let first_four: Vec<RouteRecord> = (0..4).map(|i| RouteRecord { addr: HwAddr::from_bytes([i; 6]), ping: 0, dist: 0 }).collect();
        conn.apply_route_diff(&first_four).unwrap();

        let one_more = vec![RouteRecord { addr: HwAddr::from_bytes([9; 6]), ping: 0, dist: 0 }];
        assert_eq!(conn.apply_route_diff(&one_more), Err(SoftError::RouteCapExceeded));
        assert!(conn.route_overflow);
        assert_eq!(conn.remote_routes.len(), 4);
    }

    #[test]
    fn positive_partial_write_resumes_same_buffer_on_next_writable_event() {
        let mut conn = outbound();
        let mut chan = FakeChannel::new();
        chan.script_write(WriteScript::Accept(7));
        chan.script_write(WriteScript::WantWrite);
        conn.attach_channel(chan);
        conn.advance_handshake().unwrap();

        let packet = Message::Data(bytes::Bytes::from(vec![0u8; 16]));
        conn.enqueue_data(&packet).unwrap();

        conn.on_writable().unwrap();
        assert!(conn.sending_from_data_q());
        assert_eq!(conn.channel.as_ref().unwrap().written.len(), 7);
        assert_eq!(conn.data_q.len(), 1);

        conn.on_writable().unwrap();
        // The buffer finished draining this call, so nothing is in flight
        // any more and the flag drops back to false.
        assert!(!conn.sending_from_data_q());
        assert_eq!(conn.channel.as_ref().unwrap().written.len(), 20); // header + 16-byte payload
        assert_eq!(conn.data_q.len(), 0);
    }

    #[test]
    fn positive_proto_enqueued_mid_write_does_not_interleave_with_partial_data_buffer() {
        let mut conn = outbound();
        let mut chan = FakeChannel::new();
        chan.script_write(WriteScript::Accept(7));
        chan.script_write(WriteScript::WantWrite);
        conn.attach_channel(chan);
        conn.advance_handshake().unwrap();

        let packet = Message::Data(bytes::Bytes::from(vec![0u8; 16]));
        conn.enqueue_data(&packet).unwrap();

        conn.on_writable().unwrap();
        assert_eq!(conn.channel.as_ref().unwrap().written.len(), 7);
        assert!(conn.sending_from_data_q());

        // A proto message becomes ready between writable events (e.g. a
        // pong reply, or the driver's heartbeat route-diff) while the data
        // frame is only partially written.
        conn.enqueue_proto(&Message::RouteRequest).unwrap();

        conn.on_writable().unwrap();
        let written = conn.channel.as_ref().unwrap().written.clone();
        let route_request_len = Message::RouteRequest.encode().len();
        // The data frame (20 bytes: header + 16-byte payload) must finish,
        // uninterrupted, before any proto bytes appear.
        assert_eq!(written.len(), 20 + route_request_len);
        assert_eq!(written[0], 1); // TYPE_DATA, the now-complete data frame's header
        assert_eq!(written[20], 7); // TYPE_ROUTE_REQUEST begins right after it
        assert!(!conn.sending_from_data_q());
    }

    #[test]
    fn positive_proto_queue_drains_before_data_queue() {
        let mut conn = outbound();
        conn.attach_channel(FakeChannel::new());
        conn.advance_handshake().unwrap();

        conn.enqueue_data(&Message::Data(bytes::Bytes::from_static(b"data"))).unwrap();
        conn.enqueue_proto(&Message::RouteRequest).unwrap();

        conn.on_writable().unwrap();
        let written = &conn.channel.as_ref().unwrap().written;
        // route-request header has type byte 7; data header has type byte 1.
        assert_eq!(written[0], 7);
    }

    #[test]
    fn positive_read_then_parse_full_message() {
        let mut conn = outbound();
        conn.attach_channel(FakeChannel::new());
        conn.advance_handshake().unwrap();

        let encoded = Message::Ping(3).encode();
        conn.channel.as_mut().unwrap().feed(&encoded);

        let messages = conn.on_readable().unwrap();
        assert_eq!(messages, vec![Message::Ping(3)]);
    }

    #[test]
    fn negative_oversize_frame_closes_connection() {
        let mut conn = Connection::<FakeChannel>::new_outbound(PeerId(1), "x".into(), 4, 100, 8, 8, timings());
        conn.attach_channel(FakeChannel::new());
        conn.advance_handshake().unwrap();

        let encoded = Message::Data(bytes::Bytes::from(vec![0u8; 200])).encode();
        conn.channel.as_mut().unwrap().feed(&encoded);

        assert!(conn.on_readable().is_err());
        assert_eq!(conn.state, State::Closing);
    }

    #[test]
    fn positive_close_with_reconnect_address_goes_to_retry_timeout() {
        let mut conn = outbound();
        conn.attach_channel(FakeChannel::new());
        let now = Instant::now();
        conn.close(now, true);
        assert_eq!(conn.state, State::RetryTimeout);
        assert_eq!(conn.last_retry, Some(now));
    }

    #[test]
    fn positive_close_without_retry_goes_to_closing() {
        let mut conn = inbound();
        conn.attach_channel(FakeChannel::new());
        conn.close(Instant::now(), true);
        assert_eq!(conn.state, State::Closing);
    }
}
