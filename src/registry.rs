//! Peer registry and listener set (§4.7).
//!
//! The registry owns every connection by `PeerId`; the handle index used
//! to route poll readiness events is just `mio::Token(peer_id.0)` — since
//! a `PeerId` already is a stable, never-reused `slab` index, there is no
//! separate index to keep in sync.

use mio::net::TcpListener;
use mio::Token;
use slab::Slab;

use crate::channel::SecureChannel;
use crate::connection::Connection;
use crate::peer_id::PeerId;

/// Listener tokens live in the upper half of the token space so they can
/// never collide with a `PeerId`-derived connection token.
pub const LISTENER_TOKEN_BASE: usize = usize::MAX / 2;
pub const TUNNEL_TOKEN: Token = Token(usize::MAX);

pub fn token_for_peer(id: PeerId) -> Token {
    Token(id.0)
}

pub fn peer_for_token(token: Token) -> Option<PeerId> {
    if token.0 < LISTENER_TOKEN_BASE {
        Some(PeerId(token.0))
    } else {
        None
    }
}

/// Owns every connection, keyed by `PeerId`.
pub struct PeerRegistry<C> {
    connections: Slab<Connection<C>>,
}

impl<C> PeerRegistry<C>
where
    C: SecureChannel,
{
    pub fn new() -> PeerRegistry<C> {
        PeerRegistry { connections: Slab::new() }
    }

    /// Reserve the next `PeerId` and build the connection in place, so the
    /// id assigned to the slot and the id stored on the `Connection` agree
    /// by construction.
    pub fn insert_with<F>(&mut self, build: F) -> PeerId
    where
        F: FnOnce(PeerId) -> Connection<C>,
    {
        let entry = self.connections.vacant_entry();
        let id = PeerId(entry.key());
        entry.insert(build(id));
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Connection<C>> {
        self.connections.get(id.0)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Connection<C>> {
        self.connections.get_mut(id.0)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Connection<C>> {
        if self.connections.contains(id.0) {
            Some(self.connections.remove(id.0))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Connection<C>)> {
        self.connections.iter().map(|(k, v)| (PeerId(k), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerId, &mut Connection<C>)> {
        self.connections.iter_mut().map(|(k, v)| (PeerId(k), v))
    }

    pub fn active_ids(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.state == crate::connection::State::Active)
            .map(|(k, _)| PeerId(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<C> Default for PeerRegistry<C>
where
    C: SecureChannel,
{
    fn default() -> PeerRegistry<C> {
        PeerRegistry::new()
    }
}

/// Passive bind handles. On readability each accepts one new inbound
/// connection; the registry then creates a fresh `Connection` in
/// `Accepting` and the caller begins the transport handshake.
pub struct ListenerSet {
    listeners: Vec<(Token, TcpListener)>,
}

impl ListenerSet {
    pub fn new() -> ListenerSet {
        ListenerSet { listeners: Vec::new() }
    }

    pub fn add(&mut self, listener: TcpListener) -> Token {
        let token = Token(LISTENER_TOKEN_BASE + self.listeners.len());
        self.listeners.push((token, listener));
        token
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (Token, TcpListener)> {
        self.listeners.iter_mut()
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut TcpListener> {
        self.listeners.iter_mut().find(|(t, _)| *t == token).map(|(_, l)| l)
    }

    pub fn is_listener_token(token: Token) -> bool {
        token.0 >= LISTENER_TOKEN_BASE && token != TUNNEL_TOKEN
    }
}

impl Default for ListenerSet {
    fn default() -> ListenerSet {
        ListenerSet::new()
    }
}
