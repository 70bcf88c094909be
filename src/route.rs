//! Distance-vector route table (§4.5).
//!
//! A single process-wide table maps `HwAddr -> (via, cost)`. Recomputation
//! walks every active peer's remote routes plus local evidence and keeps
//! the minimum-cost candidate per address, tie-breaking on the smallest
//! `PeerId` (local evidence always wins a tie, since it is cheaper to ship
//! out locally than to hand back to the peer that taught it to us).

use std::collections::HashMap;

use crate::hwaddr::HwAddr;
use crate::peer_id::PeerId;

/// Who a route entry is reachable through.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Via {
    /// Learned from the local tunnel interface.
    Local,
    /// Reachable by forwarding to this peer.
    Peer(PeerId),
}

impl Via {
    /// Ordering used only to break cost ties: `Local` sorts before any
    /// `Peer`, and `Peer`s sort by ascending `PeerId`.
    fn tie_break_key(self) -> (u8, usize) {
        match self {
            Via::Local => (0, 0),
            Via::Peer(id) => (1, id.0),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RouteEntry {
    pub via: Via,
    pub cost: u32,
    /// Hop distance from the local node, advertised outward as the `dist`
    /// field of a route record so the next hop can add its own penalty.
    pub dist: u16,
}

/// A single candidate considered during recomputation: a peer's own ping
/// plus one entry from that peer's reported remote routes, or a piece of
/// local evidence.
pub struct Candidate {
    pub addr: HwAddr,
    pub via: Via,
    pub cost: u32,
    pub dist: u16,
}

/// One accumulated change since the last flush, ready to become a
/// route-diff wire record.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RouteChange {
    pub addr: HwAddr,
    /// `None` means the address was withdrawn entirely.
    pub entry: Option<RouteEntry>,
}

pub const HOP_PENALTY_DEFAULT: u32 = 1;

/// Compute the cost of a remote candidate per §4.5's formula.
pub fn remote_cost(via_peer_ping: u32, reported_ping: u32, dist: u16, hop_penalty: u32) -> u32 {
    via_peer_ping
        .saturating_add(reported_ping)
        .saturating_add((dist as u32).saturating_mul(hop_penalty))
}

pub struct RouteTable {
    entries: HashMap<HwAddr, RouteEntry>,
    /// Accumulated since the last flush; cleared by `take_pending_diff`.
    pending: Vec<RouteChange>,
    /// Threshold beyond which a full route-set should be sent instead of
    /// the accumulated diff (caller's responsibility to check).
    pub route_set_threshold: usize,
}

impl RouteTable {
    pub fn new(route_set_threshold: usize) -> RouteTable {
        RouteTable { entries: HashMap::new(), pending: Vec::new(), route_set_threshold }
    }

    pub fn get(&self, addr: &HwAddr) -> Option<&RouteEntry> {
        self.entries.get(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HwAddr, &RouteEntry)> {
        self.entries.iter()
    }

    /// Recompute the table from scratch given every current candidate
    /// (local evidence and every active peer's remote routes, already
    /// costed by the caller). Accumulates the resulting changes; does not
    /// clear table entries that have no candidate until a later pass that
    /// passes an empty candidate set for that address — callers pass the
    /// full candidate set every time, so omission is withdrawal.
    pub fn recompute<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = Candidate>,
    {
        let mut best: HashMap<HwAddr, RouteEntry> = HashMap::new();

        for c in candidates {
            best.entry(c.addr)
                .and_modify(|cur| {
                    if c.cost < cur.cost
                        || (c.cost == cur.cost && c.via.tie_break_key() < cur.via.tie_break_key())
                    {
                        *cur = RouteEntry { via: c.via, cost: c.cost, dist: c.dist };
                    }
                })
                .or_insert(RouteEntry { via: c.via, cost: c.cost, dist: c.dist });
        }

        // Changed or new entries.
        for (addr, entry) in &best {
            match self.entries.get(addr) {
                Some(old) if old == entry => {}
                _ => self.pending.push(RouteChange { addr: *addr, entry: Some(*entry) }),
            }
        }
        // Withdrawn entries.
        for addr in self.entries.keys() {
            if !best.contains_key(addr) {
                self.pending.push(RouteChange { addr: *addr, entry: None });
            }
        }

        self.entries = best;
    }

    /// Remove every entry learned via `peer` (called when a peer
    /// disconnects); equivalent to that peer withdrawing all its routes.
    pub fn withdraw_via(&mut self, peer: PeerId) {
        let doomed: Vec<HwAddr> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.via == Via::Peer(peer))
            .map(|(addr, _)| *addr)
            .collect();

        for addr in doomed {
            self.entries.remove(&addr);
            self.pending.push(RouteChange { addr, entry: None });
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the accumulated diff is large enough that a full route-set
    /// should be sent instead (§4.5).
    pub fn should_send_full_set(&self) -> bool {
        self.pending.len() > self.route_set_threshold
    }

    /// Drain and return the accumulated changes since the last flush.
    pub fn take_pending_diff(&mut self) -> Vec<RouteChange> {
        std::mem::take(&mut self.pending)
    }
}
