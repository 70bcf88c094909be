//! Process-local peer identity.
//!
//! A `PeerId` is assigned on connection creation and is stable for the
//! connection's lifetime; it is never reused while the connection exists.
//! It is backed directly by a `slab::Slab` index (see `registry`), which
//! gives exactly that guarantee for free: the index is only handed back
//! out once the prior occupant has been removed.

use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(pub usize);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

impl From<usize> for PeerId {
    fn from(id: usize) -> PeerId {
        PeerId(id)
    }
}
