//! Link-layer addressing.

use std::fmt;

/// Length in bytes of a hardware (link-layer) address.
pub const HWADDR_LEN: usize = 6;

/// An opaque 6-byte link-layer identifier used as a routing key.
///
/// Equality and ordering are byte-lexicographic, which is all the route
/// table needs: addresses are never interpreted, only compared and hashed.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct HwAddr {
    addr: [u8; HWADDR_LEN],
}

impl HwAddr {
    /// Build a `HwAddr` directly from its six bytes.
    pub fn from_bytes(addr: [u8; HWADDR_LEN]) -> HwAddr {
        HwAddr { addr }
    }

    /// Build a `HwAddr` from a slice, failing if it isn't exactly
    /// `HWADDR_LEN` bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<HwAddr> {
        if bytes.len() != HWADDR_LEN {
            return None;
        }

        let mut addr = [0u8; HWADDR_LEN];
        addr.copy_from_slice(bytes);

        Some(HwAddr { addr })
    }

    /// The broadcast address `ff:ff:ff:ff:ff:ff`.
    pub fn broadcast() -> HwAddr {
        HwAddr { addr: [0xff; HWADDR_LEN] }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == HwAddr::broadcast()
    }
}

impl AsRef<[u8]> for HwAddr {
    fn as_ref(&self) -> &[u8] {
        &self.addr
    }
}

impl From<[u8; HWADDR_LEN]> for HwAddr {
    fn from(addr: [u8; HWADDR_LEN]) -> HwAddr {
        HwAddr { addr }
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3], self.addr[4], self.addr[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_roundtrip_bytes() {
        let addr = HwAddr::from_bytes([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(addr.as_ref(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn negative_from_slice_wrong_length() {
        assert!(HwAddr::from_slice(&[1, 2, 3]).is_none());
    }

    #[test]
    fn positive_ordering_is_lexicographic() {
        let a = HwAddr::from_bytes([0, 0, 0, 0, 0, 1]);
        let b = HwAddr::from_bytes([0, 0, 0, 0, 0, 2]);
        assert!(a < b);
    }

    #[test]
    fn positive_display_format() {
        let addr = HwAddr::from_bytes([0xaa; 6]);
        assert_eq!(addr.to_string(), "aa:aa:aa:aa:aa:aa");
    }

    #[test]
    fn positive_broadcast() {
        assert!(HwAddr::broadcast().is_broadcast());
        assert!(!HwAddr::from_bytes([1, 2, 3, 4, 5, 6]).is_broadcast());
    }
}
