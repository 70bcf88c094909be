//! The local tunnel interface contract (§6).
//!
//! The concrete tun/tap device is platform-specific and explicitly out of
//! this design's testable surface; the core only depends on this trait, so
//! it can be driven by a fake in tests.

use std::io;

use bytes::Bytes;

use crate::hwaddr::HwAddr;

/// Outcome of a non-blocking tunnel read or write.
#[derive(Debug)]
pub enum TunnelStatus<T> {
    Ready(T),
    WouldBlock,
    Err(io::Error),
}

/// Duplex source/sink of layer-2 frames with a poll handle.
pub trait TunnelInterface {
    /// The link-layer addresses this interface advertises; these become
    /// local route entries with `(ping=0, dist=0)`.
    fn local_addrs(&self) -> &[HwAddr];

    fn read_frame(&mut self) -> TunnelStatus<Bytes>;

    fn write_frame(&mut self, frame: &[u8]) -> TunnelStatus<()>;
}

/// An in-memory stand-in for a tun/tap device, used in tests to drive and
/// observe frames without real hardware.
pub struct FakeTunnel {
    addrs: Vec<HwAddr>,
    inbound: std::collections::VecDeque<Bytes>,
    delivered: Vec<Bytes>,
}

impl FakeTunnel {
    pub fn new(addrs: Vec<HwAddr>) -> FakeTunnel {
        FakeTunnel { addrs, inbound: std::collections::VecDeque::new(), delivered: Vec::new() }
    }

    /// Queue a frame as if it arrived from the local OS network stack.
    pub fn inject(&mut self, frame: &[u8]) {
        self.inbound.push_back(Bytes::copy_from_slice(frame));
    }

    /// Frames the core has delivered to this interface, in order.
    pub fn delivered(&self) -> &[Bytes] {
        &self.delivered
    }
}

impl TunnelInterface for FakeTunnel {
    fn local_addrs(&self) -> &[HwAddr] {
        &self.addrs
    }

    fn read_frame(&mut self) -> TunnelStatus<Bytes> {
        match self.inbound.pop_front() {
            Some(frame) => TunnelStatus::Ready(frame),
            None => TunnelStatus::WouldBlock,
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> TunnelStatus<()> {
        self.delivered.push(Bytes::copy_from_slice(frame));
        TunnelStatus::Ready(())
    }
}

/// A tunnel that never has traffic: no local addresses, every read is
/// `WouldBlock`, every write is silently dropped. Real tun/tap device
/// creation is platform-specific and explicitly outside this design's
/// testable surface (§1); this stands in for it so the daemon still runs
/// end-to-end (peer connections and routing function, just with nothing
/// arriving from or delivered to a local interface) until a real adapter
/// is wired in for a given platform.
pub struct NullTunnel;

impl TunnelInterface for NullTunnel {
    fn local_addrs(&self) -> &[HwAddr] {
        &[]
    }

    fn read_frame(&mut self) -> TunnelStatus<Bytes> {
        TunnelStatus::WouldBlock
    }

    fn write_frame(&mut self, _frame: &[u8]) -> TunnelStatus<()> {
        TunnelStatus::Ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_inject_then_read() {
        let mut tun = FakeTunnel::new(vec![HwAddr::from_bytes([1; 6])]);
        tun.inject(b"frame");
        assert!(matches!(tun.read_frame(), TunnelStatus::Ready(f) if &f[..] == b"frame"));
        assert!(matches!(tun.read_frame(), TunnelStatus::WouldBlock));
    }

    #[test]
    fn positive_write_is_recorded() {
        let mut tun = FakeTunnel::new(vec![]);
        assert!(matches!(tun.write_frame(b"out"), TunnelStatus::Ready(())));
        assert_eq!(tun.delivered(), &[Bytes::from_static(b"out")]);
    }
}
