//! Adapter over the secure transport primitive (§6 of the design).
//!
//! The transport itself — handshake, encryption, framing of its own
//! record layer — is an external collaborator; this module only maps its
//! `WantRead`/`WantWrite` signals onto `mio` poll interest so the
//! connection state machine never has to know which condition caused a
//! suspension.

use std::io;

/// Outcome of a handshake step, read, or write against the secure channel.
#[derive(Debug)]
pub enum ChannelStatus<T> {
    /// The operation completed; for read/write, carries the byte count.
    Ready(T),
    /// The operation needs the handle to become readable before retrying.
    WantRead,
    /// The operation needs the handle to become writable before retrying.
    WantWrite,
    /// The channel was closed, cleanly or not.
    Closed,
    /// An unrecoverable I/O error occurred.
    Err(io::Error),
}

/// Minimal contract a secure transport primitive must expose. A real
/// implementation wraps TLS, noise, or whatever handshake/record protocol
/// the deployment requires; `handshake_step` is called repeatedly by the
/// connection state machine until it reports `Ready`.
pub trait SecureChannel {
    /// Advance the handshake. `Ready(())` means the channel is now active.
    fn handshake_step(&mut self) -> ChannelStatus<()>;

    /// Read decrypted bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> ChannelStatus<usize>;

    /// Write `buf`, encrypting as needed.
    fn write(&mut self, buf: &[u8]) -> ChannelStatus<usize>;

    /// Begin an orderly shutdown of the channel.
    fn shutdown(&mut self);
}

/// A transport primitive that performs no handshake and no encryption.
///
/// Used to wire the daemon end-to-end (and in tests) without pulling in a
/// concrete TLS/noise stack, which is explicitly out of this design's
/// scope; real deployments plug in a `SecureChannel` backed by one.
pub struct PlaintextChannel<S> {
    stream: S,
    handshaken: bool,
}

impl<S> PlaintextChannel<S> {
    pub fn new(stream: S) -> PlaintextChannel<S> {
        PlaintextChannel { stream, handshaken: false }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Direct access to the underlying transport, for reregistering it
    /// against the poll handle on an interest change.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S> SecureChannel for PlaintextChannel<S>
where
    S: io::Read + io::Write,
{
    fn handshake_step(&mut self) -> ChannelStatus<()> {
        self.handshaken = true;
        ChannelStatus::Ready(())
    }

    fn read(&mut self, buf: &mut [u8]) -> ChannelStatus<usize> {
        match self.stream.read(buf) {
            Ok(0) => ChannelStatus::Closed,
            Ok(n) => ChannelStatus::Ready(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ChannelStatus::WantRead,
            Err(e) => ChannelStatus::Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> ChannelStatus<usize> {
        match self.stream.write(buf) {
            Ok(0) if !buf.is_empty() => ChannelStatus::Closed,
            Ok(n) => ChannelStatus::Ready(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ChannelStatus::WantWrite,
            Err(e) => ChannelStatus::Err(e),
        }
    }

    fn shutdown(&mut self) {}
}

/// A scriptable secure channel for tests: reads come from a preloaded
/// buffer, writes are recorded, and both can be made to return partial
/// results or `WantRead`/`WantWrite` on demand so the connection state
/// machine's backpressure and partial-write handling can be exercised
/// deterministically (see the S6 scenario).
/// One scripted outcome for a future `FakeChannel::write` call.
#[derive(Copy, Clone, Debug)]
pub enum WriteScript {
    /// Accept at most this many bytes of whatever is offered.
    Accept(usize),
    /// Accept nothing this call, as if the socket buffer were full.
    WantWrite,
}

pub struct FakeChannel {
    handshake_steps_remaining: u32,
    inbound: std::collections::VecDeque<u8>,
    pub written: Vec<u8>,
    /// Consumed front-to-back, one entry per `write` call; once empty,
    /// `write` accepts the whole buffer every time.
    pub write_script: std::collections::VecDeque<WriteScript>,
    pub closed: bool,
}

impl FakeChannel {
    pub fn new() -> FakeChannel {
        FakeChannel {
            handshake_steps_remaining: 0,
            inbound: std::collections::VecDeque::new(),
            written: Vec::new(),
            write_script: std::collections::VecDeque::new(),
            closed: false,
        }
    }

    /// Make the handshake take `steps` calls to `handshake_step` before
    /// reporting `Ready`.
    pub fn with_handshake_steps(mut self, steps: u32) -> FakeChannel {
        self.handshake_steps_remaining = steps;
        self
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    pub fn script_write(&mut self, outcome: WriteScript) {
        self.write_script.push_back(outcome);
    }
}

impl SecureChannel for FakeChannel {
    fn handshake_step(&mut self) -> ChannelStatus<()> {
        if self.handshake_steps_remaining == 0 {
            ChannelStatus::Ready(())
        } else {
            self.handshake_steps_remaining -= 1;
            ChannelStatus::WantRead
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> ChannelStatus<usize> {
        if self.inbound.is_empty() {
            return ChannelStatus::WantRead;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        ChannelStatus::Ready(n)
    }

    fn write(&mut self, buf: &[u8]) -> ChannelStatus<usize> {
        if self.closed {
            return ChannelStatus::Closed;
        }
        match self.write_script.pop_front() {
            Some(WriteScript::WantWrite) => ChannelStatus::WantWrite,
            Some(WriteScript::Accept(limit)) => {
                let n = limit.min(buf.len());
                self.written.extend_from_slice(&buf[..n]);
                ChannelStatus::Ready(n)
            }
            None => {
                self.written.extend_from_slice(buf);
                ChannelStatus::Ready(buf.len())
            }
        }
    }

    fn shutdown(&mut self) {
        self.closed = true;
    }
}

impl Default for FakeChannel {
    fn default() -> FakeChannel {
        FakeChannel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn positive_handshake_is_immediately_ready() {
        let mut chan = PlaintextChannel::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(chan.handshake_step(), ChannelStatus::Ready(())));
    }

}
