//! Bounded, gather-style outbound byte queue backing one connection's
//! protocol or data channel.
//!
//! Each enqueued packet is already a single contiguous, pre-encoded buffer
//! (see `codec::Message::encode`), so draining the queue is a sequence of
//! plain `write`s with no scatter/gather needed on the channel side.

use std::collections::VecDeque;

use bytes::Bytes;

/// A bounded FIFO of pre-encoded outbound buffers.
pub struct SendQueue {
    queue: VecDeque<Bytes>,
    cap: usize,
    /// Byte offset already written out of the buffer at the front of the
    /// queue, so a partial write resumes from the same position.
    sent_offset: usize,
}

impl SendQueue {
    pub fn new(cap: usize) -> SendQueue {
        SendQueue { queue: VecDeque::new(), cap, sent_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.queue.len() < self.cap
    }

    /// Enqueue a buffer. Returns `false` (drop) if the queue is at capacity;
    /// the caller decides whether that is fatal (protocol queue) or benign
    /// (data queue).
    #[must_use]
    pub fn push(&mut self, buf: Bytes) -> bool {
        if !self.has_room() {
            return false;
        }
        self.queue.push_back(buf);
        true
    }

    /// The bytes of the in-flight buffer not yet written.
    pub fn front_remaining(&self) -> Option<&[u8]> {
        self.queue.front().map(|buf| &buf[self.sent_offset..])
    }

    /// Record that `n` bytes of the front buffer were successfully written.
    /// Pops the buffer once it is fully drained.
    pub fn advance(&mut self, n: usize) {
        self.sent_offset += n;
        if let Some(front) = self.queue.front() {
            if self.sent_offset >= front.len() {
                self.queue.pop_front();
                self.sent_offset = 0;
            }
        }
    }
}
