//! Bounded outbound queue.

use std::collections::VecDeque;

use bytes::Bytes;

/// FIFO of outbound chunks with a hard cap on queued bytes.
///
/// Concurrent `send` calls compose through this queue: whoever finds it empty
/// starts the transport write, everyone else rides along on the next one.
#[derive(Debug)]
pub struct ByteQueue {
    chunks: VecDeque<Bytes>,
    /// Bytes of the front chunk already written.
    front_offset: usize,
    queued: usize,
    max_bytes: usize,
}

impl ByteQueue {
    /// Create an empty queue that never holds more than `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            front_offset: 0,
            queued: 0,
            max_bytes,
        }
    }

    /// Append `data` to the tail.
    ///
    /// Returns `false`, leaving the queue untouched, if the append would
    /// exceed the cap.
    pub fn append(&mut self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        if self.queued + data.len() > self.max_bytes {
            return false;
        }
        self.queued += data.len();
        self.chunks.push_back(data);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Bytes accepted by `append` and not yet consumed.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Bytes still owed to the transport.
    pub fn size_to_write(&self) -> usize {
        self.queued
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// The contiguous slice the next transport write should send.
    pub fn chunk(&self) -> &[u8] {
        match self.chunks.front() {
            Some(front) => &front[self.front_offset..],
            None => &[],
        }
    }

    /// Drop `n` bytes from the front after the transport accepted them.
    ///
    /// # Panics
    /// If `n` exceeds [`size_to_write`](Self::size_to_write).
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.size_to_write(),
            "consumed {n} bytes but only {} were queued",
            self.size_to_write()
        );

        self.queued -= n;
        let mut left = n;
        while left > 0 {
            let front_len = self.chunks.front().map_or(0, |c| c.len()) - self.front_offset;
            if left < front_len {
                self.front_offset += left;
                return;
            }
            left -= front_len;
            self.chunks.pop_front();
            self.front_offset = 0;
        }
    }
}
