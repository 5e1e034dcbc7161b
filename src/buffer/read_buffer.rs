//! Growable receive buffer.

use crate::error::NetError;

/// Capacity never shrinks below this many bytes.
const MIN_CAPACITY: usize = 128;
const GROWTH_FACTOR: usize = 2;

/// Size policy for a [`ReadBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBufferLimits {
    /// Capacity allocated up front.
    pub initial: usize,
    /// Ceiling for [`ReadBuffer::increase_capacity`].
    pub max: usize,
}

impl Default for ReadBufferLimits {
    fn default() -> Self {
        Self {
            initial: 1024,
            max: 1024 * 1024,
        }
    }
}

/// Contiguous receive buffer.
///
/// ```text
/// 0            size()                capacity()
/// |  valid data  |  remaining capacity  |
/// ```
///
/// Unconsumed bytes always start at offset 0, so a partially consumed
/// message is presented again together with whatever the next read appends.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    storage: Vec<u8>,
    len: usize,
    max_capacity: usize,
}

impl ReadBuffer {
    pub fn new(limits: ReadBufferLimits) -> Self {
        let initial = limits.initial.min(limits.max);
        Self {
            storage: vec![0; initial],
            len: 0,
            max_capacity: limits.max,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.storage.len() - self.len
    }

    /// Grow the buffer by [`GROWTH_FACTOR`], clamped to the ceiling.
    ///
    /// Returns the new capacity, or `ReadBufferExhausted` when the buffer is
    /// already at its ceiling.
    pub fn increase_capacity(&mut self) -> Result<usize, NetError> {
        let capacity = self.capacity();
        if capacity >= self.max_capacity {
            return Err(NetError::ReadBufferExhausted {
                limit: self.max_capacity,
            });
        }
        let grown = (capacity * GROWTH_FACTOR)
            .max(MIN_CAPACITY)
            .min(self.max_capacity);
        self.storage.resize(grown, 0);
        Ok(grown)
    }

    /// Destination for the next transport read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.len..]
    }

    /// Mark `n` freshly written bytes after the valid region as valid.
    ///
    /// # Panics
    /// If `n` exceeds the remaining capacity.
    pub fn did_read(&mut self, n: usize) {
        assert!(
            n <= self.remaining_capacity(),
            "read {n} bytes into {} bytes of spare capacity",
            self.remaining_capacity()
        );
        self.len += n;
    }

    /// Drop `n` bytes from the front of the valid region.
    ///
    /// # Panics
    /// If `n` exceeds [`size`](Self::size).
    pub fn did_consume(&mut self, n: usize) {
        assert!(n <= self.len, "consumed {n} bytes of {}", self.len);

        let previous = self.len;
        self.storage.copy_within(n..previous, 0);
        self.len = previous - n;

        // A burst may have grown the buffer well past what steady traffic needs.
        let capacity = self.capacity();
        if capacity > MIN_CAPACITY && capacity > previous * GROWTH_FACTOR {
            let shrunk = (previous * GROWTH_FACTOR).max(MIN_CAPACITY);
            self.storage.truncate(shrunk);
            self.storage.shrink_to_fit();
        }
    }

    /// Valid, unconsumed bytes starting at offset 0.
    pub fn data(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
