//! Ordered overflow buffer.
//!
//! Holds chunks that were read while the outbound side could not take them.
//! Chunks leave in exactly the order they arrived.
//!
//! The buffer may carry a soft byte limit. A chunk that has already been read
//! is always accepted, so the limit never drops data; it only tells the relay
//! to stop reading until the buffer drains below it.

use bytes::Bytes;
use std::collections::VecDeque;

/// FIFO of byte chunks awaiting the outbound side.
#[derive(Debug, Default)]
pub struct Overflow {
    chunks: VecDeque<Bytes>,
    /// Bytes currently queued.
    bytes: usize,
    /// Soft limit in bytes (`None` = unbounded).
    limit: Option<usize>,
    /// Largest number of bytes ever queued at once.
    high_water: usize,
}

impl Overflow {
    /// Create a buffer with an optional soft byte limit.
    ///
    /// A limit of `Some(0)` is treated as unbounded.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            limit: limit.filter(|&l| l > 0),
            ..Self::default()
        }
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.high_water = self.high_water.max(self.bytes);
        self.chunks.push_back(chunk);
    }

    /// Remove the oldest chunk.
    pub fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Number of queued bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// True when the soft limit has been reached.
    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.bytes >= limit)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    /// Iterate queued chunks, oldest first.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }
}
