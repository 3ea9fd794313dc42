//! Acquire/release block transfer shared by ring buffers, FIFOs and ports.
//!
//! ```text
//! producer: acquire_write(blk, n) → fill blk.buf → release_write(blk)
//! consumer: acquire_read(blk, n)  → use blk.data() → release_read(blk)
//! ```
//!
//! `RingBuffer` copies bytes in and out of its own arena. `Fifo` hands the
//! node buffers themselves through `Block::buf`, so a block acquired from a
//! FIFO must be released back to the same FIFO.

pub mod fifo;
pub mod ring_buffer;

pub use fifo::Fifo;
pub use ring_buffer::RingBuffer;

use crate::error::Result;
use crate::sync::Wait;

/// A unit of data moving across a bus or port.
#[derive(Debug, Default, Clone)]
pub struct Block {
    /// Backing storage. Its length is the usable capacity.
    pub buf: Vec<u8>,
    /// Bytes of `buf` holding payload.
    pub valid_size: usize,
    /// Set by the producer on its final block, or by a reader that hit
    /// end-of-stream.
    pub is_last: bool,
}

impl Block {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            valid_size: 0,
            is_last: false,
        }
    }

    /// Wrap existing payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            valid_size: bytes.len(),
            is_last: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.valid_size.min(self.buf.len())]
    }

    /// Grow the backing storage to at least `len` bytes.
    pub fn ensure_len(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }
}

/// Contract implemented by every blocking transfer object.
pub trait DataBus: Send + Sync {
    /// Read up to `wanted` bytes (ring) or one block (FIFO) into `blk`.
    ///
    /// # Errors
    /// `Timeout` when `wait` expires, `Aborted` after `abort()`.
    fn acquire_read(&self, blk: &mut Block, wanted: usize, wait: Wait) -> Result<()>;

    /// Give a block obtained by `acquire_read` back to the bus.
    fn release_read(&self, blk: &mut Block, wait: Wait) -> Result<()>;

    /// Prepare `blk` with room for `wanted` bytes.
    fn acquire_write(&self, blk: &mut Block, wanted: usize, wait: Wait) -> Result<()>;

    /// Commit `blk.valid_size` bytes. `blk.is_last` marks end-of-stream.
    fn release_write(&self, blk: &mut Block, wait: Wait) -> Result<()>;

    /// Mark the producer side finished. Readers drain the rest and then see
    /// `is_last` instead of blocking.
    fn done_write(&self);

    fn reset_done_write(&self);

    /// Wake every blocked reader and writer with `Aborted`. Idempotent.
    fn abort(&self);

    /// Drop buffered content and clear done/abort flags without reallocating.
    fn reset(&self);

    /// Capacity in the bus's own unit (bytes for rings, blocks for FIFOs).
    fn total_size(&self) -> usize;

    fn filled_size(&self) -> usize;

    fn free_size(&self) -> usize;
}
