//! Fixed-capacity byte ring with blocking handoff.
//!
//! One reader and one writer at a time. A mutex serialises cursor updates and
//! two binary semaphores (`can_read`, `can_write`) park the blocked side.
//!
//! Partial reads are rounded down to a multiple of 4 bytes so a word-oriented
//! sink never receives a torn sample frame. The rounding is skipped once the
//! producer has called `done_write` (the tail is drained as-is) and when the
//! whole request is already buffered.

use parking_lot::Mutex;
use tracing::debug;

use super::{Block, DataBus};
use crate::error::{Result, SpeakerError};
use crate::sync::{BinarySemaphore, Wait};

struct Cursor {
    arena: Vec<u8>,
    rd: usize,
    wr: usize,
    fill: usize,
    done_write: bool,
    abort_read: bool,
    abort_write: bool,
}

impl Cursor {
    fn copy_out(&mut self, dst: &mut [u8]) {
        let size = self.arena.len();
        let n = dst.len();
        let first = n.min(size - self.rd);
        dst[..first].copy_from_slice(&self.arena[self.rd..self.rd + first]);
        dst[first..].copy_from_slice(&self.arena[..n - first]);
        self.rd = (self.rd + n) % size;
        self.fill -= n;
    }

    fn copy_in(&mut self, src: &[u8]) {
        let size = self.arena.len();
        let n = src.len();
        let first = n.min(size - self.wr);
        self.arena[self.wr..self.wr + first].copy_from_slice(&src[..first]);
        self.arena[..n - first].copy_from_slice(&src[first..]);
        self.wr = (self.wr + n) % size;
        self.fill += n;
    }
}

/// Byte-oriented circular buffer implementing [`DataBus`].
pub struct RingBuffer {
    cursor: Mutex<Cursor>,
    can_read: BinarySemaphore,
    can_write: BinarySemaphore,
    size: usize,
}

impl RingBuffer {
    /// Allocate a ring of `block_size × n_blocks` bytes.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero or overflowing capacity.
    pub fn new(block_size: usize, n_blocks: usize) -> Result<Self> {
        let size = block_size
            .checked_mul(n_blocks)
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                SpeakerError::InvalidArgument(format!(
                    "ring capacity {block_size}x{n_blocks} is not usable"
                ))
            })?;
        Ok(Self {
            cursor: Mutex::new(Cursor {
                arena: vec![0; size],
                rd: 0,
                wr: 0,
                fill: 0,
                done_write: false,
                abort_read: false,
                abort_write: false,
            }),
            can_read: BinarySemaphore::new(),
            can_write: BinarySemaphore::new(),
            size,
        })
    }

    /// Convenience wrapper: read exactly `dst.len()` bytes unless the stream
    /// ends first. Returns the number of bytes copied.
    pub fn read(&self, dst: &mut [u8], wait: Wait) -> Result<usize> {
        let mut blk = Block::with_capacity(dst.len());
        self.acquire_read(&mut blk, dst.len(), wait)?;
        let n = blk.valid_size;
        dst[..n].copy_from_slice(&blk.buf[..n]);
        Ok(n)
    }

    /// Convenience wrapper around `release_write` for a plain slice.
    pub fn write(&self, src: &[u8], wait: Wait) -> Result<()> {
        let mut blk = Block::from_bytes(src);
        self.release_write(&mut blk, wait)
    }

    pub fn is_done_write(&self) -> bool {
        self.cursor.lock().done_write
    }
}

impl DataBus for RingBuffer {
    fn acquire_read(&self, blk: &mut Block, wanted: usize, wait: Wait) -> Result<()> {
        blk.ensure_len(wanted);
        blk.is_last = false;
        let mut total = 0usize;
        let mut result = Ok(());

        while total < wanted {
            let mut cur = self.cursor.lock();
            let remaining = wanted - total;
            let n = if cur.fill < remaining {
                let aligned = cur.fill & !3;
                if aligned == 0 && cur.done_write {
                    cur.fill
                } else {
                    aligned
                }
            } else {
                remaining
            };

            if n == 0 {
                if cur.done_write {
                    blk.is_last = true;
                    break;
                }
                if cur.abort_read {
                    result = Err(SpeakerError::Aborted);
                    break;
                }
                drop(cur);
                self.can_write.give();
                if !self.can_read.take(wait) {
                    result = Err(SpeakerError::Timeout);
                    break;
                }
                continue;
            }

            cur.copy_out(&mut blk.buf[total..total + n]);
            total += n;
        }

        if total > 0 {
            self.can_write.give();
        }
        blk.valid_size = total;
        result
    }

    fn release_read(&self, _blk: &mut Block, _wait: Wait) -> Result<()> {
        Ok(())
    }

    fn acquire_write(&self, blk: &mut Block, wanted: usize, _wait: Wait) -> Result<()> {
        blk.ensure_len(wanted);
        blk.valid_size = 0;
        blk.is_last = false;
        Ok(())
    }

    fn release_write(&self, blk: &mut Block, wait: Wait) -> Result<()> {
        let data = blk.data();
        let mut written = 0usize;
        let mut result = Ok(());

        while written < data.len() {
            let mut cur = self.cursor.lock();
            let n = (self.size - cur.fill).min(data.len() - written);
            if n == 0 {
                if cur.done_write {
                    debug!("ring write after done_write, dropping tail");
                    break;
                }
                if cur.abort_write {
                    result = Err(SpeakerError::Aborted);
                    break;
                }
                drop(cur);
                self.can_read.give();
                if !self.can_write.take(wait) {
                    result = Err(SpeakerError::Timeout);
                    break;
                }
                continue;
            }
            cur.copy_in(&data[written..written + n]);
            written += n;
        }

        if written > 0 {
            self.can_read.give();
            if written < data.len() {
                debug!(written, wanted = data.len(), "ring write completed partially");
            }
            result = Ok(());
        }
        if blk.is_last {
            self.done_write();
            result = Ok(());
        }
        result
    }

    fn done_write(&self) {
        self.cursor.lock().done_write = true;
        self.can_read.give();
    }

    fn reset_done_write(&self) {
        self.cursor.lock().done_write = false;
    }

    fn abort(&self) {
        {
            let mut cur = self.cursor.lock();
            cur.abort_read = true;
            cur.abort_write = true;
        }
        self.can_read.give();
        self.can_write.give();
    }

    fn reset(&self) {
        let mut cur = self.cursor.lock();
        cur.rd = 0;
        cur.wr = 0;
        cur.fill = 0;
        cur.done_write = false;
        cur.abort_read = false;
        cur.abort_write = false;
    }

    fn total_size(&self) -> usize {
        self.size
    }

    fn filled_size(&self) -> usize {
        self.cursor.lock().fill
    }

    fn free_size(&self) -> usize {
        self.size - self.cursor.lock().fill
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &self.size)
            .field("filled", &self.filled_size())
            .finish_non_exhaustive()
    }
}
