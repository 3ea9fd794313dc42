//! Multi-block bounded queue.
//!
//! Nodes are allocated lazily up to `block_count` and then recycled. Node
//! buffers move through [`Block::buf`] by value, so the payload is never
//! copied between producer and consumer.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use super::{Block, DataBus};
use crate::error::{Result, SpeakerError};
use crate::sync::Wait;

const DEFAULT_ALIGN: usize = 16;

struct Filled {
    buf: Vec<u8>,
    valid_size: usize,
    is_last: bool,
}

struct Nodes {
    capacity: usize,
    allocated: usize,
    empty: VecDeque<Vec<u8>>,
    filled: VecDeque<Filled>,
    reading: usize,
    writing: usize,
    write_done: bool,
    aborted: bool,
    align: usize,
}

/// Block FIFO implementing [`DataBus`]. Sizes are counted in blocks.
pub struct Fifo {
    nodes: Mutex<Nodes>,
    changed: Condvar,
}

impl Fifo {
    /// # Errors
    /// `InvalidArgument` when `block_count` is zero.
    pub fn new(block_count: usize) -> Result<Self> {
        if block_count == 0 {
            return Err(SpeakerError::InvalidArgument(
                "fifo needs at least one block".into(),
            ));
        }
        Ok(Self {
            nodes: Mutex::new(Nodes {
                capacity: block_count,
                allocated: 0,
                empty: VecDeque::new(),
                filled: VecDeque::new(),
                reading: 0,
                writing: 0,
                write_done: false,
                aborted: false,
                align: DEFAULT_ALIGN,
            }),
            changed: Condvar::new(),
        })
    }

    /// Round fresh node allocations up to `align` bytes (0 restores the default).
    pub fn set_align(&self, align: usize) {
        self.nodes.lock().align = if align == 0 { DEFAULT_ALIGN } else { align };
    }

    fn park(&self, nodes: &mut MutexGuard<'_, Nodes>, deadline: Option<Instant>) -> Result<()> {
        match deadline {
            None => {
                self.changed.wait(nodes);
                Ok(())
            }
            Some(at) => {
                if self.changed.wait_until(nodes, at).timed_out() {
                    Err(SpeakerError::Timeout)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl DataBus for Fifo {
    fn acquire_read(&self, blk: &mut Block, _wanted: usize, wait: Wait) -> Result<()> {
        let deadline = wait.deadline();
        let mut nodes = self.nodes.lock();
        loop {
            if nodes.aborted {
                return Err(SpeakerError::Aborted);
            }
            if let Some(node) = nodes.filled.pop_front() {
                nodes.reading += 1;
                blk.buf = node.buf;
                blk.valid_size = node.valid_size;
                blk.is_last = node.is_last;
                trace!(valid = blk.valid_size, "fifo read acquired");
                return Ok(());
            }
            if nodes.write_done {
                blk.valid_size = 0;
                blk.is_last = true;
                return Ok(());
            }
            if let Err(e) = self.park(&mut nodes, deadline) {
                if nodes.filled.is_empty() && !nodes.aborted && !nodes.write_done {
                    return Err(e);
                }
            }
        }
    }

    fn release_read(&self, blk: &mut Block, _wait: Wait) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.reading == 0 {
            return Err(SpeakerError::InvalidState(
                "fifo release_read without acquire".into(),
            ));
        }
        nodes.reading -= 1;
        nodes.empty.push_back(std::mem::take(&mut blk.buf));
        blk.valid_size = 0;
        self.changed.notify_all();
        Ok(())
    }

    fn acquire_write(&self, blk: &mut Block, wanted: usize, wait: Wait) -> Result<()> {
        let deadline = wait.deadline();
        let mut nodes = self.nodes.lock();
        loop {
            if nodes.aborted {
                return Err(SpeakerError::Aborted);
            }
            if let Some(mut buf) = nodes.empty.pop_front() {
                if buf.len() < wanted {
                    buf.resize(wanted, 0);
                }
                nodes.writing += 1;
                blk.buf = buf;
                blk.valid_size = 0;
                blk.is_last = false;
                return Ok(());
            }
            if nodes.allocated < nodes.capacity {
                let len = wanted.div_ceil(nodes.align) * nodes.align;
                nodes.allocated += 1;
                nodes.writing += 1;
                trace!(len, allocated = nodes.allocated, "fifo node allocated");
                blk.buf = vec![0; len.max(wanted)];
                blk.valid_size = 0;
                blk.is_last = false;
                return Ok(());
            }
            if let Err(e) = self.park(&mut nodes, deadline) {
                if nodes.empty.is_empty() && !nodes.aborted {
                    return Err(e);
                }
            }
        }
    }

    fn release_write(&self, blk: &mut Block, _wait: Wait) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.writing == 0 {
            return Err(SpeakerError::InvalidState(
                "fifo release_write without acquire".into(),
            ));
        }
        nodes.writing -= 1;
        let valid_size = blk.valid_size.min(blk.buf.len());
        nodes.filled.push_back(Filled {
            buf: std::mem::take(&mut blk.buf),
            valid_size,
            is_last: blk.is_last,
        });
        self.changed.notify_all();
        Ok(())
    }

    fn done_write(&self) {
        self.nodes.lock().write_done = true;
        self.changed.notify_all();
    }

    fn reset_done_write(&self) {
        self.nodes.lock().write_done = false;
    }

    fn abort(&self) {
        self.nodes.lock().aborted = true;
        self.changed.notify_all();
    }

    fn reset(&self) {
        let mut nodes = self.nodes.lock();
        while let Some(node) = nodes.filled.pop_front() {
            nodes.empty.push_back(node.buf);
        }
        nodes.write_done = false;
        nodes.aborted = false;
        self.changed.notify_all();
    }

    fn total_size(&self) -> usize {
        self.nodes.lock().capacity
    }

    fn filled_size(&self) -> usize {
        self.nodes.lock().filled.len()
    }

    fn free_size(&self) -> usize {
        let nodes = self.nodes.lock();
        nodes.empty.len() + (nodes.capacity - nodes.allocated)
    }
}

impl std::fmt::Debug for Fifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.nodes.lock();
        f.debug_struct("Fifo")
            .field("capacity", &nodes.capacity)
            .field("filled", &nodes.filled.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const SHORT: Wait = Wait::For(Duration::from_millis(30));

    fn push(fifo: &Fifo, bytes: &[u8]) {
        let mut blk = Block::default();
        fifo.acquire_write(&mut blk, bytes.len(), SHORT).unwrap();
        blk.buf[..bytes.len()].copy_from_slice(bytes);
        blk.valid_size = bytes.len();
        fifo.release_write(&mut blk, SHORT).unwrap();
    }

    #[test]
    fn blocks_come_out_in_write_order() {
        let fifo = Fifo::new(3).unwrap();
        push(&fifo, b"one");
        push(&fifo, b"two");
        assert_eq!(fifo.filled_size(), 2);

        let mut blk = Block::default();
        fifo.acquire_read(&mut blk, 0, SHORT).unwrap();
        assert_eq!(blk.data(), b"one");
        fifo.release_read(&mut blk, SHORT).unwrap();
        fifo.acquire_read(&mut blk, 0, SHORT).unwrap();
        assert_eq!(blk.data(), b"two");
        fifo.release_read(&mut blk, SHORT).unwrap();
        assert_eq!(fifo.free_size(), 3);
    }

    #[test]
    fn writer_waits_for_a_recycled_node() {
        let fifo = Arc::new(Fifo::new(1).unwrap());
        push(&fifo, b"a");

        let mut blk = Block::default();
        assert!(fifo.acquire_write(&mut blk, 1, SHORT).unwrap_err().is_timeout());

        let reader = Arc::clone(&fifo);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let mut blk = Block::default();
            reader.acquire_read(&mut blk, 0, SHORT).unwrap();
            reader.release_read(&mut blk, SHORT).unwrap();
        });
        fifo.acquire_write(&mut blk, 1, Wait::For(Duration::from_secs(2)))
            .unwrap();
        h.join().unwrap();
    }

    #[test]
    fn recycled_node_grows_to_request() {
        let fifo = Fifo::new(1).unwrap();
        push(&fifo, &[1; 4]);
        let mut blk = Block::default();
        fifo.acquire_read(&mut blk, 0, SHORT).unwrap();
        fifo.release_read(&mut blk, SHORT).unwrap();
        fifo.acquire_write(&mut blk, 64, SHORT).unwrap();
        assert!(blk.buf.len() >= 64);
    }

    #[test]
    fn release_without_acquire_is_rejected() {
        let fifo = Fifo::new(2).unwrap();
        let mut blk = Block::with_capacity(4);
        assert!(matches!(
            fifo.release_read(&mut blk, SHORT),
            Err(SpeakerError::InvalidState(_))
        ));
        assert!(matches!(
            fifo.release_write(&mut blk, SHORT),
            Err(SpeakerError::InvalidState(_))
        ));
    }

    #[test]
    fn done_write_ends_stream_after_drain() {
        let fifo = Fifo::new(2).unwrap();
        push(&fifo, b"tail");
        fifo.done_write();
        let mut blk = Block::default();
        fifo.acquire_read(&mut blk, 0, SHORT).unwrap();
        assert_eq!(blk.data(), b"tail");
        fifo.release_read(&mut blk, SHORT).unwrap();
        fifo.acquire_read(&mut blk, 0, SHORT).unwrap();
        assert!(blk.is_last);
        assert_eq!(blk.valid_size, 0);
    }

    #[test]
    fn abort_wakes_reader_twice_safely() {
        let fifo = Arc::new(Fifo::new(2).unwrap());
        let reader = Arc::clone(&fifo);
        let h = thread::spawn(move || {
            let mut blk = Block::default();
            reader.acquire_read(&mut blk, 0, Wait::Forever)
        });
        thread::sleep(Duration::from_millis(30));
        fifo.abort();
        fifo.abort();
        assert!(h.join().unwrap().unwrap_err().is_aborted());
        fifo.reset();
        push(&fifo, b"x");
        assert_eq!(fifo.filled_size(), 1);
    }
}
