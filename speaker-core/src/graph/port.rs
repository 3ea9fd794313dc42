//! Ports and the I/O objects behind them.
//!
//! An [`Io`] is the far side of a port: a ring buffer, a FIFO, or the codec
//! device itself. A [`Port`] pairs one `Io` with the transfer size and wait
//! policy its element uses, and is fixed once attached.

use std::sync::Arc;

use crate::codec::CodecDevice;
use crate::data_bus::{Block, DataBus, Fifo};
use crate::error::Result;
use crate::sync::Wait;

/// Direction seen from the element that owns the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    /// The element reads from it.
    In,
    /// The element writes to it.
    Out,
}

/// Transfer granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Arbitrary byte counts, copied.
    Byte,
    /// Whole blocks handed over by value.
    Block,
}

/// The object a port reads from or writes to.
pub trait Io: Send + Sync {
    fn tag(&self) -> &str;
    fn dir(&self) -> PortDir;
    fn kind(&self) -> PortKind;

    /// Fresh instance for a new pipeline. Bus- and codec-backed objects share
    /// their underlying device.
    fn duplicate(&self) -> Arc<dyn Io>;

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Return buffered state to empty.
    fn reset(&self) {}

    /// Read (`In`) or reserve space (`Out`) for `wanted` bytes.
    fn acquire(&self, blk: &mut Block, wanted: usize, wait: Wait) -> Result<()>;

    /// Return a read block (`In`) or commit a written one (`Out`).
    fn release(&self, blk: &mut Block, wait: Wait) -> Result<()>;
}

/// Port backed by any [`DataBus`] (ring buffer or FIFO).
pub struct BusIo {
    tag: String,
    dir: PortDir,
    kind: PortKind,
    bus: Arc<dyn DataBus>,
}

impl BusIo {
    pub fn new(tag: impl Into<String>, dir: PortDir, kind: PortKind, bus: Arc<dyn DataBus>) -> Self {
        Self {
            tag: tag.into(),
            dir,
            kind,
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<dyn DataBus> {
        &self.bus
    }
}

impl Io for BusIo {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn dir(&self) -> PortDir {
        self.dir
    }

    fn kind(&self) -> PortKind {
        self.kind
    }

    fn duplicate(&self) -> Arc<dyn Io> {
        Arc::new(BusIo::new(self.tag.clone(), self.dir, self.kind, Arc::clone(&self.bus)))
    }

    fn reset(&self) {
        self.bus.reset();
    }

    fn acquire(&self, blk: &mut Block, wanted: usize, wait: Wait) -> Result<()> {
        match self.dir {
            PortDir::In => self.bus.acquire_read(blk, wanted, wait),
            PortDir::Out => self.bus.acquire_write(blk, wanted, wait),
        }
    }

    fn release(&self, blk: &mut Block, wait: Wait) -> Result<()> {
        match self.dir {
            PortDir::In => self.bus.release_read(blk, wait),
            PortDir::Out => self.bus.release_write(blk, wait),
        }
    }
}

/// Port that talks to the codec device synchronously on each transfer.
pub struct CodecIo {
    tag: String,
    dir: PortDir,
    codec: Arc<dyn CodecDevice>,
}

impl CodecIo {
    pub fn new(tag: impl Into<String>, dir: PortDir, codec: Arc<dyn CodecDevice>) -> Self {
        Self {
            tag: tag.into(),
            dir,
            codec,
        }
    }
}

impl Io for CodecIo {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn dir(&self) -> PortDir {
        self.dir
    }

    fn kind(&self) -> PortKind {
        PortKind::Byte
    }

    fn duplicate(&self) -> Arc<dyn Io> {
        Arc::new(CodecIo::new(self.tag.clone(), self.dir, Arc::clone(&self.codec)))
    }

    fn acquire(&self, blk: &mut Block, wanted: usize, _wait: Wait) -> Result<()> {
        blk.ensure_len(wanted);
        blk.is_last = false;
        match self.dir {
            PortDir::In => {
                self.codec.read(&mut blk.buf[..wanted])?;
                blk.valid_size = wanted;
            }
            PortDir::Out => blk.valid_size = 0,
        }
        Ok(())
    }

    fn release(&self, blk: &mut Block, _wait: Wait) -> Result<()> {
        match self.dir {
            PortDir::In => Ok(()),
            PortDir::Out => self.codec.write(blk.data()),
        }
    }
}

/// An element's connection to an [`Io`].
#[derive(Clone)]
pub struct Port {
    dir: PortDir,
    kind: PortKind,
    wanted_size: usize,
    wait: Wait,
    io: Arc<dyn Io>,
}

impl Port {
    pub fn new(io: Arc<dyn Io>, wanted_size: usize, wait: Wait) -> Self {
        Self {
            dir: io.dir(),
            kind: io.kind(),
            wanted_size,
            wait,
            io,
        }
    }

    /// Block port pair joining an upstream element's output to the next
    /// element's input through a one-block FIFO.
    ///
    /// Both ends use an immediate wait: the task runs the pair in order on a
    /// single thread, so the block is always present when the reader runs.
    pub fn link(wanted_size: usize) -> Result<(Port, Port)> {
        let fifo: Arc<dyn DataBus> = Arc::new(Fifo::new(1)?);
        let out = BusIo::new("link", PortDir::Out, PortKind::Block, Arc::clone(&fifo));
        let inp = BusIo::new("link", PortDir::In, PortKind::Block, fifo);
        Ok((
            Port::new(Arc::new(out), wanted_size, Wait::Immediate),
            Port::new(Arc::new(inp), wanted_size, Wait::Immediate),
        ))
    }

    pub fn dir(&self) -> PortDir {
        self.dir
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn wanted_size(&self) -> usize {
        self.wanted_size
    }

    pub fn wait(&self) -> Wait {
        self.wait
    }

    pub fn io(&self) -> &Arc<dyn Io> {
        &self.io
    }

    /// Acquire `wanted` bytes, or the port's own size when `wanted` is 0.
    pub fn acquire(&self, blk: &mut Block, wanted: usize) -> Result<()> {
        let n = if wanted == 0 { self.wanted_size } else { wanted };
        self.io.acquire(blk, n, self.wait)
    }

    pub fn release(&self, blk: &mut Block) -> Result<()> {
        self.io.release(blk, self.wait)
    }

    pub fn reset(&self) {
        self.io.reset();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("io", &self.io.tag())
            .field("dir", &self.dir)
            .field("kind", &self.kind)
            .field("wanted_size", &self.wanted_size)
            .field("wait", &self.wait)
            .finish()
    }
}
