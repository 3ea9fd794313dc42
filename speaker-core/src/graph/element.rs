//! The pluggable processing stage.

use std::any::Any;

use tracing::{debug, error};

use super::port::Port;
use super::{JobOutcome, SoundInfo};
use crate::data_bus::Block;
use crate::error::{Result, SpeakerError};

/// Ports and format information handed to an element on every call.
#[derive(Debug, Default)]
pub struct ElementIo {
    pub input: Option<Port>,
    pub output: Option<Port>,
    /// Format announced by the upstream element before `open`.
    pub in_info: Option<SoundInfo>,
    /// Format this element announces downstream.
    pub out_info: Option<SoundInfo>,
}

impl ElementIo {
    pub fn acquire_in(&self, blk: &mut Block, wanted: usize) -> Result<()> {
        self.input
            .as_ref()
            .ok_or_else(|| SpeakerError::InvalidState("element has no input port".into()))?
            .acquire(blk, wanted)
    }

    pub fn release_in(&self, blk: &mut Block) -> Result<()> {
        self.input
            .as_ref()
            .ok_or_else(|| SpeakerError::InvalidState("element has no input port".into()))?
            .release(blk)
    }

    pub fn acquire_out(&self, blk: &mut Block, wanted: usize) -> Result<()> {
        self.output
            .as_ref()
            .ok_or_else(|| SpeakerError::InvalidState("element has no output port".into()))?
            .acquire(blk, wanted)
    }

    pub fn release_out(&self, blk: &mut Block) -> Result<()> {
        self.output
            .as_ref()
            .ok_or_else(|| SpeakerError::InvalidState("element has no output port".into()))?
            .release(blk)
    }

    /// Copy `payload` into a fresh output block and commit it.
    pub fn write_out(&self, payload: &[u8], is_last: bool) -> Result<()> {
        let mut blk = Block::default();
        self.acquire_out(&mut blk, payload.len())?;
        blk.ensure_len(payload.len());
        blk.buf[..payload.len()].copy_from_slice(payload);
        blk.valid_size = payload.len();
        blk.is_last = is_last;
        self.release_out(&mut blk)
    }

    /// Announce the output format to the next element.
    pub fn notify_info(&mut self, info: SoundInfo) {
        self.out_info = Some(info);
    }
}

/// A named stage in a pipeline.
///
/// The task calls `open` once, then `process` until it stops returning
/// `Ok`/`Continue`/`Truncate`, then `close`. Configuration lives on the
/// element and is duplicated from its pool prototype.
pub trait Element: Send + 'static {
    fn tag(&self) -> &str;

    /// Fresh, independently owned copy of this prototype.
    fn duplicate(&self) -> Result<Box<dyn Element>>;

    /// Bytes the element wants per input acquire. 0 means "whatever arrives".
    fn in_size(&self) -> usize {
        0
    }

    /// Bytes the element emits per output block, used to size links.
    fn out_size(&self) -> usize {
        0
    }

    /// # Errors
    /// Any error fails the pipeline.
    fn open(&mut self, io: &mut ElementIo) -> Result<()>;

    fn process(&mut self, io: &mut ElementIo) -> JobOutcome;

    fn close(&mut self, io: &mut ElementIo) -> Result<()>;

    /// Drop per-run state so the element can be opened again.
    fn reset(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Map a port failure to a job outcome. An aborted port ends the stream;
/// anything else fails the pipeline.
pub fn port_failure(tag: &str, stage: &str, err: SpeakerError) -> JobOutcome {
    if err.is_aborted() {
        debug!(element = tag, stage, "port aborted, finishing");
        JobOutcome::Done
    } else {
        error!(element = tag, stage, "port error: {err}");
        JobOutcome::Fail
    }
}

/// Pass end-of-stream downstream. Elements without an output ignore it.
pub fn forward_end_of_stream(tag: &str, io: &ElementIo) {
    if io.output.is_none() {
        return;
    }
    if let Err(e) = io.write_out(&[], true) {
        debug!(element = tag, "end-of-stream not forwarded: {e}");
    }
}
