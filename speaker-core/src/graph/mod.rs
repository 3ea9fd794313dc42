//! Element / pipeline / task graph.
//!
//! ```text
//! Pool ──new_pipeline──► Pipeline [el₀ → el₁ → … → elₙ]
//!                          │  in port (I/O)       out port (I/O)
//!                          │
//!                     bind_task / loading_jobs
//!                          ▼
//!                        Task thread: open₀ proc₀ open₁ proc₁ …
//! ```
//!
//! Consecutive elements are joined by a one-block FIFO link. A job that
//! returns `Continue` restarts the cycle from the head, so a downstream
//! element only runs after its upstream produced a block.

pub mod element;
pub mod pipeline;
pub mod pool;
pub mod port;
pub mod task;

pub use element::{Element, ElementIo};
pub use pipeline::{Pipeline, PipelineEvent, PipelineEventFn};
pub use pool::Pool;
pub use port::{BusIo, CodecIo, Io, Port, PortDir, PortKind};
pub use task::{JobTimes, Task, TaskConfig, TaskEvent, TaskEventKind};

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by elements, tasks and pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    None,
    Initialized,
    Opening,
    Running,
    Paused,
    Stopped,
    Finished,
    Error,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::None => "NONE",
            State::Initialized => "INITIALIZED",
            State::Opening => "OPENING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Stopped => "STOPPED",
            State::Finished => "FINISHED",
            State::Error => "ERROR",
        }
    }

    /// Stopped, finished or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Finished | State::Error)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job asks the task loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Advance to the next job.
    Ok,
    /// Not enough data yet: restart from the first job.
    Continue,
    /// More output pending: come back to this job after the rest of the cycle.
    Truncate,
    /// This job is finished for good.
    Done,
    /// Unrecoverable failure: drop every job and report an error.
    Fail,
}

/// PCM format announced from one element to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundInfo {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits: u8,
}

impl SoundInfo {
    pub const fn new(sample_rate: u32, channels: u8, bits: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bits,
        }
    }

    /// Bytes per interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bits as usize / 8)
    }
}
