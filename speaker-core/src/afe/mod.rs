//! Audio front-end: the engine contract, its threaded manager and a software
//! engine.
//!
//! ```text
//!             read_cb (500 ms budget)           result_cb
//! mic PCM ──► [feed thread] ──feed()──► engine ──fetch()──► [fetch thread] ──► listener
//!                  ▲                                              ▲
//!                  └──────── RUN | DESTROYING event bits ─────────┘
//! ```

pub mod energy;
pub mod manager;

pub use energy::{EnergyAfe, EnergyAfeConfig};
pub use manager::{AfeDiagnostics, AfeManager, AfeManagerConfig, AfeSnapshot, ReadFn, ResultFn};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    #[default]
    Silence,
    Speech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeupState {
    #[default]
    NotDetected,
    Detected,
}

/// A recognised voice command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCommand {
    pub phrase_id: i32,
    pub prob: f32,
    pub text: String,
}

/// One processed chunk from the engine.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Processed mono PCM, `fetch_chunk_size` samples.
    pub data: Vec<i16>,
    pub vad: VadState,
    pub wakeup: WakeupState,
    /// Starts at 1 when a wake word fired.
    pub wake_word_index: i32,
    pub model_index: i32,
    pub volume_db: f32,
}

/// Engine features that can be toggled at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AfeFeature {
    WakeNet,
    Vad,
    Aec,
    Se,
}

/// Which features are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AfeFeatures {
    pub wakeup: bool,
    pub vad: bool,
    pub ns: bool,
    pub aec: bool,
    pub se: bool,
}

/// A front-end engine instance. Implementations are internally synchronised:
/// `feed` and `fetch` run on different threads.
pub trait AfeEngine: Send + Sync {
    fn feed_channel_num(&self) -> usize;

    /// Samples per channel expected by each `feed`.
    fn feed_chunk_size(&self) -> usize;

    /// Samples returned per `fetch`.
    fn fetch_chunk_size(&self) -> usize;

    /// Features the engine was created with.
    fn init_features(&self) -> AfeFeatures;

    /// Push one interleaved chunk of `feed_channel_num × feed_chunk_size` samples.
    ///
    /// # Errors
    /// `InvalidArgument` on a wrong length.
    fn feed(&self, data: &[i16]) -> Result<()>;

    /// Next processed chunk, `None` when nothing arrived within `timeout`.
    fn fetch(&self, timeout: Duration) -> Option<FetchResult>;

    /// Switch a feature; returns whether it is now on.
    fn enable_feature(&self, feature: AfeFeature, on: bool) -> Result<bool>;

    fn reset_vad(&self);

    /// Report a wake word on the next fetched chunk.
    fn trigger_wakeup(&self);
}

/// Outcome of one command-recognition step.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandState {
    Detecting,
    Detected(VoiceCommand),
    Timeout,
}

/// Voice-command recogniser fed with fetched chunks while a detection window
/// is open.
pub trait CommandRecognizer: Send {
    fn detect(&mut self, data: &[i16]) -> CommandState;

    /// Forget partial input before the next window.
    fn clean(&mut self);
}

/// Recogniser with an empty vocabulary: every window times out.
#[derive(Debug, Clone)]
pub struct SilentRecognizer {
    window_samples: usize,
    seen: usize,
}

impl SilentRecognizer {
    pub fn new(timeout: Duration, sample_rate: u32) -> Self {
        Self {
            window_samples: (timeout.as_millis() as usize * sample_rate as usize) / 1000,
            seen: 0,
        }
    }
}

impl CommandRecognizer for SilentRecognizer {
    fn detect(&mut self, data: &[i16]) -> CommandState {
        self.seen += data.len();
        if self.seen >= self.window_samples {
            self.seen = 0;
            CommandState::Timeout
        } else {
            CommandState::Detecting
        }
    }

    fn clean(&mut self) {
        self.seen = 0;
    }
}
