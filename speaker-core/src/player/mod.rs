//! Audio players used by the playback and prompt paths.
//!
//! URLs name the source:
//!
//! | scheme            | source                                          |
//! |-------------------|-------------------------------------------------|
//! | `file://<mount>/` | WAV file under the configured root directory    |
//! | `raw://…`         | PCM pulled from the player's read callback      |

pub mod simple;

pub use simple::{PlayerReadFn, PlayerWriteFn, SimplePlayer, SimplePlayerConfig};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    #[default]
    None,
    Running,
    Paused,
    Stopped,
    Finished,
    Error,
}

impl PlayerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerState::None => "NONE",
            PlayerState::Running => "RUNNING",
            PlayerState::Paused => "PAUSED",
            PlayerState::Stopped => "STOPPED",
            PlayerState::Finished => "FINISHED",
            PlayerState::Error => "ERROR",
        }
    }

    /// The run is over, for whatever reason.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerState::Stopped | PlayerState::Finished | PlayerState::Error)
    }
}

/// Format of the stream being played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicInfo {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits: u8,
    /// 0 when unknown.
    pub bitrate: u32,
}

impl MusicInfo {
    pub const fn pcm(sample_rate: u32, channels: u8, bits: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bits,
            bitrate: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    State(PlayerState),
    MusicInfo(MusicInfo),
}

pub type PlayerEventFn = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Player contract
// ---------------------------------------------------------------------------

/// A player that renders one URL at a time on its own thread.
pub trait AudioPlayer: Send + Sync {
    /// Start playing `url`. A run already in progress is stopped first.
    ///
    /// # Errors
    /// `NotSupported` for an unknown scheme, `NotFound` for a missing file.
    fn run(&self, url: &str, info: Option<MusicInfo>) -> Result<()>;

    /// Stop the current run and wait for it to end. Stopping an idle
    /// player is a no-op.
    fn stop(&self) -> Result<()>;

    fn set_event(&self, cb: Option<PlayerEventFn>);

    fn state(&self) -> PlayerState;
}
