//! # speaker-core
//!
//! Audio pipeline and voice-interaction engine for a smart speaker.
//!
//! ## Architecture
//!
//! ```text
//! codec in ──► Task[ ai_afe → rate_cvt → encoder ] ──► RingBuffer ──► uplink
//!                  │ AfeManager (feed / fetch threads)
//!                  └── wake word, VAD, voice command events
//!
//! downlink ──► Fifo ──► playback player ──┐
//!                                         ├──► codec out
//! AiBuddy ──► AudioScheduler ──► prompt ──┘
//! ```
//!
//! Blocking threads and bounded waits throughout; no async runtime is needed
//! to drive the pipeline. `tokio` only provides the broadcast channel the
//! expression updates fan out on.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod afe;
pub mod audio;
pub mod buddy;
pub mod codec;
pub mod data_bus;
pub mod elements;
pub mod error;
pub mod graph;
pub mod player;
pub mod processor;
pub mod sync;
pub mod thread;

// Convenience re-exports for downstream crates
pub use afe::{AfeEngine, AfeManager, AfeManagerConfig, EnergyAfe, EnergyAfeConfig};
pub use buddy::{
    AiBuddy, AudioCatalog, AudioEvent, AudioType, BuddyConfig, BuddySignal, ChatAgent, ChatEvent, ChatState,
    ExpressionMaps, ExpressionUpdate, MicControl, PromptSink,
};
pub use codec::{CodecDevice, NullCodec, WavSource};
pub use error::{Result, SpeakerError};
pub use processor::{simple_players, AudioProcessor, PlayerFactory, ProcessorConfig, ProcessorState};
pub use thread::ThreadSettings;

#[cfg(feature = "audio-cpal")]
pub use codec::CpalCodec;
