//! The device's audio front door: recorder, streamed playback and prompts
//! over one pair of codec devices.
//!
//! ```text
//!  rec_dev ──► Recorder: ai_afe → rate_cvt → encoder ──► ring ──► recorder_read_data
//!
//!  playback_feed_data ──► Fifo ──► playback player ─┐
//!                                                   ├──► play_dev
//!  prompt_play(url) ─────────────► prompt player ───┘
//! ```
//!
//! Playback frames are dropped while a prompt is playing, so prompts always
//! win the speaker.

pub mod playback;
pub mod prompt;
pub mod recorder;

pub use playback::{Playback, PlaybackConfig, PLAYBACK_URL};
pub use prompt::{Prompt, PromptConfig, PromptGate, FOREVER_PROMPT_WAIT};
pub use recorder::{Recorder, RecorderConfig, RecorderEventFn};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::afe::AfeEngine;
use crate::codec::CodecDevice;
use crate::elements::{AfeControl, Encoder, RateConvert};
use crate::error::Result;
use crate::graph::{CodecIo, Pool, PortDir};
use crate::player::{AudioPlayer, PlayerReadFn, PlayerWriteFn, SimplePlayer, SimplePlayerConfig};

/// Lifecycle of the recorder, playback and prompt slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    Idle,
    Playing,
    #[default]
    Closed,
}

/// Builds a player named `name` around the given callbacks.
pub type PlayerFactory =
    Arc<dyn Fn(&str, Option<PlayerReadFn>, PlayerWriteFn) -> Arc<dyn AudioPlayer> + Send + Sync>;

/// [`SimplePlayer`]s sharing `config`, each on a thread named after its role.
pub fn simple_players(config: SimplePlayerConfig) -> PlayerFactory {
    Arc::new(move |name: &str, read: Option<PlayerReadFn>, write: PlayerWriteFn| {
        let mut cfg = config.clone();
        cfg.thread.name = name.to_string();
        let player: Arc<dyn AudioPlayer> = Arc::new(SimplePlayer::new(cfg, read, write));
        player
    })
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Speaker volume set at construction. Default: 70.
    pub playback_volume: u8,
    pub recorder: RecorderConfig,
    pub playback: PlaybackConfig,
    pub prompt: PromptConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            playback_volume: 70,
            recorder: RecorderConfig::default(),
            playback: PlaybackConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

pub struct AudioProcessor {
    pool: Arc<Mutex<Pool>>,
    recorder: Recorder,
    playback: Playback,
    prompt: Prompt,
}

impl AudioProcessor {
    /// Register the stock elements and codec I/O, set the speaker volume.
    ///
    /// # Errors
    /// Whatever the playback device reports for the volume change.
    pub fn new(
        config: ProcessorConfig,
        play_dev: Arc<dyn CodecDevice>,
        rec_dev: Arc<dyn CodecDevice>,
        players: PlayerFactory,
    ) -> Result<Self> {
        let mut pool = Pool::new();
        pool.register_element(Box::new(RateConvert::default()));
        pool.register_element(Box::new(Encoder::default()));
        pool.register_io(Arc::new(CodecIo::new("codec_in", PortDir::In, Arc::clone(&rec_dev))));
        pool.register_io(Arc::new(CodecIo::new("codec_out", PortDir::Out, Arc::clone(&play_dev))));
        play_dev.set_out_volume(config.playback_volume)?;
        info!(volume = config.playback_volume, "audio processor ready");

        let pool = Arc::new(Mutex::new(pool));
        let gate = Arc::new(PromptGate::new());
        Ok(Self {
            recorder: Recorder::new(config.recorder, Arc::clone(&pool), rec_dev),
            playback: Playback::new(
                config.playback,
                Arc::clone(&gate),
                Arc::clone(&play_dev),
                Arc::clone(&players),
            ),
            prompt: Prompt::new(config.prompt, gate, play_dev, players),
            pool,
        })
    }

    pub fn pool(&self) -> &Arc<Mutex<Pool>> {
        &self.pool
    }

    /// Pause or resume feeding the AFE.
    ///
    /// # Errors
    /// `InvalidState` while the recorder is closed.
    pub fn suspend(&self, suspend: bool) -> Result<()> {
        self.recorder.suspend(suspend)
    }

    /// Make the next AFE chunk report a wake word.
    pub fn trigger_wakeup(&self) -> Result<()> {
        self.recorder.trigger_wakeup()
    }

    pub fn afe_control(&self) -> Option<AfeControl> {
        self.recorder.afe_control()
    }

    // ---------------------------------------------------------------------
    // Recorder
    // ---------------------------------------------------------------------

    pub fn recorder_open(&self, cb: RecorderEventFn) -> Result<()> {
        self.recorder.open(cb)
    }

    pub fn recorder_open_with_engine(&self, engine: Arc<dyn AfeEngine>, cb: RecorderEventFn) -> Result<()> {
        self.recorder.open_with_engine(engine, cb)
    }

    pub fn recorder_close(&self) -> Result<()> {
        self.recorder.close()
    }

    pub fn recorder_read_data(&self, buf: &mut [u8]) -> Result<usize> {
        self.recorder.read_data(buf)
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    // ---------------------------------------------------------------------
    // Playback
    // ---------------------------------------------------------------------

    pub fn playback_open(&self) -> Result<()> {
        self.playback.open()
    }

    pub fn playback_close(&self) -> Result<()> {
        self.playback.close()
    }

    pub fn playback_run(&self) -> Result<()> {
        self.playback.run()
    }

    pub fn playback_stop(&self) -> Result<()> {
        self.playback.stop()
    }

    pub fn playback_feed_data(&self, data: &[u8]) -> Result<()> {
        self.playback.feed_data(data)
    }

    pub fn playback_state(&self) -> ProcessorState {
        self.playback.state()
    }

    // ---------------------------------------------------------------------
    // Prompt
    // ---------------------------------------------------------------------

    pub fn prompt_open(&self) -> Result<()> {
        self.prompt.open()
    }

    pub fn prompt_close(&self) -> Result<()> {
        self.prompt.close()
    }

    pub fn prompt_play(&self, url: &str) -> Result<()> {
        self.prompt.play(url)
    }

    pub fn prompt_stop(&self) -> Result<()> {
        self.prompt.stop()
    }

    pub fn prompt_play_with_block(&self, url: &str, timeout_ms: i64) -> Result<()> {
        self.prompt.play_with_block(url, timeout_ms)
    }

    pub fn prompt_play_mute(&self, mute: bool) -> Result<()> {
        self.prompt.play_mute(mute)
    }

    pub fn prompt_state(&self) -> ProcessorState {
        self.prompt.gate().state()
    }

    /// Close prompt, playback and recorder, in that order.
    pub fn shutdown(&self) {
        for (what, res) in [
            ("prompt", self.prompt.close()),
            ("playback", self.playback.close()),
            ("recorder", self.recorder.close()),
        ] {
            if let Err(e) = res {
                warn!(what, "close failed: {e}");
            }
        }
    }
}

impl std::fmt::Debug for AudioProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioProcessor")
            .field("recorder", &self.recorder)
            .field("playback", &self.playback)
            .field("prompt", &self.prompt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NullCodec;
    use crate::elements::{AFE_TAG, ENCODER_TAG, RATE_CVT_TAG};
    use crate::error::SpeakerError;

    fn processor() -> (AudioProcessor, Arc<NullCodec>) {
        let play = Arc::new(NullCodec::default());
        let rec = Arc::new(NullCodec::default());
        let proc = AudioProcessor::new(
            ProcessorConfig::default(),
            play.clone(),
            rec,
            simple_players(SimplePlayerConfig::default()),
        )
        .unwrap();
        (proc, play)
    }

    #[test]
    fn construction_registers_stages_and_sets_volume() {
        let (proc, play) = processor();
        assert_eq!(play.stats().volume(), 70);
        assert_eq!(proc.pool().lock().element_tags(), vec![RATE_CVT_TAG, ENCODER_TAG]);
        assert!(!proc.pool().lock().element_tags().contains(&AFE_TAG));
    }

    #[test]
    fn afe_calls_need_an_open_recorder() {
        let (proc, _) = processor();
        assert!(matches!(proc.suspend(true), Err(SpeakerError::InvalidState(_))));
        assert!(proc.trigger_wakeup().is_err());
        assert!(proc.afe_control().is_none());
    }

    #[test]
    fn everything_starts_closed() {
        let (proc, _) = processor();
        assert_eq!(proc.playback_state(), ProcessorState::Closed);
        assert_eq!(proc.prompt_state(), ProcessorState::Closed);
        proc.prompt_open().unwrap();
        proc.playback_open().unwrap();
        assert_eq!(proc.prompt_state(), ProcessorState::Idle);
        assert_eq!(proc.playback_state(), ProcessorState::Idle);
        proc.shutdown();
        assert_eq!(proc.playback_state(), ProcessorState::Closed);
        assert_eq!(proc.prompt_state(), ProcessorState::Closed);
    }
}
