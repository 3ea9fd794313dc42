//! Streamed speech playback fed by the network side.
//!
//! ```text
//! feed_data ──► Fifo(5) ──read cb──► player ──write cb──► codec
//!                                               │
//!                                    dropped while a prompt plays
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::prompt::PromptGate;
use super::{PlayerFactory, ProcessorState};
use crate::codec::CodecDevice;
use crate::data_bus::{Block, DataBus, Fifo};
use crate::error::{Result, SpeakerError};
use crate::player::{AudioPlayer, MusicInfo, PlayerEvent, PlayerReadFn, PlayerWriteFn};
use crate::sync::Wait;

pub const PLAYBACK_URL: &str = "raw://sdcard/coze.opus";

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Default: 5.
    pub fifo_blocks: usize,
    /// Default: [`PLAYBACK_URL`].
    pub url: String,
    /// Default: 16 kHz mono 16-bit.
    pub music: MusicInfo,
    /// How long one player read waits for fed data. Default: 50 ms.
    pub read_wait: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            fifo_blocks: 5,
            url: PLAYBACK_URL.to_string(),
            music: MusicInfo::pcm(16_000, 1, 16),
            read_wait: Duration::from_millis(50),
        }
    }
}

struct Open {
    fifo: Arc<Fifo>,
    player: Arc<dyn AudioPlayer>,
}

pub struct Playback {
    config: PlaybackConfig,
    gate: Arc<PromptGate>,
    play_dev: Arc<dyn CodecDevice>,
    players: PlayerFactory,
    open: Mutex<Option<Open>>,
    state: Mutex<ProcessorState>,
}

impl Playback {
    pub fn new(
        config: PlaybackConfig,
        gate: Arc<PromptGate>,
        play_dev: Arc<dyn CodecDevice>,
        players: PlayerFactory,
    ) -> Self {
        Self {
            config,
            gate,
            play_dev,
            players,
            open: Mutex::new(None),
            state: Mutex::new(ProcessorState::Closed),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    /// Create the FIFO and player. Opening an open playback is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut open = self.open.lock();
        if open.is_some() {
            warn!("playback already open");
            return Ok(());
        }
        let fifo = Arc::new(Fifo::new(self.config.fifo_blocks)?);
        let read = fifo_reader(Arc::clone(&fifo), self.config.read_wait);

        let gate = Arc::clone(&self.gate);
        let dev = Arc::clone(&self.play_dev);
        let write: PlayerWriteFn = Arc::new(move |data: &[u8]| {
            if gate.is_playing() {
                warn!(len = data.len(), "prompt playing, playback frame dropped");
                return Ok(());
            }
            dev.write(data).inspect_err(|e| error!("playback write failed: {e}"))
        });

        let player = (self.players)("playback_player", Some(read), write);
        player.set_event(Some(Arc::new(|ev: &PlayerEvent| match ev {
            PlayerEvent::MusicInfo(info) => {
                info!(rate = info.sample_rate, channels = info.channels, bits = info.bits, "playback info");
            }
            PlayerEvent::State(st) => info!(state = st.as_str(), "playback state"),
        })));
        *open = Some(Open { fifo, player });
        *self.state.lock() = ProcessorState::Idle;
        Ok(())
    }

    /// Stop if playing and release the player. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(open) = self.open.lock().take() else {
            warn!("playback already closed");
            return Ok(());
        };
        open.fifo.abort();
        open.player.stop()?;
        open.player.set_event(None);
        *self.state.lock() = ProcessorState::Closed;
        info!("playback closed");
        Ok(())
    }

    /// # Errors
    /// `InvalidState` when closed.
    pub fn run(&self) -> Result<()> {
        let player = self.player()?;
        let mut state = self.state.lock();
        if *state == ProcessorState::Playing {
            warn!("playback already running");
            return Ok(());
        }
        player.run(&self.config.url, Some(self.config.music))?;
        *state = ProcessorState::Playing;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let player = self.player()?;
        let mut state = self.state.lock();
        if *state != ProcessorState::Playing {
            warn!("playback already stopped");
            return Ok(());
        }
        player.stop()?;
        *state = ProcessorState::Idle;
        Ok(())
    }

    /// Queue one block of PCM, blocking while the FIFO is full.
    ///
    /// # Errors
    /// `InvalidState` when closed, `Aborted` when closed while waiting.
    pub fn feed_data(&self, data: &[u8]) -> Result<()> {
        let fifo = self
            .open
            .lock()
            .as_ref()
            .map(|o| Arc::clone(&o.fifo))
            .ok_or_else(|| SpeakerError::InvalidState("playback not open".into()))?;
        let mut blk = Block::default();
        fifo.acquire_write(&mut blk, data.len(), Wait::Forever)
            .inspect_err(|e| error!("playback fifo acquire failed: {e}"))?;
        blk.ensure_len(data.len());
        blk.buf[..data.len()].copy_from_slice(data);
        blk.valid_size = data.len();
        fifo.release_write(&mut blk, Wait::Forever)
    }

    fn player(&self) -> Result<Arc<dyn AudioPlayer>> {
        self.open
            .lock()
            .as_ref()
            .map(|o| Arc::clone(&o.player))
            .ok_or_else(|| SpeakerError::InvalidState("playback not open".into()))
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Playback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playback")
            .field("state", &self.state())
            .field("url", &self.config.url)
            .finish_non_exhaustive()
    }
}

/// Drain FIFO blocks into whatever buffer size the player asks for. The
/// part of a block that does not fit is kept for the next call.
fn fifo_reader(fifo: Arc<Fifo>, wait: Duration) -> PlayerReadFn {
    let leftover = Mutex::new(Vec::<u8>::new());
    Arc::new(move |buf: &mut [u8]| {
        let mut rest = leftover.lock();
        if rest.is_empty() {
            let mut blk = Block::default();
            fifo.acquire_read(&mut blk, buf.len(), Wait::For(wait))?;
            if blk.valid_size == 0 && blk.is_last {
                return Ok(0);
            }
            rest.extend_from_slice(blk.data());
            fifo.release_read(&mut blk, Wait::Immediate)?;
        }
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        rest.drain(..n);
        Ok(n)
    })
}
