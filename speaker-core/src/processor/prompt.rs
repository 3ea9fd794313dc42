//! Short notification sounds played straight to the speaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use super::{PlayerFactory, ProcessorState};
use crate::codec::CodecDevice;
use crate::error::{Result, SpeakerError};
use crate::player::{AudioPlayer, PlayerEvent, PlayerWriteFn};

/// Wait used by [`Prompt::play_with_block`] for a negative timeout.
pub const FOREVER_PROMPT_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct PromptConfig {
    /// Output mute held after each prompt ends. Default: 100 ms.
    pub mute_pulse: Duration,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            mute_pulse: Duration::from_millis(100),
        }
    }
}

/// Prompt state shared with the playback write path.
#[derive(Debug)]
pub struct PromptGate {
    state: Mutex<ProcessorState>,
    idle: Condvar,
}

impl PromptGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessorState::Closed),
            idle: Condvar::new(),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == ProcessorState::Playing
    }

    pub(crate) fn set(&self, state: ProcessorState) {
        *self.state.lock() = state;
        if state != ProcessorState::Playing {
            self.idle.notify_all();
        }
    }

    /// Move Idle to Playing. Returns `false` when something else is playing.
    fn claim(&self) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            ProcessorState::Closed => Err(SpeakerError::InvalidState("prompt player not open".into())),
            ProcessorState::Playing => Ok(false),
            ProcessorState::Idle => {
                *state = ProcessorState::Playing;
                Ok(true)
            }
        }
    }

    /// Block while a prompt is playing, up to `deadline`.
    fn wait_idle(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while *state == ProcessorState::Playing {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return *state != ProcessorState::Playing;
            }
        }
        true
    }
}

impl Default for PromptGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One-at-a-time prompt player.
pub struct Prompt {
    config: PromptConfig,
    gate: Arc<PromptGate>,
    play_dev: Arc<dyn CodecDevice>,
    players: PlayerFactory,
    player: Mutex<Option<Arc<dyn AudioPlayer>>>,
}

impl Prompt {
    pub fn new(
        config: PromptConfig,
        gate: Arc<PromptGate>,
        play_dev: Arc<dyn CodecDevice>,
        players: PlayerFactory,
    ) -> Self {
        Self {
            config,
            gate,
            play_dev,
            players,
            player: Mutex::new(None),
        }
    }

    pub fn gate(&self) -> &Arc<PromptGate> {
        &self.gate
    }

    /// Create the prompt player. Opening twice keeps the first player.
    pub fn open(&self) -> Result<()> {
        let mut slot = self.player.lock();
        if slot.is_some() {
            warn!("prompt player already open");
            return Ok(());
        }
        let dev = Arc::clone(&self.play_dev);
        let write: PlayerWriteFn = Arc::new(move |data: &[u8]| dev.write(data));
        let player = (self.players)("prompt_player", None, write);

        let gate = Arc::clone(&self.gate);
        let dev = Arc::clone(&self.play_dev);
        let pulse = self.config.mute_pulse;
        player.set_event(Some(Arc::new(move |ev: &PlayerEvent| match ev {
            PlayerEvent::MusicInfo(info) => {
                info!(rate = info.sample_rate, channels = info.channels, bits = info.bits, "prompt info");
            }
            PlayerEvent::State(st) => {
                info!(state = st.as_str(), "prompt state");
                if st.is_terminal() {
                    mute_pulse(dev.as_ref(), pulse);
                    gate.set(ProcessorState::Idle);
                }
            }
        })));
        *slot = Some(player);
        self.gate.set(ProcessorState::Idle);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let Some(player) = self.player.lock().take() else {
            return Ok(());
        };
        if self.gate.is_playing() {
            player.stop()?;
        }
        player.set_event(None);
        self.gate.set(ProcessorState::Closed);
        info!("prompt player closed");
        Ok(())
    }

    /// Start `url` unless a prompt is already playing, in which case the
    /// request is logged and dropped.
    ///
    /// # Errors
    /// `InvalidState` when closed; whatever the player reports for `url`.
    pub fn play(&self, url: &str) -> Result<()> {
        let player = self.player()?;
        if !self.gate.claim()? {
            error!(url, "prompt already playing");
            return Ok(());
        }
        if let Err(e) = player.run(url, None) {
            self.gate.set(ProcessorState::Idle);
            return Err(e);
        }
        Ok(())
    }

    /// # Errors
    /// `InvalidState` when no prompt is playing.
    pub fn stop(&self) -> Result<()> {
        let player = self.player()?;
        if !self.gate.is_playing() {
            warn!("prompt stop requested while idle");
            return Err(SpeakerError::InvalidState("prompt is idle".into()));
        }
        player.stop()?;
        self.gate.set(ProcessorState::Idle);
        Ok(())
    }

    /// Wait for the current prompt to end, then play `url`. A negative
    /// `timeout_ms` waits up to an hour.
    ///
    /// # Errors
    /// `Timeout` when the current prompt outlasts the wait.
    pub fn play_with_block(&self, url: &str, timeout_ms: i64) -> Result<()> {
        info!(url, timeout_ms, "prompt play with block");
        let budget = u64::try_from(timeout_ms).map_or(FOREVER_PROMPT_WAIT, Duration::from_millis);
        let started = Instant::now();
        if !self.gate.wait_idle(started + budget) {
            error!(url, timeout_ms, waited_ms = started.elapsed().as_millis() as u64, "prompt wait timed out");
            return Err(SpeakerError::Timeout);
        }
        self.play(url)
    }

    pub fn play_mute(&self, mute: bool) -> Result<()> {
        info!(mute, "prompt mute");
        self.play_dev.set_out_mute(mute)
    }

    fn player(&self) -> Result<Arc<dyn AudioPlayer>> {
        self.player
            .lock()
            .clone()
            .ok_or_else(|| SpeakerError::InvalidState("prompt player not open".into()))
    }
}

impl Drop for Prompt {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompt")
            .field("state", &self.gate.state())
            .field("mute_pulse", &self.config.mute_pulse)
            .finish_non_exhaustive()
    }
}

fn mute_pulse(dev: &dyn CodecDevice, pulse: Duration) {
    if let Err(e) = dev.set_out_mute(true) {
        warn!("mute failed: {e}");
    }
    std::thread::sleep(pulse);
    if let Err(e) = dev.set_out_mute(false) {
        warn!("unmute failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NullCodec;
    use crate::player::{MusicInfo, PlayerEventFn, PlayerReadFn, PlayerState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Player that stays Running until `finish` or `stop`.
    #[derive(Default)]
    struct ManualPlayer {
        event: Mutex<Option<PlayerEventFn>>,
        state: Mutex<PlayerState>,
        runs: Mutex<Vec<String>>,
    }

    impl ManualPlayer {
        fn emit(&self, st: PlayerState) {
            *self.state.lock() = st;
            let cb = self.event.lock().clone();
            if let Some(cb) = cb {
                cb(&PlayerEvent::State(st));
            }
        }
    }

    impl AudioPlayer for ManualPlayer {
        fn run(&self, url: &str, _info: Option<MusicInfo>) -> Result<()> {
            if url.starts_with("bad://") {
                return Err(SpeakerError::NotSupported(url.into()));
            }
            self.runs.lock().push(url.to_string());
            self.emit(PlayerState::Running);
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            if *self.state.lock() == PlayerState::Running {
                self.emit(PlayerState::Stopped);
            }
            Ok(())
        }
        fn set_event(&self, cb: Option<PlayerEventFn>) {
            *self.event.lock() = cb;
        }
        fn state(&self) -> PlayerState {
            *self.state.lock()
        }
    }

    fn prompt() -> (Prompt, Arc<ManualPlayer>, Arc<NullCodec>) {
        let manual = Arc::new(ManualPlayer::default());
        let made = Arc::clone(&manual);
        let players: PlayerFactory = Arc::new(move |_name: &str, _read: Option<PlayerReadFn>, _write: PlayerWriteFn| {
            let p: Arc<dyn AudioPlayer> = made.clone();
            p
        });
        let dev = Arc::new(NullCodec::default());
        let cfg = PromptConfig {
            mute_pulse: Duration::from_millis(5),
        };
        let prompt = Prompt::new(cfg, Arc::new(PromptGate::new()), dev.clone(), players);
        prompt.open().unwrap();
        (prompt, manual, dev)
    }

    #[test]
    fn second_play_is_dropped_while_busy() {
        let (prompt, player, _) = prompt();
        prompt.play("file://spiffs/a.wav").unwrap();
        prompt.play("file://spiffs/b.wav").unwrap();
        assert_eq!(*player.runs.lock(), vec!["file://spiffs/a.wav".to_string()]);
        assert!(prompt.gate().is_playing());
    }

    #[test]
    fn finishing_pulses_mute_and_goes_idle() {
        let (prompt, player, dev) = prompt();
        prompt.play("file://spiffs/a.wav").unwrap();
        player.emit(PlayerState::Finished);
        assert_eq!(prompt.gate().state(), ProcessorState::Idle);
        assert_eq!(dev.stats().mute_toggles(), 2);
        assert!(!dev.stats().is_muted());
    }

    #[test]
    fn stop_when_idle_is_an_error() {
        let (prompt, _, _) = prompt();
        assert!(matches!(prompt.stop(), Err(SpeakerError::InvalidState(_))));
        prompt.play("file://spiffs/a.wav").unwrap();
        prompt.stop().unwrap();
        assert_eq!(prompt.gate().state(), ProcessorState::Idle);
    }

    #[test]
    fn failed_run_releases_the_gate() {
        let (prompt, _, _) = prompt();
        assert!(prompt.play("bad://x").is_err());
        assert_eq!(prompt.gate().state(), ProcessorState::Idle);
    }

    #[test]
    fn blocking_play_waits_for_the_current_prompt() {
        let (prompt, player, _) = prompt();
        let prompt = Arc::new(prompt);
        prompt.play("file://spiffs/a.wav").unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&player);
        let f = Arc::clone(&finished);
        let finisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            f.store(1, Ordering::SeqCst);
            p.emit(PlayerState::Finished);
        });
        prompt.play_with_block("file://spiffs/b.wav", -1).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        finisher.join().unwrap();
        assert_eq!(player.runs.lock().len(), 2);
    }

    #[test]
    fn blocking_play_times_out() {
        let (prompt, player, _) = prompt();
        prompt.play("file://spiffs/a.wav").unwrap();
        let started = Instant::now();
        assert!(matches!(
            prompt.play_with_block("file://spiffs/b.wav", 20),
            Err(SpeakerError::Timeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(player.runs.lock().len(), 1);
    }

    #[test]
    fn closed_prompt_rejects_play() {
        let (prompt, _, _) = prompt();
        prompt.close().unwrap();
        prompt.close().unwrap();
        assert!(matches!(prompt.play("file://spiffs/a.wav"), Err(SpeakerError::InvalidState(_))));
    }
}
