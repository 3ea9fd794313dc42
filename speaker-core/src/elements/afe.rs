//! `ai_afe`: bridges the pipeline to an [`AfeManager`] and turns its results
//! into wake and voice-activity events.
//!
//! ```text
//!  in port ──process──► in ring ──read_cb──► [feed thread] → engine
//!                                                               │
//!  out port ◄─process── out ring ◄──result_cb── [fetch thread] ◄┘
//!                                      │
//!                                      └─► wake state machine ─► AfeEvent
//! ```
//!
//! The out ring holds back `delay_samples` so the audio leading up to a VAD
//! start is still downstream when the event fires.
//!
//! ## Wake states
//!
//! ```text
//! Idle ──wake word──► Wakeup ──speech──► Speeching ──noise──► WaitForSleep
//!  ▲                    │  ▲                 ▲                    │   │
//!  └──── timer ─────────┘  └── keep awake ───┼──── speech ────────┘   │
//!  └─────────────────────────── timer ───────┴────────────────────────┘
//! ```
//!
//! Inputs are edge-triggered: a result that maps to the same input as the
//! previous one is ignored, except keep-awake changes.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::afe::{
    AfeFeature, AfeManager, CommandRecognizer, CommandState, FetchResult, SilentRecognizer,
    VadState, VoiceCommand, WakeupState,
};
use crate::audio::i16_to_bytes;
use crate::data_bus::{Block, DataBus, RingBuffer};
use crate::error::{Result, SpeakerError};
use crate::graph::element::{forward_end_of_stream, port_failure};
use crate::graph::{Element, ElementIo, JobOutcome, SoundInfo};
use crate::sync::Wait;
use crate::thread::ThreadSettings;

pub const AFE_TAG: &str = "ai_afe";
pub const DEFAULT_DELAY_SAMPLES: usize = 2048;
pub const DEFAULT_WAKEUP_TIME: Duration = Duration::from_millis(30_000);
pub const DEFAULT_WAKEUP_END: Duration = Duration::from_millis(30_000);
pub const DEFAULT_VCMD_TIMEOUT: Duration = Duration::from_millis(5760);

/// Output format of the engine.
const AFE_OUT_INFO: SoundInfo = SoundInfo::new(16_000, 1, 16);

/// Details attached to a wake-word detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeupInfo {
    pub volume_db: f32,
    /// Starts at 1.
    pub wake_word_index: i32,
    pub model_index: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AfeEvent {
    WakeupStart(WakeupInfo),
    WakeupEnd,
    VadStart,
    VadEnd,
    VcmdTimeout,
    VcmdDetected(VoiceCommand),
}

pub type AfeEventFn = Arc<dyn Fn(&AfeEvent) + Send + Sync>;
pub type RecognizerFactory = Arc<dyn Fn() -> Box<dyn CommandRecognizer> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeState {
    #[default]
    Idle,
    Wakeup,
    Speeching,
    WaitForSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeInput {
    Noise,
    Speech,
    WakeWord,
    TimerExpired,
    KeepWakeModified,
}

impl WakeInput {
    fn from_result(result: &FetchResult) -> Self {
        if result.wakeup == WakeupState::Detected {
            WakeInput::WakeWord
        } else if result.vad == VadState::Speech {
            WakeInput::Speech
        } else {
            WakeInput::Noise
        }
    }
}

#[derive(Clone)]
pub struct AfeElementConfig {
    pub manager: Arc<AfeManager>,
    /// Samples held back in the out ring. Default: 2048.
    pub delay_samples: usize,
    /// How long `Wakeup` lasts without speech. Zero disables the timer.
    /// Default: 30 s.
    pub wakeup_time: Duration,
    /// Silence after a VAD end before the wake session ends. Default: 30 s.
    pub wakeup_end: Duration,
    /// Default: `false`.
    pub vcmd_detect_en: bool,
    /// Length of one command window; zero falls back to the default.
    /// Default: 5760 ms.
    pub vcmd_timeout: Duration,
    /// Builds the recogniser on open. Default: `None`, a [`SilentRecognizer`].
    pub recognizer: Option<RecognizerFactory>,
    pub event: Option<AfeEventFn>,
}

impl AfeElementConfig {
    pub fn new(manager: Arc<AfeManager>) -> Self {
        Self {
            manager,
            delay_samples: DEFAULT_DELAY_SAMPLES,
            wakeup_time: DEFAULT_WAKEUP_TIME,
            wakeup_end: DEFAULT_WAKEUP_END,
            vcmd_detect_en: false,
            vcmd_timeout: DEFAULT_VCMD_TIMEOUT,
            recognizer: None,
            event: None,
        }
    }
}

impl std::fmt::Debug for AfeElementConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeElementConfig")
            .field("delay_samples", &self.delay_samples)
            .field("wakeup_time", &self.wakeup_time)
            .field("wakeup_end", &self.wakeup_end)
            .field("vcmd_detect_en", &self.vcmd_detect_en)
            .field("vcmd_timeout", &self.vcmd_timeout)
            .field("event", &self.event.is_some())
            .finish_non_exhaustive()
    }
}

enum TimerCmd {
    Start(Duration),
    Stop,
}

/// One-shot restartable timer on its own thread.
struct WakeTimer {
    tx: Option<Sender<TimerCmd>>,
    thread: Option<JoinHandle<()>>,
}

impl WakeTimer {
    fn spawn(on_expire: impl Fn() + Send + 'static) -> Result<Self> {
        let (tx, rx) = unbounded::<TimerCmd>();
        let thread = ThreadSettings::named("wakeup_timer").spawn(move || {
            let mut deadline: Option<Instant> = None;
            loop {
                let cmd = match deadline {
                    Some(at) => rx.recv_deadline(at),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match cmd {
                    Ok(TimerCmd::Start(after)) => deadline = Some(Instant::now() + after),
                    Ok(TimerCmd::Stop) => deadline = None,
                    Err(RecvTimeoutError::Timeout) => {
                        deadline = None;
                        on_expire();
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    fn send(&self, cmd: TimerCmd) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(cmd);
        }
    }
}

impl Drop for WakeTimer {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(h) = self.thread.take() {
            if h.thread().id() == std::thread::current().id() {
                return;
            }
            if h.join().is_err() {
                error!("wakeup timer thread panicked");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Machine {
    state: WakeState,
    last_input: Option<WakeInput>,
    keep_wake: bool,
    /// VAD was on at open and is only switched on while awake.
    origin_vad_enable: bool,
    /// Wake or VAD feature present; the machine only runs when set.
    active: bool,
}

#[derive(Default)]
struct Vcmd {
    detecting: bool,
    recognizer: Option<Box<dyn CommandRecognizer>>,
}

struct Core {
    manager: Arc<AfeManager>,
    wakeup_time: Duration,
    wakeup_end: Duration,
    vcmd_enabled: bool,
    machine: Mutex<Machine>,
    timer: Mutex<Option<WakeTimer>>,
    vcmd: Mutex<Vcmd>,
    event: Mutex<Option<AfeEventFn>>,
}

impl Core {
    fn emit(&self, events: Vec<AfeEvent>) {
        if events.is_empty() {
            return;
        }
        let cb = self.event.lock().clone();
        for ev in &events {
            debug!(event = ?ev, "AFE event");
            if let Some(cb) = &cb {
                cb(ev);
            }
        }
    }

    fn set_vad(&self, on: bool) {
        if let Err(e) = self.manager.enable_features(AfeFeature::Vad, on) {
            warn!(on, "VAD toggle failed: {e}");
        }
    }

    fn stop_timer(&self) {
        if let Some(t) = self.timer.lock().as_ref() {
            t.send(TimerCmd::Stop);
        }
    }

    /// (Re)start the timer for `state`; a zero duration only stops it.
    fn start_timer(&self, state: WakeState) {
        let after = match state {
            WakeState::Wakeup => self.wakeup_time,
            WakeState::WaitForSleep => self.wakeup_end,
            _ => Duration::ZERO,
        };
        if let Some(t) = self.timer.lock().as_ref() {
            t.send(TimerCmd::Stop);
            if !after.is_zero() {
                t.send(TimerCmd::Start(after));
            }
        }
    }

    /// Prepare the state machine for a run. Returns the wake/VAD activity.
    fn arm(self: &Arc<Self>) -> Result<bool> {
        let features = self.manager.features();
        let active = features.wakeup || features.vad;
        {
            let mut m = self.machine.lock();
            m.state = WakeState::Idle;
            m.last_input = None;
            m.active = active;
            m.origin_vad_enable = false;
        }
        if active {
            let weak: Weak<Core> = Arc::downgrade(self);
            let timer = WakeTimer::spawn(move || {
                if let Some(core) = weak.upgrade() {
                    core.update(WakeInput::TimerExpired, None);
                }
            })?;
            *self.timer.lock() = Some(timer);
            if features.wakeup && features.vad {
                self.manager.enable_features(AfeFeature::Vad, false)?;
                self.machine.lock().origin_vad_enable = true;
            }
        }
        Ok(active)
    }

    fn disarm(&self) {
        self.machine.lock().active = false;
        let timer = self.timer.lock().take();
        drop(timer);
    }

    fn update(&self, input: WakeInput, info: Option<WakeupInfo>) {
        let mut events = Vec::new();
        {
            let mut m = self.machine.lock();
            if !m.active {
                return;
            }
            if input != WakeInput::KeepWakeModified && m.last_input == Some(input) {
                return;
            }
            debug!(state = ?m.state, ?input, "wake state update");
            m.last_input = Some(input);

            if input == WakeInput::WakeWord && m.state != WakeState::Idle {
                self.stop_timer();
                m.state = WakeState::Idle;
                if self.manager.features().wakeup && m.origin_vad_enable {
                    self.set_vad(false);
                }
            }
            let wakeup_on = self.manager.features().wakeup;

            match (m.state, input) {
                (WakeState::Idle, WakeInput::WakeWord) => {
                    m.state = WakeState::Wakeup;
                    if !m.keep_wake {
                        self.start_timer(m.state);
                    }
                    if m.origin_vad_enable {
                        self.set_vad(true);
                    }
                    let info = info.unwrap_or(WakeupInfo {
                        volume_db: 0.0,
                        wake_word_index: 0,
                        model_index: 0,
                    });
                    events.push(AfeEvent::WakeupStart(info));
                }
                (WakeState::Idle, WakeInput::Speech) if !wakeup_on => {
                    m.state = WakeState::Speeching;
                    events.push(AfeEvent::VadStart);
                }
                (WakeState::Wakeup, WakeInput::Speech) => {
                    self.stop_timer();
                    m.state = WakeState::Speeching;
                    events.push(AfeEvent::VadStart);
                }
                (WakeState::Wakeup, WakeInput::KeepWakeModified) => {
                    if m.keep_wake {
                        self.stop_timer();
                    } else {
                        self.start_timer(m.state);
                    }
                }
                (WakeState::Wakeup, WakeInput::TimerExpired) => {
                    m.state = WakeState::Idle;
                    self.stop_timer();
                    events.push(AfeEvent::WakeupEnd);
                }
                (WakeState::Speeching, WakeInput::Noise) => {
                    m.state = if !wakeup_on {
                        WakeState::Idle
                    } else if m.keep_wake {
                        WakeState::Wakeup
                    } else {
                        self.start_timer(WakeState::WaitForSleep);
                        WakeState::WaitForSleep
                    };
                    events.push(AfeEvent::VadEnd);
                }
                (WakeState::WaitForSleep, WakeInput::Speech) => {
                    m.state = WakeState::Speeching;
                    events.push(AfeEvent::VadStart);
                }
                (WakeState::WaitForSleep, WakeInput::TimerExpired) => {
                    m.state = WakeState::Idle;
                    if m.origin_vad_enable {
                        self.set_vad(false);
                    }
                    events.push(AfeEvent::WakeupEnd);
                }
                (WakeState::WaitForSleep, WakeInput::KeepWakeModified) => {
                    if m.keep_wake {
                        self.stop_timer();
                        m.state = WakeState::Wakeup;
                    } else {
                        self.start_timer(m.state);
                    }
                }
                _ => {}
            }
        }
        self.emit(events);
    }

    fn monitor_vcmd(&self, data: &[i16]) {
        let event = {
            let mut v = self.vcmd.lock();
            if !v.detecting {
                return;
            }
            let Some(rec) = v.recognizer.as_mut() else {
                return;
            };
            match rec.detect(data) {
                CommandState::Detecting => None,
                CommandState::Detected(cmd) => {
                    info!(phrase_id = cmd.phrase_id, prob = cmd.prob, text = cmd.text.as_str(), "voice command");
                    Some(AfeEvent::VcmdDetected(cmd))
                }
                CommandState::Timeout => {
                    v.detecting = false;
                    Some(AfeEvent::VcmdTimeout)
                }
            }
        };
        self.emit(event.into_iter().collect());
    }

    /// Fetch-thread hook: run the monitors, then queue the audio, dropping
    /// the oldest bytes when the out ring is full.
    fn on_result(&self, result: &FetchResult, out: &RingBuffer) {
        if result.data.is_empty() {
            return;
        }
        let features = self.manager.features();
        if features.wakeup || features.vad {
            let input = WakeInput::from_result(result);
            let info = (input == WakeInput::WakeWord).then(|| WakeupInfo {
                volume_db: result.volume_db,
                wake_word_index: result.wake_word_index,
                model_index: result.model_index,
            });
            self.update(input, info);
        }
        if self.vcmd_enabled {
            self.monitor_vcmd(&result.data);
        }

        let mut bytes = Vec::with_capacity(result.data.len() * 2);
        i16_to_bytes(&result.data, &mut bytes);
        push_dropping_oldest(out, &bytes);
    }

    fn vcmd_begin(&self) -> Result<()> {
        if !self.vcmd_enabled {
            return Err(SpeakerError::InvalidState("voice commands disabled".into()));
        }
        self.vcmd.lock().detecting = true;
        Ok(())
    }

    fn vcmd_cancel(&self) -> Result<()> {
        if !self.vcmd_enabled {
            return Err(SpeakerError::InvalidState("voice commands disabled".into()));
        }
        let mut v = self.vcmd.lock();
        v.detecting = false;
        if let Some(rec) = v.recognizer.as_mut() {
            rec.clean();
        }
        Ok(())
    }

    fn keep_awake(&self, enable: bool) -> Result<()> {
        {
            let mut m = self.machine.lock();
            if !m.active {
                return Err(SpeakerError::InvalidState(
                    "wake tracking is not running".into(),
                ));
            }
            m.keep_wake = enable;
        }
        self.update(WakeInput::KeepWakeModified, None);
        Ok(())
    }
}

fn push_dropping_oldest(ring: &RingBuffer, bytes: &[u8]) {
    let free = ring.free_size();
    if free < bytes.len() {
        let mut scratch = vec![0u8; bytes.len() - free];
        if let Err(e) = ring.read(&mut scratch, Wait::Immediate) {
            warn!("ring drop failed: {e}");
            return;
        }
    }
    if let Err(e) = ring.write(bytes, Wait::Forever) {
        debug!("ring write failed: {e}");
    }
}

/// Cloneable handle for controlling a running `ai_afe` from outside the task.
#[derive(Clone)]
pub struct AfeControl {
    core: Arc<Core>,
}

impl AfeControl {
    /// Hold the wake session open (no wakeup/idle timeout) until released.
    ///
    /// # Errors
    /// `InvalidState` when neither wake word nor VAD is enabled, or the
    /// element is not open.
    pub fn keep_awake(&self, enable: bool) -> Result<()> {
        self.core.keep_awake(enable)
    }

    /// Open a command window.
    ///
    /// # Errors
    /// `InvalidState` unless `vcmd_detect_en` was set.
    pub fn vcmd_detection_begin(&self) -> Result<()> {
        self.core.vcmd_begin()
    }

    pub fn vcmd_detection_cancel(&self) -> Result<()> {
        self.core.vcmd_cancel()
    }

    pub fn set_event(&self, cb: Option<AfeEventFn>) {
        *self.core.event.lock() = cb;
    }

    pub fn wake_state(&self) -> WakeState {
        self.core.machine.lock().state
    }
}

impl std::fmt::Debug for AfeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeControl")
            .field("wake_state", &self.wake_state())
            .finish_non_exhaustive()
    }
}

pub struct AfeElement {
    config: AfeElementConfig,
    core: Arc<Core>,
    in_size: usize,
    in_ring: Option<Arc<RingBuffer>>,
    out_ring: Option<Arc<RingBuffer>>,
}

impl AfeElement {
    pub fn new(config: AfeElementConfig) -> Self {
        let in_size = config.manager.chunk_size() * config.manager.input_ch_num() * 2;
        let core = Arc::new(Core {
            manager: Arc::clone(&config.manager),
            wakeup_time: config.wakeup_time,
            wakeup_end: config.wakeup_end,
            vcmd_enabled: config.vcmd_detect_en,
            machine: Mutex::new(Machine::default()),
            timer: Mutex::new(None),
            vcmd: Mutex::new(Vcmd::default()),
            event: Mutex::new(config.event.clone()),
        });
        Self {
            config,
            core,
            in_size,
            in_ring: None,
            out_ring: None,
        }
    }

    pub fn control(&self) -> AfeControl {
        AfeControl {
            core: Arc::clone(&self.core),
        }
    }
}

impl Element for AfeElement {
    fn tag(&self) -> &str {
        AFE_TAG
    }

    fn duplicate(&self) -> Result<Box<dyn Element>> {
        Ok(Box::new(AfeElement::new(self.config.clone())))
    }

    fn in_size(&self) -> usize {
        self.in_size
    }

    fn out_size(&self) -> usize {
        self.config.manager.chunk_size() * 2
    }

    fn open(&mut self, io: &mut ElementIo) -> Result<()> {
        let manager = &self.config.manager;
        let buf_size = self.in_size;
        let active = self.core.arm()?;

        if self.config.vcmd_detect_en {
            let mut timeout = self.config.vcmd_timeout;
            if timeout.is_zero() {
                warn!("voice command timeout is 0, using {} ms", DEFAULT_VCMD_TIMEOUT.as_millis());
                timeout = DEFAULT_VCMD_TIMEOUT;
            }
            let recognizer: Box<dyn CommandRecognizer> = match &self.config.recognizer {
                Some(factory) => factory(),
                None => Box::new(SilentRecognizer::new(timeout, AFE_OUT_INFO.sample_rate)),
            };
            *self.core.vcmd.lock() = Vcmd {
                detecting: false,
                recognizer: Some(recognizer),
            };
        }

        let in_ring = Arc::new(RingBuffer::new(buf_size, 2)?);
        let out_ring = Arc::new(RingBuffer::new(
            buf_size * 2 + self.config.delay_samples * 2,
            1,
        )?);

        let core = Arc::clone(&self.core);
        let out = Arc::clone(&out_ring);
        manager.set_result_cb(Some(Arc::new(move |r: &FetchResult| core.on_result(r, &out))))?;
        let reader = Arc::clone(&in_ring);
        manager.set_read_cb(Some(Box::new(move |buf: &mut [u8], wait| {
            reader.read(buf, wait).unwrap_or(0)
        })))?;

        self.in_ring = Some(in_ring);
        self.out_ring = Some(out_ring);
        io.notify_info(AFE_OUT_INFO);
        info!(
            in_size = buf_size,
            delay = self.config.delay_samples,
            wake_tracking = active,
            vcmd = self.config.vcmd_detect_en,
            "ai_afe opened"
        );
        Ok(())
    }

    fn process(&mut self, io: &mut ElementIo) -> JobOutcome {
        let (Some(in_ring), Some(out_ring)) = (self.in_ring.as_ref(), self.out_ring.as_ref()) else {
            error!("ai_afe processed before open");
            return JobOutcome::Fail;
        };

        let mut blk = Block::default();
        if let Err(e) = io.acquire_in(&mut blk, self.in_size) {
            return if e.is_timeout() {
                JobOutcome::Continue
            } else {
                port_failure(AFE_TAG, "in", e)
            };
        }
        let last = blk.is_last;
        if blk.valid_size > 0 {
            push_dropping_oldest(in_ring, blk.data());
        }
        if let Err(e) = io.release_in(&mut blk) {
            debug!(tag = AFE_TAG, "input release failed: {e}");
        }

        let delay = self.config.delay_samples * 2;
        let filled = out_ring.filled_size();
        let mut outcome = JobOutcome::Continue;
        let mut sent_last = false;
        if filled > delay {
            let mut out = vec![0u8; filled - delay];
            match out_ring.read(&mut out, Wait::Immediate) {
                Ok(n) => {
                    out.truncate(n);
                    if let Err(e) = io.write_out(&out, last) {
                        return port_failure(AFE_TAG, "out", e);
                    }
                    sent_last = last;
                    outcome = JobOutcome::Ok;
                }
                Err(e) => warn!("out ring read failed: {e}"),
            }
        }
        if last {
            if !sent_last {
                forward_end_of_stream(AFE_TAG, io);
            }
            return JobOutcome::Done;
        }
        outcome
    }

    fn close(&mut self, _io: &mut ElementIo) -> Result<()> {
        if self.config.vcmd_detect_en {
            if let Err(e) = self.core.vcmd_cancel() {
                debug!("vcmd cancel on close: {e}");
            }
        }
        if let Some(ring) = self.in_ring.take() {
            ring.abort();
        }
        let manager = &self.config.manager;
        manager.set_read_cb(None)?;
        manager.set_result_cb(None)?;
        if let Some(ring) = self.out_ring.take() {
            ring.abort();
        }
        self.core.disarm();
        self.core.vcmd.lock().recognizer = None;
        debug!("ai_afe closed");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl std::fmt::Debug for AfeElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeElement")
            .field("config", &self.config)
            .field("in_size", &self.in_size)
            .field("open", &self.in_ring.is_some())
            .finish_non_exhaustive()
    }
}
