//! AI-Buddy: turns chat-agent and network signals into audio cues and
//! expression changes.
//!
//! ```text
//!  agent / Wi-Fi ──signal()──► inbox ──► dispatch thread ──► Core::handle
//!                                                              │      │
//!                                    AudioScheduler ◄──────────┘      └──► Expression ──► broadcast
//!                                          │
//!                                    PromptSink (prompt slot)
//! ```
//!
//! | signal                      | audio                                 | expression              |
//! |-----------------------------|---------------------------------------|-------------------------|
//! | chat start begins           | server connecting (repeating)         | `server_connecting`     |
//! | chat start ends             | server connected                      | `server_connected`      |
//! | chat stop ends              | server disconnected (repeating)       |                         |
//! | chat sleep ends             | wake-up hint                          | `sleepy`                |
//! | invalid config              | invalid config (repeating)            | `invalid_config`        |
//! | max retry                   | server disconnected (repeating)       |                         |
//! | Wi-Fi lost                  | Wi-Fi disconnected, later reminder    | `wifi_disconnected`     |
//! | got IP                      | Wi-Fi connected                       |                         |

pub mod audio;
pub mod expression;
pub mod scheduler;
pub mod signals;

pub use audio::{pick_weighted, AudioCatalog, AudioCue, AudioEvent, AudioType, WeightedCue};
pub use expression::{AnimFlags, Emotion, Expression, ExpressionMaps, ExpressionUpdate, Face, Icon};
pub use scheduler::{AudioScheduler, Clock, ManualClock, PromptSink, SchedulerConfig, SystemClock};
pub use signals::{BuddySignal, ChatError, ChatEvent, ChatState, SpecialSignal};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::error::{Result, SpeakerError};
use crate::processor::AudioProcessor;
use crate::thread::ThreadSettings;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The conversational agent behind the buddy.
pub trait ChatAgent: Send + Sync {
    fn has_chat_state(&self, state: ChatState) -> bool;
    fn send_chat_event(&self, event: ChatEvent, clear_queue: bool) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
}

/// Microphone feed on/off switch.
pub trait MicControl: Send + Sync {
    fn suspend(&self, suspend: bool) -> Result<()>;
}

impl MicControl for AudioProcessor {
    fn suspend(&self, suspend: bool) -> Result<()> {
        AudioProcessor::suspend(self, suspend)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BuddyConfig {
    pub scheduler: SchedulerConfig,
    /// Default: `"buddy_signal"`, 10 KiB stack.
    pub dispatch_thread: ThreadSettings,
    /// Plays of a repeating status cue. Default: 3.
    pub loop_count: i32,
    /// Gap between repeats of a status cue. Default: 20 s.
    pub repeat_interval: Duration,
    /// Wait before nagging about a missing network. Default: 10 s.
    pub wifi_reminder_delay: Duration,
    /// Wait before reconnecting after a credit error. Default: 60 s.
    pub credit_backoff: Duration,
    /// Treat the network as up before the first got-IP signal. Default: `false`.
    pub network_up: bool,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        let repeat_interval = Duration::from_secs(20);
        Self {
            scheduler: SchedulerConfig::default(),
            dispatch_thread: ThreadSettings::named("buddy_signal").with_stack(10 * 1024),
            loop_count: 3,
            repeat_interval,
            wifi_reminder_delay: Duration::from_secs(10),
            credit_backoff: repeat_interval * 3,
            network_up: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct Core {
    config: BuddyConfig,
    scheduler: AudioScheduler,
    expression: Expression,
    agent: Arc<dyn ChatAgent>,
    mic: Arc<dyn MicControl>,
    begun: AtomicBool,
    paused: AtomicBool,
    wifi: AtomicBool,
    speaking: AtomicBool,
    credit_error: AtomicBool,
}

impl Core {
    fn wifi(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }

    fn repeating(&self, kind: AudioType) -> AudioEvent {
        AudioEvent::repeat(
            kind,
            self.config.loop_count,
            self.config.repeat_interval.as_millis() as u64,
        )
    }

    fn play(&self, event: AudioEvent) -> Result<()> {
        self.scheduler.send_audio_event(event)
    }

    fn play_random(&self, table: fn(&AudioCatalog) -> &[WeightedCue]) -> Result<AudioType> {
        self.scheduler.play_random_audio(table(self.scheduler.catalog()))
    }

    fn emoji(&self, name: &str, immediate: bool) -> Result<()> {
        let anim = AnimFlags {
            immediate,
            ..AnimFlags::default()
        };
        self.expression.set_emoji(name, anim, anim)
    }

    fn sleepy(&self) -> Result<()> {
        let emotion = AnimFlags {
            repeat: false,
            keep_when_stop: true,
            immediate: true,
        };
        self.expression.set_emoji("sleepy", emotion, AnimFlags::default())
    }

    fn icon(&self, name: &str) -> Result<()> {
        self.expression.set_system_icon(name, AnimFlags::default())
    }

    /// Run `f` after `delay` on its own thread, unless the buddy has been
    /// shut down or dropped by then.
    fn after(self: &Arc<Self>, name: &str, delay: Duration, f: impl FnOnce(&Core) -> Result<()> + Send + 'static) {
        let weak: Weak<Core> = Arc::downgrade(self);
        let label = name.to_string();
        let spawned = ThreadSettings::named(name).spawn(move || {
            std::thread::sleep(delay);
            let Some(core) = weak.upgrade() else { return };
            if !core.begun.load(Ordering::SeqCst) {
                debug!(task = label.as_str(), "buddy stopped, delayed action skipped");
                return;
            }
            if let Err(e) = f(&core) {
                warn!(task = label.as_str(), "delayed action failed: {e}");
            }
        });
        if let Err(e) = spawned {
            error!(task = name, "failed to schedule delayed action: {e}");
        }
    }

    fn remind_wifi(self: &Arc<Self>) {
        let delay = self.config.wifi_reminder_delay;
        self.after("wifi_check", delay, |core| {
            if core.wifi() {
                return Ok(());
            }
            info!("network still down, reminding");
            core.play(core.repeating(AudioType::WifiNeedConnect))
        });
    }

    fn handle(self: &Arc<Self>, signal: &BuddySignal) -> Result<()> {
        debug!(?signal, "buddy signal");
        match signal {
            BuddySignal::ChatEventStart { event } => self.on_chat_start(*event),
            BuddySignal::ChatEventEnd { event } => self.on_chat_end(*event),
            BuddySignal::Special { signal } => match signal {
                SpecialSignal::InitInvalidConfig => {
                    self.play(self.repeating(AudioType::InvalidConfig))?;
                    self.icon("invalid_config")
                }
                SpecialSignal::StartMaxRetry => {
                    self.scheduler.stop_audio(AudioType::ServerConnecting);
                    self.play(self.repeating(AudioType::ServerDisconnected))
                }
            },
            BuddySignal::Response => {
                if self.wifi() {
                    self.play_random(|c| c.response.as_slice())?;
                }
                Ok(())
            }
            BuddySignal::WakeUpRequest { wake } => self.on_wake_request(*wake),
            BuddySignal::Emoji { name } => self.emoji(name, name.as_str() != "neutral"),
            BuddySignal::Speaking { speaking } => {
                if !self.wifi() {
                    return Ok(());
                }
                if !*speaking {
                    self.emoji("neutral", false)?;
                }
                self.speaking.store(*speaking, Ordering::SeqCst);
                Ok(())
            }
            BuddySignal::WebsocketDisconnected => self.on_websocket_disconnected(),
            BuddySignal::ChatError { error } => match error {
                ChatError::InsufficientCredits => {
                    warn!("chat agent is out of credits");
                    self.credit_error.store(true, Ordering::SeqCst);
                    self.play(self.repeating(AudioType::InsufficientCredits))
                }
                ChatError::Code(code) => {
                    warn!(code, "chat agent error");
                    Ok(())
                }
            },
            BuddySignal::WifiDisconnected => self.on_wifi_disconnected(),
            BuddySignal::GotIp => self.on_got_ip(),
            BuddySignal::TerminateChat => self.terminate_chat(),
        }
    }

    fn on_chat_start(&self, event: ChatEvent) -> Result<()> {
        match event {
            ChatEvent::Init => self.emoji("neutral", true),
            ChatEvent::Start => {
                self.scheduler.stop_audio(AudioType::ServerDisconnected);
                self.play(self.repeating(AudioType::ServerConnecting))?;
                self.icon("server_connecting")
            }
            _ => Ok(()),
        }
    }

    fn on_chat_end(self: &Arc<Self>, event: ChatEvent) -> Result<()> {
        match event {
            ChatEvent::Init => {
                if !self.wifi() {
                    self.icon("wifi_disconnected")?;
                    self.remind_wifi();
                } else if !self.agent.has_chat_state(ChatState::Start) {
                    self.agent.send_chat_event(ChatEvent::Start, true)?;
                }
                Ok(())
            }
            ChatEvent::Stop => self.play(self.repeating(AudioType::ServerDisconnected)),
            ChatEvent::Start => {
                self.credit_error.store(false, Ordering::SeqCst);
                self.scheduler.stop_audio(AudioType::ServerConnecting);
                self.play(AudioEvent::once(AudioType::ServerConnected))?;
                self.icon("server_connected")?;
                if !self.paused.load(Ordering::SeqCst) {
                    self.agent.resume()?;
                    self.agent.send_chat_event(ChatEvent::Sleep, true)
                } else {
                    self.scheduler.stop_audio(AudioType::MicOn);
                    self.play(AudioEvent::once(AudioType::MicOff))
                }
            }
            ChatEvent::Sleep => {
                self.sleepy()?;
                self.play(AudioEvent::once(AudioType::WakeUp))
            }
            ChatEvent::WakeUp => self.emoji("neutral", true),
            ChatEvent::Deinit => Ok(()),
        }
    }

    fn on_wake_request(&self, wake: bool) -> Result<()> {
        if !self.wifi() {
            debug!(wake, "network down, wake request ignored");
            return Ok(());
        }
        let sleeping = self.agent.has_chat_state(ChatState::Sleep);
        if wake {
            self.emoji("neutral", true)?;
            if sleeping {
                self.agent.send_chat_event(ChatEvent::WakeUp, true)?;
            }
        } else if !sleeping {
            self.play_random(|c| c.sleep.as_slice())?;
            self.agent.send_chat_event(ChatEvent::Sleep, true)?;
        }
        Ok(())
    }

    fn on_websocket_disconnected(self: &Arc<Self>) -> Result<()> {
        if !self.wifi() {
            return Ok(());
        }
        if self.agent.has_chat_state(ChatState::Start) {
            self.agent.send_chat_event(ChatEvent::Stop, true)?;
        }
        if self.credit_error.load(Ordering::SeqCst) {
            info!(backoff = ?self.config.credit_backoff, "out of credits, delaying reconnect");
            let delay = self.config.credit_backoff;
            self.after("credit_backoff", delay, |core| {
                if core.agent.has_chat_state(ChatState::Start) || !core.wifi() {
                    return Ok(());
                }
                core.agent.send_chat_event(ChatEvent::Start, true)
            });
            Ok(())
        } else {
            self.agent.send_chat_event(ChatEvent::Start, false)
        }
    }

    fn on_wifi_disconnected(self: &Arc<Self>) -> Result<()> {
        if !self.wifi.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("network lost");
        self.agent.send_chat_event(ChatEvent::Stop, true)?;
        self.emoji("neutral", true)?;
        self.icon("wifi_disconnected")?;
        self.play(AudioEvent::once(AudioType::WifiDisconnected))?;
        self.remind_wifi();
        Ok(())
    }

    fn on_got_ip(&self) -> Result<()> {
        self.wifi.store(true, Ordering::SeqCst);
        info!("network up");
        if self.agent.has_chat_state(ChatState::Inited) && !self.agent.has_chat_state(ChatState::Start) {
            self.agent.send_chat_event(ChatEvent::Start, true)?;
        }
        self.scheduler.stop_audio(AudioType::WifiNeedConnect);
        self.play(AudioEvent::once(AudioType::WifiConnected))
    }

    fn terminate_chat(&self) -> Result<()> {
        self.play_random(|c| c.sleep.as_slice())?;
        self.agent.send_chat_event(ChatEvent::Sleep, true)
    }
}

// ---------------------------------------------------------------------------
// AiBuddy
// ---------------------------------------------------------------------------

enum Inbox {
    Signal(BuddySignal),
    Shutdown,
}

pub struct AiBuddy {
    core: Arc<Core>,
    control: Mutex<()>,
    inbox: Mutex<Option<Sender<Inbox>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl AiBuddy {
    pub fn new(
        config: BuddyConfig,
        catalog: AudioCatalog,
        maps: ExpressionMaps,
        agent: Arc<dyn ChatAgent>,
        mic: Arc<dyn MicControl>,
        sink: Arc<dyn PromptSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = AudioScheduler::new(config.scheduler.clone(), Arc::new(catalog), sink, clock);
        let wifi = config.network_up;
        Self {
            core: Arc::new(Core {
                config,
                scheduler,
                expression: Expression::new(maps),
                agent,
                mic,
                begun: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                wifi: AtomicBool::new(wifi),
                speaking: AtomicBool::new(false),
                credit_error: AtomicBool::new(false),
            }),
            control: Mutex::new(()),
            inbox: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start the cue worker and signal dispatcher, then ask the agent to
    /// initialise. Calling it on a running buddy is a no-op.
    ///
    /// # Errors
    /// Thread creation failures, or the agent refusing `Init`; everything
    /// started so far is torn down again.
    pub fn begin(&self) -> Result<()> {
        let _guard = self.control.lock();
        if self.core.begun.load(Ordering::SeqCst) {
            warn!("buddy already begun");
            return Ok(());
        }
        self.core.scheduler.start()?;

        let (tx, rx) = unbounded();
        let core = Arc::clone(&self.core);
        let handle = match self
            .core
            .config
            .dispatch_thread
            .spawn(move || dispatch_main(core, rx))
        {
            Ok(h) => h,
            Err(e) => {
                self.core.scheduler.shutdown();
                return Err(e);
            }
        };
        *self.inbox.lock() = Some(tx);
        *self.dispatcher.lock() = Some(handle);
        self.core.begun.store(true, Ordering::SeqCst);

        if let Err(e) = self.core.agent.send_chat_event(ChatEvent::Init, true) {
            error!("chat agent init failed: {e}");
            self.teardown();
            return Err(e);
        }
        info!("buddy begun");
        Ok(())
    }

    /// Stop the dispatcher and cue worker. Idempotent.
    pub fn shutdown(&self) {
        let _guard = self.control.lock();
        if !self.core.begun.load(Ordering::SeqCst) {
            return;
        }
        self.teardown();
        info!("buddy shut down");
    }

    fn teardown(&self) {
        self.core.begun.store(false, Ordering::SeqCst);
        if let Some(tx) = self.inbox.lock().take() {
            let _ = tx.send(Inbox::Shutdown);
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!("buddy dispatcher panicked");
            }
        }
        self.core.scheduler.shutdown();
        self.core.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_begun(&self) -> bool {
        self.core.begun.load(Ordering::SeqCst)
    }

    /// Queue a signal for the dispatch thread.
    ///
    /// # Errors
    /// `NotRunning` before [`begin`](Self::begin) or after shutdown.
    pub fn signal(&self, signal: BuddySignal) -> Result<()> {
        let inbox = self.inbox.lock();
        let tx = inbox.as_ref().ok_or(SpeakerError::NotRunning)?;
        tx.send(Inbox::Signal(signal)).map_err(|_| SpeakerError::NotRunning)
    }

    /// Handle a signal on the calling thread.
    pub fn handle(&self, signal: &BuddySignal) -> Result<()> {
        self.core.handle(signal)
    }

    /// Pause the agent and the face; the microphone goes quiet.
    ///
    /// # Errors
    /// `InvalidState` before [`begin`](Self::begin); agent failures.
    pub fn pause(&self) -> Result<()> {
        let _guard = self.control.lock();
        let core = &self.core;
        if !core.begun.load(Ordering::SeqCst) {
            return Err(SpeakerError::InvalidState("buddy not begun".into()));
        }
        if core.paused.load(Ordering::SeqCst) {
            warn!("buddy already paused");
            return Ok(());
        }
        core.agent.pause()?;
        if core.agent.has_chat_state(ChatState::Started) {
            core.scheduler.stop_audio(AudioType::MicOn);
            core.play(AudioEvent::once(AudioType::MicOff))?;
        } else if core.agent.has_chat_state(ChatState::Inited) {
            core.mic.suspend(true).inspect_err(|e| error!("mic suspend failed: {e}"))?;
        }
        core.expression.pause();
        core.paused.store(true, Ordering::SeqCst);
        info!("buddy paused");
        Ok(())
    }

    /// # Errors
    /// `InvalidState` before [`begin`](Self::begin); agent failures.
    pub fn resume(&self) -> Result<()> {
        let _guard = self.control.lock();
        let core = &self.core;
        if !core.begun.load(Ordering::SeqCst) {
            return Err(SpeakerError::InvalidState("buddy not begun".into()));
        }
        if !core.paused.load(Ordering::SeqCst) {
            warn!("buddy not paused");
            return Ok(());
        }
        let started = core.agent.has_chat_state(ChatState::Started);
        if started {
            core.agent.resume()?;
            core.scheduler.stop_audio(AudioType::MicOff);
            core.play(AudioEvent::once(AudioType::MicOn))?;
            if !core.agent.has_chat_state(ChatState::Sleep) {
                core.agent.send_chat_event(ChatEvent::Sleep, true)?;
            } else {
                core.play(AudioEvent::once(AudioType::WakeUp))?;
            }
        }
        core.expression.resume(true, true);
        if started {
            core.sleepy()?;
        }
        if core.agent.has_chat_state(ChatState::Inited) {
            core.mic.suspend(false).inspect_err(|e| error!("mic resume failed: {e}"))?;
        }
        core.paused.store(false, Ordering::SeqCst);
        info!("buddy resumed");
        Ok(())
    }

    /// Say goodbye and put the session to sleep.
    pub fn terminate_chat(&self) -> Result<()> {
        self.core.terminate_chat()
    }

    pub fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::SeqCst)
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.core.wifi()
    }

    pub fn is_speaking(&self) -> bool {
        self.core.speaking.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &AudioScheduler {
        &self.core.scheduler
    }

    pub fn expression(&self) -> &Expression {
        &self.core.expression
    }

    pub fn subscribe_expression(&self) -> broadcast::Receiver<ExpressionUpdate> {
        self.core.expression.subscribe()
    }
}

impl Drop for AiBuddy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AiBuddy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiBuddy")
            .field("begun", &self.is_begun())
            .field("paused", &self.is_paused())
            .field("wifi", &self.is_wifi_connected())
            .field("scheduler", &self.core.scheduler)
            .finish_non_exhaustive()
    }
}

fn dispatch_main(core: Arc<Core>, rx: Receiver<Inbox>) {
    let span = info_span!("buddy_signal");
    let _enter = span.enter();
    for msg in rx.iter() {
        match msg {
            Inbox::Signal(signal) => {
                if let Err(e) = core.handle(&signal) {
                    warn!(?signal, "signal handling failed: {e}");
                }
            }
            Inbox::Shutdown => break,
        }
    }
    debug!("buddy dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Instant;

    #[derive(Default)]
    struct MockAgent {
        states: Mutex<HashSet<ChatState>>,
        events: Mutex<Vec<(ChatEvent, bool)>>,
        pauses: std::sync::atomic::AtomicUsize,
        resumes: std::sync::atomic::AtomicUsize,
    }

    impl MockAgent {
        fn with(states: &[ChatState]) -> Arc<Self> {
            let agent = Self::default();
            agent.states.lock().extend(states.iter().copied());
            Arc::new(agent)
        }

        fn sent(&self, event: ChatEvent) -> Vec<bool> {
            self.events
                .lock()
                .iter()
                .filter(|(e, _)| *e == event)
                .map(|(_, clear)| *clear)
                .collect()
        }
    }

    impl ChatAgent for MockAgent {
        fn has_chat_state(&self, state: ChatState) -> bool {
            self.states.lock().contains(&state)
        }
        fn send_chat_event(&self, event: ChatEvent, clear_queue: bool) -> Result<()> {
            self.events.lock().push((event, clear_queue));
            Ok(())
        }
        fn pause(&self) -> Result<()> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn resume(&self) -> Result<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockMic {
        calls: Mutex<Vec<bool>>,
    }

    impl MicControl for MockMic {
        fn suspend(&self, suspend: bool) -> Result<()> {
            self.calls.lock().push(suspend);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<String>>,
    }

    impl PromptSink for RecordingSink {
        fn play_blocking(&self, url: &str) -> Result<()> {
            self.played.lock().push(url.to_string());
            Ok(())
        }
    }

    struct Rig {
        buddy: AiBuddy,
        agent: Arc<MockAgent>,
        mic: Arc<MockMic>,
        sink: Arc<RecordingSink>,
    }

    fn rig(config: BuddyConfig, agent: Arc<MockAgent>) -> Rig {
        let mic = Arc::new(MockMic::default());
        let sink = Arc::new(RecordingSink::default());
        let buddy = AiBuddy::new(
            config,
            AudioCatalog::default(),
            ExpressionMaps::default(),
            agent.clone(),
            mic.clone(),
            sink.clone(),
            Arc::new(ManualClock::default()),
        );
        Rig { buddy, agent, mic, sink }
    }

    fn online() -> BuddyConfig {
        BuddyConfig {
            network_up: true,
            ..BuddyConfig::default()
        }
    }

    fn url(kind: AudioType) -> String {
        AudioCatalog::default().cue(kind).map(|c| c.url.clone()).unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn begin_initialises_the_agent_once() {
        let r = rig(online(), MockAgent::with(&[]));
        assert!(matches!(r.buddy.signal(BuddySignal::GotIp), Err(SpeakerError::NotRunning)));
        r.buddy.begin().unwrap();
        r.buddy.begin().unwrap();
        assert_eq!(r.agent.sent(ChatEvent::Init), vec![true]);
        r.buddy.shutdown();
        r.buddy.shutdown();
        assert!(!r.buddy.is_begun());
    }

    #[test]
    fn chat_start_shows_connecting_until_started() {
        let r = rig(online(), MockAgent::with(&[ChatState::Inited]));
        let sched = r.buddy.scheduler();
        r.buddy
            .handle(&BuddySignal::ChatEventStart { event: ChatEvent::Start })
            .unwrap();
        assert_eq!(sched.pending(AudioType::ServerConnecting), 1);
        assert_eq!(r.buddy.expression().current_system_icon().as_deref(), Some("server_connecting"));

        r.buddy
            .handle(&BuddySignal::ChatEventEnd { event: ChatEvent::Start })
            .unwrap();
        assert_eq!(sched.pending(AudioType::ServerConnecting), 0);
        assert_eq!(sched.pending(AudioType::ServerConnected), 1);
        assert_eq!(r.agent.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(r.agent.sent(ChatEvent::Sleep), vec![true]);
    }

    #[test]
    fn start_while_paused_announces_the_mic_is_off() {
        let r = rig(online(), MockAgent::with(&[]));
        r.buddy.core.paused.store(true, Ordering::SeqCst);
        r.buddy
            .handle(&BuddySignal::ChatEventEnd { event: ChatEvent::Start })
            .unwrap();
        assert_eq!(r.buddy.scheduler().pending(AudioType::MicOff), 1);
        assert_eq!(r.agent.resumes.load(Ordering::SeqCst), 0);
        assert!(r.agent.sent(ChatEvent::Sleep).is_empty());
    }

    #[test]
    fn init_end_starts_chat_only_when_online() {
        let r = rig(online(), MockAgent::with(&[ChatState::Inited]));
        r.buddy.handle(&BuddySignal::ChatEventEnd { event: ChatEvent::Init }).unwrap();
        assert_eq!(r.agent.sent(ChatEvent::Start), vec![true]);

        let offline = rig(BuddyConfig::default(), MockAgent::with(&[ChatState::Inited]));
        offline
            .buddy
            .handle(&BuddySignal::ChatEventEnd { event: ChatEvent::Init })
            .unwrap();
        assert!(offline.agent.sent(ChatEvent::Start).is_empty());
        assert_eq!(
            offline.buddy.expression().current_system_icon().as_deref(),
            Some("wifi_disconnected")
        );
    }

    #[test]
    fn wifi_reminder_fires_after_the_delay() {
        let config = BuddyConfig {
            wifi_reminder_delay: Duration::from_millis(10),
            ..BuddyConfig::default()
        };
        let r = rig(config, MockAgent::with(&[]));
        r.buddy.begin().unwrap();
        r.buddy
            .signal(BuddySignal::ChatEventEnd { event: ChatEvent::Init })
            .unwrap();
        let want = url(AudioType::WifiNeedConnect);
        wait_for(|| r.sink.played.lock().contains(&want));
        r.buddy.shutdown();
    }

    #[test]
    fn got_ip_then_loss_round_trip() {
        let r = rig(BuddyConfig::default(), MockAgent::with(&[ChatState::Inited]));
        let sched = r.buddy.scheduler();
        r.buddy.handle(&BuddySignal::GotIp).unwrap();
        assert!(r.buddy.is_wifi_connected());
        assert_eq!(r.agent.sent(ChatEvent::Start), vec![true]);
        assert_eq!(sched.pending(AudioType::WifiConnected), 1);

        r.buddy.handle(&BuddySignal::WifiDisconnected).unwrap();
        r.buddy.handle(&BuddySignal::WifiDisconnected).unwrap();
        assert!(!r.buddy.is_wifi_connected());
        assert_eq!(r.agent.sent(ChatEvent::Stop), vec![true]);
        assert_eq!(sched.pending(AudioType::WifiDisconnected), 1);
        assert_eq!(r.buddy.expression().current_emoji().as_deref(), Some("neutral"));
    }

    #[test]
    fn websocket_drop_reconnects_without_clearing_the_queue() {
        let r = rig(online(), MockAgent::with(&[ChatState::Start]));
        r.buddy.handle(&BuddySignal::WebsocketDisconnected).unwrap();
        assert_eq!(r.agent.sent(ChatEvent::Stop), vec![true]);
        assert_eq!(r.agent.sent(ChatEvent::Start), vec![false]);
    }

    #[test]
    fn credit_error_delays_the_reconnect() {
        let config = BuddyConfig {
            credit_backoff: Duration::from_millis(200),
            ..online()
        };
        let r = rig(config, MockAgent::with(&[]));
        r.buddy.begin().unwrap();
        r.buddy
            .handle(&BuddySignal::ChatError { error: ChatError::InsufficientCredits })
            .unwrap();
        r.buddy.handle(&BuddySignal::WebsocketDisconnected).unwrap();
        assert!(r.agent.sent(ChatEvent::Start).is_empty());
        wait_for(|| r.agent.sent(ChatEvent::Start) == vec![true]);
        let credits = url(AudioType::InsufficientCredits);
        wait_for(|| r.sink.played.lock().contains(&credits));
        r.buddy.shutdown();
    }

    #[test]
    fn sleep_request_says_goodbye() {
        let r = rig(online(), MockAgent::with(&[]));
        r.buddy.handle(&BuddySignal::WakeUpRequest { wake: false }).unwrap();
        assert_eq!(r.agent.sent(ChatEvent::Sleep), vec![true]);
        let sched = r.buddy.scheduler();
        let goodbyes: usize = AudioCatalog::default()
            .sleep
            .iter()
            .map(|e| sched.pending(e.kind))
            .sum();
        assert_eq!(goodbyes, 1);
    }

    #[test]
    fn wake_request_wakes_a_sleeping_agent() {
        let r = rig(online(), MockAgent::with(&[ChatState::Sleep]));
        r.buddy.handle(&BuddySignal::WakeUpRequest { wake: true }).unwrap();
        assert_eq!(r.agent.sent(ChatEvent::WakeUp), vec![true]);
        assert_eq!(r.buddy.expression().current_emoji().as_deref(), Some("neutral"));

        r.buddy.handle(&BuddySignal::WakeUpRequest { wake: false }).unwrap();
        assert!(r.agent.sent(ChatEvent::Sleep).is_empty());
    }

    #[test]
    fn offline_buddy_ignores_chatter() {
        let r = rig(BuddyConfig::default(), MockAgent::with(&[]));
        r.buddy.handle(&BuddySignal::Response).unwrap();
        r.buddy.handle(&BuddySignal::Speaking { speaking: true }).unwrap();
        r.buddy.handle(&BuddySignal::WebsocketDisconnected).unwrap();
        assert!(!r.buddy.is_speaking());
        assert!(r.agent.events.lock().is_empty());
        let sched = r.buddy.scheduler();
        assert!(AudioType::ALL.iter().all(|k| sched.pending(*k) == 0));
    }

    #[test]
    fn emoji_signal_is_immediate_unless_neutral() {
        let r = rig(online(), MockAgent::with(&[]));
        let mut rx = r.buddy.subscribe_expression();
        r.buddy.handle(&BuddySignal::Emoji { name: "happy".into() }).unwrap();
        r.buddy.handle(&BuddySignal::Emoji { name: "neutral".into() }).unwrap();
        let immediates: Vec<bool> = (0..2)
            .map(|_| match rx.try_recv().unwrap() {
                ExpressionUpdate::Emoji { emotion_anim, .. } => emotion_anim.immediate,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(immediates, vec![true, false]);
        assert!(r.buddy.handle(&BuddySignal::Emoji { name: "grumpy".into() }).is_err());
    }

    #[test]
    fn special_signals_queue_status_cues() {
        let r = rig(online(), MockAgent::with(&[]));
        let sched = r.buddy.scheduler();
        r.buddy
            .handle(&BuddySignal::Special { signal: SpecialSignal::InitInvalidConfig })
            .unwrap();
        assert_eq!(sched.pending(AudioType::InvalidConfig), 1);
        assert_eq!(r.buddy.expression().current_system_icon().as_deref(), Some("invalid_config"));

        r.buddy
            .handle(&BuddySignal::ChatEventStart { event: ChatEvent::Start })
            .unwrap();
        r.buddy
            .handle(&BuddySignal::Special { signal: SpecialSignal::StartMaxRetry })
            .unwrap();
        assert_eq!(sched.pending(AudioType::ServerConnecting), 0);
        assert_eq!(sched.pending(AudioType::ServerDisconnected), 1);
    }

    #[test]
    fn pause_and_resume_while_started() {
        let r = rig(online(), MockAgent::with(&[ChatState::Inited, ChatState::Started]));
        assert!(matches!(r.buddy.pause(), Err(SpeakerError::InvalidState(_))));
        r.buddy.begin().unwrap();
        r.buddy.pause().unwrap();
        r.buddy.pause().unwrap();
        assert!(r.buddy.is_paused());
        assert!(r.buddy.expression().is_paused());
        assert_eq!(r.agent.pauses.load(Ordering::SeqCst), 1);
        let off = url(AudioType::MicOff);
        wait_for(|| r.sink.played.lock().contains(&off));

        r.buddy.resume().unwrap();
        assert!(!r.buddy.is_paused());
        assert_eq!(r.agent.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(r.agent.sent(ChatEvent::Sleep), vec![true]);
        assert_eq!(r.buddy.expression().current_emoji().as_deref(), Some("sleepy"));
        assert_eq!(*r.mic.calls.lock(), vec![false]);
        let on = url(AudioType::MicOn);
        wait_for(|| r.sink.played.lock().contains(&on));
        r.buddy.shutdown();
    }

    #[test]
    fn pause_before_start_suspends_the_mic() {
        let r = rig(online(), MockAgent::with(&[ChatState::Inited]));
        r.buddy.begin().unwrap();
        r.buddy.pause().unwrap();
        assert_eq!(*r.mic.calls.lock(), vec![true]);
        r.buddy.resume().unwrap();
        assert_eq!(*r.mic.calls.lock(), vec![true, false]);
        assert_eq!(r.agent.resumes.load(Ordering::SeqCst), 0);
        r.buddy.shutdown();
    }

    #[test]
    fn terminate_chat_sleeps_the_agent() {
        let r = rig(online(), MockAgent::with(&[]));
        r.buddy.terminate_chat().unwrap();
        assert_eq!(r.agent.sent(ChatEvent::Sleep), vec![true]);
    }
}
