//! Cue scheduler: queues audio events and plays them one at a time through
//! the prompt slot.
//!
//! ```text
//!  send_audio_event ──► next ─┐
//!                             │ splice each pass
//!  worker (poll 100 ms) ──► current ──► PromptSink::play_blocking(url)
//! ```
//!
//! | `repeat_count` | plays                     |
//! |----------------|---------------------------|
//! | `-1`           | until cancelled           |
//! | `0`            | once                      |
//! | `N > 0`        | `N`                       |
//!
//! Sending a cue replaces every queued or active entry of the same type.
//! Cancellation bumps a per-type generation; entries carrying an older
//! generation are pruned at the start and end of every pass, and a pass stops
//! early when a cancellation lands while it is playing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, error, info, info_span, warn};

use super::audio::{pick_weighted, total_weight, AudioCatalog, AudioEvent, AudioType, WeightedCue};
use crate::error::{Result, SpeakerError};
use crate::processor::AudioProcessor;
use crate::thread::ThreadSettings;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Plays one cue to completion.
pub trait PromptSink: Send + Sync {
    fn play_blocking(&self, url: &str) -> Result<()>;
}

impl PromptSink for AudioProcessor {
    fn play_blocking(&self, url: &str) -> Result<()> {
        self.prompt_play_with_block(url, -1)
    }
}

/// Millisecond time source for repeat throttling.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Default: `"audio_event"`, 10 KiB stack.
    pub thread: ThreadSettings,
    /// Longest the worker sleeps between passes. Default: 100 ms.
    pub poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread: ThreadSettings::named("audio_event").with_stack(10 * 1024),
            poll: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    event: AudioEvent,
    generation: u64,
    created_ms: u64,
    last_played_ms: Option<u64>,
}

impl Entry {
    fn exhausted(&self) -> bool {
        self.last_played_ms.is_some() && self.event.repeat_count == 0
    }
}

#[derive(Default)]
struct Queue {
    next: Vec<Entry>,
    current: Vec<Entry>,
    generations: HashMap<AudioType, u64>,
    cancels: u64,
    playing: Option<AudioType>,
    shutdown: bool,
}

impl Queue {
    fn generation(&self, kind: AudioType) -> u64 {
        self.generations.get(&kind).copied().unwrap_or(0)
    }

    fn is_live(&self, entry: &Entry) -> bool {
        entry.generation == self.generation(entry.event.kind)
    }
}

struct Inner {
    catalog: Arc<AudioCatalog>,
    sink: Arc<dyn PromptSink>,
    clock: Arc<dyn Clock>,
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Inner {
    fn cancel(&self, q: &mut Queue, kind: AudioType) {
        *q.generations.entry(kind).or_insert(0) += 1;
        q.cancels += 1;
        q.next.retain(|e| e.event.kind != kind);
    }

    fn run_pass(&self) -> usize {
        let (mut batch, cancels) = {
            let mut q = self.queue.lock();
            let mut current = std::mem::take(&mut q.current);
            current.retain(|e| q.is_live(e));
            let next = std::mem::take(&mut q.next);
            current.extend(next);
            (current, q.cancels)
        };
        if batch.is_empty() {
            return 0;
        }

        let mut played = 0;
        for entry in batch.iter_mut() {
            if !self.queue.lock().is_live(entry) {
                continue;
            }
            if self.process(entry) {
                played += 1;
            }
            if self.queue.lock().cancels != cancels {
                debug!("cancellation during pass, ending early");
                break;
            }
        }

        let mut q = self.queue.lock();
        batch.retain(|e| !e.exhausted() && q.is_live(e));
        let late = std::mem::take(&mut q.current);
        batch.extend(late);
        q.current = batch;
        played
    }

    /// Play `entry` if its repeat interval has elapsed. Returns whether the
    /// cue played successfully; a failed play still counts as an attempt.
    fn process(&self, entry: &mut Entry) -> bool {
        let kind = entry.event.kind;
        let Some(cue) = self.catalog.cue(kind) else {
            error!(cue = ?kind, "no file for audio cue");
            entry.event.repeat_count = 0;
            entry.last_played_ms.get_or_insert(0);
            return false;
        };
        let now = self.clock.now_ms();
        if let Some(last) = entry.last_played_ms {
            if last.saturating_add(entry.event.repeat_interval_ms) > now {
                return false;
            }
        }

        let occupying_ms = {
            let q = self.queue.lock();
            q.playing.and_then(|p| self.catalog.cue(p)).map_or(0, |c| c.duration_ms)
        };
        info!(
            cue = ?kind,
            repeat_count = entry.event.repeat_count,
            created_ms = entry.created_ms,
            last_played_ms = ?entry.last_played_ms,
            occupying_ms,
            "playing audio cue"
        );
        let res = self.sink.play_blocking(&cue.url);
        match &res {
            Ok(()) => self.queue.lock().playing = Some(kind),
            Err(e) => error!(cue = ?kind, "audio cue failed: {e}"),
        }
        entry.last_played_ms = Some(self.clock.now_ms());
        if entry.event.repeat_count > 0 {
            entry.event.repeat_count -= 1;
        }
        res.is_ok()
    }

    fn worker_main(&self, poll: Duration) {
        let span = info_span!("audio_event");
        let _enter = span.enter();
        info!("audio event worker started");
        loop {
            {
                let mut q = self.queue.lock();
                if q.shutdown {
                    break;
                }
                self.wake.wait_for(&mut q, poll);
                if q.shutdown {
                    break;
                }
            }
            self.run_pass();
        }
        info!("audio event worker exiting");
    }
}

// ---------------------------------------------------------------------------
// AudioScheduler
// ---------------------------------------------------------------------------

pub struct AudioScheduler {
    config: SchedulerConfig,
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioScheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: Arc<AudioCatalog>,
        sink: Arc<dyn PromptSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            inner: Arc::new(Inner {
                catalog,
                sink,
                clock,
                queue: Mutex::new(Queue::default()),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &AudioCatalog {
        &self.inner.catalog
    }

    /// Spawn the worker thread.
    ///
    /// # Errors
    /// `AlreadyRunning` on a second call; `ResourceExhausted` if the thread
    /// cannot be created.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SpeakerError::AlreadyRunning);
        }
        self.inner.queue.lock().shutdown = false;
        let inner = Arc::clone(&self.inner);
        let poll = self.config.poll;
        *worker = Some(self.config.thread.spawn(move || inner.worker_main(poll))?);
        Ok(())
    }

    /// Stop the worker and drop everything queued. The cue being played, if
    /// any, finishes first.
    pub fn shutdown(&self) {
        {
            let mut q = self.inner.queue.lock();
            q.shutdown = true;
            q.next.clear();
            q.current.clear();
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("audio event worker panicked");
            }
        }
    }

    /// Queue `event`, replacing any queued or active entry of the same type.
    ///
    /// # Errors
    /// `NotFound` when the catalog has no file for the cue; nothing is
    /// cancelled in that case.
    pub fn send_audio_event(&self, event: AudioEvent) -> Result<()> {
        if self.inner.catalog.cue(event.kind).is_none() {
            error!(cue = ?event.kind, "unknown audio cue");
            return Err(SpeakerError::NotFound(format!("audio cue {:?}", event.kind)));
        }
        let created_ms = self.inner.clock.now_ms();
        let mut q = self.inner.queue.lock();
        self.inner.cancel(&mut q, event.kind);
        let generation = q.generation(event.kind);
        debug!(cue = ?event.kind, repeat_count = event.repeat_count, "audio cue queued");
        q.next.push(Entry {
            event,
            generation,
            created_ms,
            last_played_ms: None,
        });
        self.inner.wake.notify_all();
        Ok(())
    }

    /// Cancel every queued or active entry of `kind`.
    pub fn stop_audio(&self, kind: AudioType) {
        let mut q = self.inner.queue.lock();
        self.inner.cancel(&mut q, kind);
        debug!(cue = ?kind, "audio cue cancelled");
    }

    /// One worker iteration. Returns how many cues played successfully.
    pub fn run_pass(&self) -> usize {
        self.inner.run_pass()
    }

    /// Most recently played cue.
    pub fn playing_type(&self) -> Option<AudioType> {
        self.inner.queue.lock().playing
    }

    /// Entries of `kind` still waiting to play, queued or active.
    pub fn pending(&self, kind: AudioType) -> usize {
        let q = self.inner.queue.lock();
        q.next
            .iter()
            .chain(q.current.iter())
            .filter(|e| e.event.kind == kind && q.is_live(e))
            .count()
    }

    /// Queue one cue picked at random by weight from `table`.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty or weightless table.
    pub fn play_random_audio(&self, table: &[WeightedCue]) -> Result<AudioType> {
        let total = total_weight(table);
        if table.is_empty() || total <= 0.0 {
            warn!("random audio table is empty");
            return Err(SpeakerError::InvalidArgument("empty random audio table".into()));
        }
        let draw = rand::thread_rng().gen_range(0.0..=total);
        let kind = pick_weighted(table, draw)
            .or_else(|| table.last().map(|e| e.kind))
            .ok_or_else(|| SpeakerError::InvalidArgument("empty random audio table".into()))?;
        self.send_audio_event(AudioEvent::once(kind))?;
        Ok(kind)
    }
}

impl Drop for AudioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AudioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.inner.queue.lock();
        f.debug_struct("AudioScheduler")
            .field("next", &q.next.len())
            .field("current", &q.current.len())
            .field("playing", &q.playing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<String>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl PromptSink for RecordingSink {
        fn play_blocking(&self, url: &str) -> Result<()> {
            self.played.lock().push(url.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(SpeakerError::Device("speaker gone".into()));
            }
            Ok(())
        }
    }

    fn scheduler() -> (AudioScheduler, Arc<RecordingSink>, Arc<ManualClock>) {
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::default());
        let sched = AudioScheduler::new(
            SchedulerConfig::default(),
            Arc::new(AudioCatalog::default()),
            sink.clone(),
            clock.clone(),
        );
        (sched, sink, clock)
    }

    fn url(kind: AudioType) -> String {
        AudioCatalog::default().cue(kind).map(|c| c.url.clone()).unwrap()
    }

    #[test]
    fn once_plays_a_single_time() {
        let (sched, sink, _) = scheduler();
        sched.send_audio_event(AudioEvent::once(AudioType::MicOn)).unwrap();
        assert_eq!(sched.run_pass(), 1);
        assert_eq!(sched.run_pass(), 0);
        assert_eq!(*sink.played.lock(), vec![url(AudioType::MicOn)]);
        assert_eq!(sched.playing_type(), Some(AudioType::MicOn));
        assert_eq!(sched.pending(AudioType::MicOn), 0);
    }

    #[test]
    fn counted_repeats_respect_the_interval() {
        let (sched, sink, clock) = scheduler();
        sched
            .send_audio_event(AudioEvent::repeat(AudioType::ServerConnecting, 2, 1000))
            .unwrap();
        assert_eq!(sched.run_pass(), 1);
        clock.set(999);
        assert_eq!(sched.run_pass(), 0);
        clock.set(1000);
        assert_eq!(sched.run_pass(), 1);
        clock.set(5000);
        assert_eq!(sched.run_pass(), 0);
        assert_eq!(sink.played.lock().len(), 2);
    }

    #[test]
    fn infinite_repeats_until_stopped() {
        let (sched, sink, clock) = scheduler();
        sched
            .send_audio_event(AudioEvent::repeat(AudioType::WifiNeedConnect, AudioEvent::INFINITE, 10))
            .unwrap();
        for i in 0..5 {
            clock.set(i * 10);
            assert_eq!(sched.run_pass(), 1);
        }
        sched.stop_audio(AudioType::WifiNeedConnect);
        clock.set(1000);
        assert_eq!(sched.run_pass(), 0);
        assert_eq!(sink.played.lock().len(), 5);
        assert_eq!(sched.pending(AudioType::WifiNeedConnect), 0);
    }

    #[test]
    fn resend_replaces_the_queued_entry() {
        let (sched, sink, _) = scheduler();
        sched.send_audio_event(AudioEvent::once(AudioType::WakeUp)).unwrap();
        sched.send_audio_event(AudioEvent::once(AudioType::WakeUp)).unwrap();
        assert_eq!(sched.pending(AudioType::WakeUp), 1);
        assert_eq!(sched.run_pass(), 1);
        assert_eq!(sink.played.lock().len(), 1);
    }

    #[test]
    fn resend_replaces_an_active_repeating_entry() {
        let (sched, sink, clock) = scheduler();
        sched
            .send_audio_event(AudioEvent::repeat(AudioType::ServerDisconnected, 3, 20_000))
            .unwrap();
        assert_eq!(sched.run_pass(), 1);
        // The replacement plays right away instead of waiting out the interval.
        clock.set(10);
        sched.send_audio_event(AudioEvent::once(AudioType::ServerDisconnected)).unwrap();
        assert_eq!(sched.run_pass(), 1);
        clock.set(100_000);
        assert_eq!(sched.run_pass(), 0);
        assert_eq!(sink.played.lock().len(), 2);
    }

    #[test]
    fn failed_play_counts_as_an_attempt() {
        let (sched, sink, _) = scheduler();
        sink.fail.store(true, Ordering::SeqCst);
        sched.send_audio_event(AudioEvent::once(AudioType::MicOff)).unwrap();
        assert_eq!(sched.run_pass(), 0);
        assert_eq!(sched.run_pass(), 0);
        assert_eq!(sink.played.lock().len(), 1);
        assert_eq!(sched.playing_type(), None);
    }

    #[test]
    fn unknown_cue_is_rejected_without_side_effects() {
        let sink = Arc::new(RecordingSink::default());
        let sched = AudioScheduler::new(
            SchedulerConfig::default(),
            Arc::new(AudioCatalog {
                cues: Default::default(),
                response: Vec::new(),
                sleep: Vec::new(),
            }),
            sink.clone(),
            Arc::new(ManualClock::default()),
        );
        let err = sched.send_audio_event(AudioEvent::once(AudioType::MicOn)).unwrap_err();
        assert!(matches!(err, SpeakerError::NotFound(_)));
        assert_eq!(sched.run_pass(), 0);
        assert!(sched.play_random_audio(&[]).is_err());
    }

    #[test]
    fn cancellation_mid_pass_ends_the_pass() {
        struct CancellingSink {
            sched: Mutex<Option<Arc<AudioScheduler>>>,
            plays: AtomicUsize,
        }
        impl PromptSink for CancellingSink {
            fn play_blocking(&self, _url: &str) -> Result<()> {
                self.plays.fetch_add(1, Ordering::SeqCst);
                if let Some(s) = self.sched.lock().as_ref() {
                    s.stop_audio(AudioType::MicOff);
                }
                Ok(())
            }
        }
        let sink = Arc::new(CancellingSink {
            sched: Mutex::new(None),
            plays: AtomicUsize::new(0),
        });
        let sched = Arc::new(AudioScheduler::new(
            SchedulerConfig::default(),
            Arc::new(AudioCatalog::default()),
            sink.clone(),
            Arc::new(ManualClock::default()),
        ));
        *sink.sched.lock() = Some(Arc::clone(&sched));
        sched.send_audio_event(AudioEvent::once(AudioType::MicOn)).unwrap();
        sched.send_audio_event(AudioEvent::once(AudioType::MicOff)).unwrap();
        assert_eq!(sched.run_pass(), 1);
        assert_eq!(sink.plays.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending(AudioType::MicOff), 0);
        *sink.sched.lock() = None;
    }

    #[test]
    fn random_pick_comes_from_the_table() {
        let (sched, sink, _) = scheduler();
        let table = AudioCatalog::default().sleep;
        let kind = sched.play_random_audio(&table).unwrap();
        assert!(table.iter().any(|e| e.kind == kind));
        assert_eq!(sched.run_pass(), 1);
        assert_eq!(*sink.played.lock(), vec![url(kind)]);
    }

    #[test]
    fn worker_plays_queued_cues() {
        let (sched, sink, _) = scheduler();
        sched.start().unwrap();
        assert!(matches!(sched.start(), Err(SpeakerError::AlreadyRunning)));
        sched.send_audio_event(AudioEvent::once(AudioType::WifiConnected)).unwrap();
        let start = Instant::now();
        while sink.played.lock().is_empty() {
            assert!(start.elapsed() < Duration::from_secs(2), "cue never played");
            std::thread::sleep(Duration::from_millis(2));
        }
        sched.shutdown();
        assert_eq!(sink.played.lock().len(), 1);
    }
}
