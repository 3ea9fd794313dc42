//! Threaded wrapper around an [`AfeEngine`].
//!
//! ## Threads
//!
//! - **feed**: waits for RUN, pulls one full chunk through the read callback
//!   and feeds it. Short reads are dropped, never fed partially.
//! - **fetch**: waits for RUN, fetches a processed chunk and hands it to the
//!   result callback.
//!
//! Both threads hold the shared state by `Arc`, so a thread that outlives the
//! bounded wait in [`AfeManager::destroy`] still sees a live engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use super::{AfeEngine, AfeFeature, AfeFeatures, FetchResult};
use crate::audio::bytes_to_i16;
use crate::error::{Result, SpeakerError};
use crate::sync::{EventGroup, Wait, WaitMode};
use crate::thread::ThreadSettings;

const RUN: u32 = 1 << 0;
const DESTROYING: u32 = 1 << 1;
const FEED_DESTROYED: u32 = 1 << 2;
const FETCH_DESTROYED: u32 = 1 << 3;

/// Fills the buffer with mic PCM within the wait budget; returns bytes read.
pub type ReadFn = Box<dyn FnMut(&mut [u8], Wait) -> usize + Send>;
pub type ResultFn = Arc<dyn Fn(&FetchResult) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AfeManagerConfig {
    /// Default: `"afe_feed"`, 5 KiB, priority 6, core 0.
    pub feed_thread: ThreadSettings,
    /// Default: `"afe_fetch"`, 5 KiB, priority 6, core 1.
    pub fetch_thread: ThreadSettings,
    /// Budget handed to the read callback. Default: 500 ms.
    pub read_timeout: Duration,
    /// How long one `fetch` may block before the RUN bit is checked again.
    /// Default: 100 ms.
    pub fetch_poll: Duration,
    /// Bound on waiting for both threads in `destroy`. Default: 1000 ms.
    pub destroy_timeout: Duration,
}

impl Default for AfeManagerConfig {
    fn default() -> Self {
        Self {
            feed_thread: ThreadSettings::named("afe_feed")
                .with_stack(5 * 1024)
                .with_priority(6)
                .with_core(0),
            fetch_thread: ThreadSettings::named("afe_fetch")
                .with_stack(5 * 1024)
                .with_priority(6)
                .with_core(1),
            read_timeout: Duration::from_millis(500),
            fetch_poll: Duration::from_millis(100),
            destroy_timeout: Duration::from_millis(1000),
        }
    }
}

/// Live counters for the two threads.
#[derive(Debug, Default)]
pub struct AfeDiagnostics {
    pub reads: AtomicUsize,
    pub short_reads: AtomicUsize,
    pub feeds: AtomicUsize,
    pub feed_errors: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl AfeDiagnostics {
    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.short_reads.store(0, Ordering::Relaxed);
        self.feeds.store(0, Ordering::Relaxed);
        self.feed_errors.store(0, Ordering::Relaxed);
        self.fetches.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AfeSnapshot {
        AfeSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            feeds: self.feeds.load(Ordering::Relaxed),
            feed_errors: self.feed_errors.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AfeSnapshot {
    pub reads: usize,
    pub short_reads: usize,
    pub feeds: usize,
    pub feed_errors: usize,
    pub fetches: usize,
}

struct Shared {
    engine: Arc<dyn AfeEngine>,
    bits: EventGroup,
    read_cb: Mutex<Option<ReadFn>>,
    result_cb: Mutex<Option<ResultFn>>,
    features: Mutex<AfeFeatures>,
    diagnostics: AfeDiagnostics,
    read_timeout: Duration,
    fetch_poll: Duration,
}

impl Shared {
    fn wait_run(&self) -> bool {
        let bits = self
            .bits
            .wait(RUN | DESTROYING, WaitMode::Any, false, Wait::Forever)
            .unwrap_or(DESTROYING);
        bits & DESTROYING == 0
    }

    fn feed_loop(&self) {
        let span = info_span!("afe_feed");
        let _enter = span.enter();
        let channels = self.engine.feed_channel_num();
        let chunk = self.engine.feed_chunk_size();
        let buf_size = chunk * channels * 2;
        info!(channels, chunk, buf_size, "feed thread started");
        let mut buf = vec![0u8; buf_size];
        let mut samples = Vec::with_capacity(chunk * channels);

        while self.wait_run() {
            let rlen = {
                let mut cb = self.read_cb.lock();
                match cb.as_mut() {
                    Some(read) => read(&mut buf, Wait::For(self.read_timeout)),
                    None => 0,
                }
            };
            self.diagnostics.reads.fetch_add(1, Ordering::Relaxed);
            if rlen != buf_size {
                self.diagnostics.short_reads.fetch_add(1, Ordering::Relaxed);
                error!(rlen, buf_size, "AFE read failed, chunk dropped");
                if rlen == 0 {
                    std::thread::sleep(Duration::from_millis(10));
                }
                continue;
            }
            samples.clear();
            bytes_to_i16(&buf, &mut samples);
            match self.engine.feed(&samples) {
                Ok(()) => {
                    self.diagnostics.feeds.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.diagnostics.feed_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("engine feed failed: {e}");
                }
            }
        }
        debug!("feed thread exiting");
        self.bits.set(FEED_DESTROYED);
    }

    fn fetch_loop(&self) {
        let span = info_span!("afe_fetch");
        let _enter = span.enter();
        info!(chunk = self.engine.fetch_chunk_size(), "fetch thread started");
        while self.wait_run() {
            let Some(result) = self.engine.fetch(self.fetch_poll) else {
                continue;
            };
            self.diagnostics.fetches.fetch_add(1, Ordering::Relaxed);
            let cb = self.result_cb.lock().clone();
            if let Some(cb) = cb {
                cb(&result);
            }
        }
        debug!("fetch thread exiting");
        self.bits.set(FETCH_DESTROYED);
    }
}

/// Owns the engine and its feed/fetch threads.
pub struct AfeManager {
    shared: Arc<Shared>,
    threads: Mutex<Vec<(u32, JoinHandle<()>)>>,
    destroyed: AtomicBool,
    destroy_timeout: Duration,
}

impl AfeManager {
    /// Start both threads. Without a read callback the manager starts
    /// suspended.
    ///
    /// # Errors
    /// `ResourceExhausted` when a thread cannot be spawned; anything already
    /// started is torn down first.
    pub fn create(
        config: AfeManagerConfig,
        engine: Arc<dyn AfeEngine>,
        read_cb: Option<ReadFn>,
    ) -> Result<Arc<Self>> {
        let features = engine.init_features();
        info!(
            channels = engine.feed_channel_num(),
            chunk = engine.feed_chunk_size(),
            ?features,
            "creating AFE manager"
        );
        let running = read_cb.is_some();
        let shared = Arc::new(Shared {
            engine,
            bits: crate::sync::EventGroup::new(),
            read_cb: Mutex::new(read_cb),
            result_cb: Mutex::new(None),
            features: Mutex::new(features),
            diagnostics: AfeDiagnostics::default(),
            read_timeout: config.read_timeout,
            fetch_poll: config.fetch_poll,
        });
        if running {
            shared.bits.set(RUN);
        }

        let manager = Arc::new(Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            destroy_timeout: config.destroy_timeout,
        });

        let feed_shared = Arc::clone(&shared);
        let feed = config.feed_thread.spawn(move || feed_shared.feed_loop());
        let feed = match feed {
            Ok(h) => h,
            Err(e) => {
                manager.destroy();
                return Err(e);
            }
        };
        manager.threads.lock().push((FEED_DESTROYED, feed));

        let fetch_shared = Arc::clone(&shared);
        match config.fetch_thread.spawn(move || fetch_shared.fetch_loop()) {
            Ok(h) => manager.threads.lock().push((FETCH_DESTROYED, h)),
            Err(e) => {
                manager.destroy();
                return Err(e);
            }
        }
        Ok(manager)
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(SpeakerError::InvalidState("AFE manager destroyed".into()))
        } else {
            Ok(())
        }
    }

    /// Swap the read callback. The manager is suspended while swapping and
    /// resumes only when the new callback is present.
    pub fn set_read_cb(&self, read_cb: Option<ReadFn>) -> Result<()> {
        self.check_alive()?;
        self.suspend(true)?;
        let resume = read_cb.is_some();
        *self.shared.read_cb.lock() = read_cb;
        if resume {
            self.suspend(false)?;
        }
        Ok(())
    }

    pub fn set_result_cb(&self, result_cb: Option<ResultFn>) -> Result<()> {
        self.check_alive()?;
        *self.shared.result_cb.lock() = result_cb;
        Ok(())
    }

    pub fn suspend(&self, suspend: bool) -> Result<()> {
        self.check_alive()?;
        info!(suspend, "AFE manager suspend");
        if suspend {
            self.shared.bits.clear(RUN);
        } else {
            self.shared.bits.set(RUN);
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.bits.get() & RUN == 0
    }

    /// Toggle an engine feature and mirror the outcome. Changing VAD also
    /// resets its state.
    pub fn enable_features(&self, feature: AfeFeature, enable: bool) -> Result<()> {
        self.check_alive()?;
        let now_on = self.shared.engine.enable_feature(feature, enable)?;
        debug!(?feature, enable, now_on, "AFE feature ctrl");
        {
            let mut feat = self.shared.features.lock();
            match feature {
                AfeFeature::WakeNet => feat.wakeup = now_on,
                AfeFeature::Vad => feat.vad = now_on,
                AfeFeature::Aec => feat.aec = now_on,
                AfeFeature::Se => feat.se = now_on,
            }
        }
        if feature == AfeFeature::Vad {
            self.shared.engine.reset_vad();
        }
        Ok(())
    }

    pub fn features(&self) -> AfeFeatures {
        *self.shared.features.lock()
    }

    /// Samples per channel per feed.
    pub fn chunk_size(&self) -> usize {
        self.shared.engine.feed_chunk_size()
    }

    pub fn input_ch_num(&self) -> usize {
        self.shared.engine.feed_channel_num()
    }

    pub fn trigger_wakeup(&self) {
        self.shared.engine.trigger_wakeup();
    }

    pub fn diagnostics(&self) -> AfeSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn reset_diagnostics(&self) {
        self.shared.diagnostics.reset();
    }

    /// Stop both threads. Waits at most `destroy_timeout`; a thread that
    /// has not exited by then is detached and finishes on its own.
    /// Calling it again is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.bits.set(DESTROYING);
        let threads: Vec<_> = std::mem::take(&mut *self.threads.lock());
        let wait_bits = threads.iter().fold(0, |acc, (bit, _)| acc | bit);
        if wait_bits != 0 {
            let got = self
                .shared
                .bits
                .wait(wait_bits, WaitMode::All, false, Wait::For(self.destroy_timeout));
            if got.is_none() {
                warn!(
                    bits = self.shared.bits.get(),
                    "AFE threads did not exit in time, detaching"
                );
            }
        }
        let exited = self.shared.bits.get();
        for (bit, handle) in threads {
            if exited & bit != 0 && handle.join().is_err() {
                error!("AFE thread panicked");
            }
        }
        *self.shared.read_cb.lock() = None;
        *self.shared.result_cb.lock() = None;
        info!("AFE manager destroyed");
    }
}

impl Drop for AfeManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for AfeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfeManager")
            .field("features", &self.features())
            .field("suspended", &self.is_suspended())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afe::{VadState, WakeupState};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::time::Instant;

    /// Counts feeds and returns one result per feed.
    struct MockEngine {
        feeds: AtomicUsize,
        tx: Sender<FetchResult>,
        rx: Receiver<FetchResult>,
    }

    impl MockEngine {
        fn new() -> Self {
            let (tx, rx) = bounded(64);
            Self {
                feeds: AtomicUsize::new(0),
                tx,
                rx,
            }
        }
    }

    impl AfeEngine for MockEngine {
        fn feed_channel_num(&self) -> usize {
            2
        }
        fn feed_chunk_size(&self) -> usize {
            4
        }
        fn fetch_chunk_size(&self) -> usize {
            4
        }
        fn init_features(&self) -> AfeFeatures {
            AfeFeatures {
                wakeup: true,
                vad: true,
                ..AfeFeatures::default()
            }
        }
        fn feed(&self, data: &[i16]) -> Result<()> {
            assert_eq!(data.len(), 8);
            self.feeds.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.try_send(FetchResult {
                data: data[..4].to_vec(),
                vad: VadState::Speech,
                wakeup: WakeupState::NotDetected,
                ..FetchResult::default()
            });
            Ok(())
        }
        fn fetch(&self, timeout: Duration) -> Option<FetchResult> {
            self.rx.recv_timeout(timeout).ok()
        }
        fn enable_feature(&self, _feature: AfeFeature, on: bool) -> Result<bool> {
            Ok(on)
        }
        fn reset_vad(&self) {}
        fn trigger_wakeup(&self) {}
    }

    fn poll(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition not met");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn fast_config() -> AfeManagerConfig {
        AfeManagerConfig {
            fetch_poll: Duration::from_millis(10),
            ..AfeManagerConfig::default()
        }
    }

    #[test]
    fn short_reads_are_never_fed() {
        let engine = Arc::new(MockEngine::new());
        // 16 bytes needed; every third read comes up short.
        let mut n = 0usize;
        let read: ReadFn = Box::new(move |buf: &mut [u8], _wait| {
            n += 1;
            if n > 9 {
                std::thread::sleep(Duration::from_millis(5));
                return 0;
            }
            if n % 3 == 0 {
                7
            } else {
                buf.len()
            }
        });
        let mgr = AfeManager::create(fast_config(), engine.clone(), Some(read)).unwrap();
        poll(|| mgr.diagnostics().reads >= 9);
        mgr.suspend(true).unwrap();
        let snap = mgr.diagnostics();
        assert!(snap.short_reads >= 3);
        assert_eq!(engine.feeds.load(Ordering::SeqCst), 6);
        assert_eq!(snap.feeds, 6);
        mgr.destroy();
    }

    #[test]
    fn results_reach_the_callback() {
        let engine = Arc::new(MockEngine::new());
        let mgr = AfeManager::create(fast_config(), engine, None).unwrap();
        assert!(mgr.is_suspended());

        let got = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&got);
        mgr.set_result_cb(Some(Arc::new(move |r: &FetchResult| {
            assert_eq!(r.data.len(), 4);
            sink.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        mgr.set_read_cb(Some(Box::new(|buf: &mut [u8], _wait| {
            std::thread::sleep(Duration::from_millis(1));
            buf.len()
        })))
        .unwrap();
        assert!(!mgr.is_suspended());
        poll(|| got.load(Ordering::SeqCst) >= 3);

        mgr.set_read_cb(None).unwrap();
        assert!(mgr.is_suspended());
    }

    #[test]
    fn features_mirror_engine() {
        let mgr = AfeManager::create(fast_config(), Arc::new(MockEngine::new()), None).unwrap();
        assert!(mgr.features().wakeup);
        mgr.enable_features(AfeFeature::Vad, false).unwrap();
        assert!(!mgr.features().vad);
        mgr.enable_features(AfeFeature::Aec, true).unwrap();
        assert!(mgr.features().aec);
        assert_eq!(mgr.chunk_size(), 4);
        assert_eq!(mgr.input_ch_num(), 2);
    }

    #[test]
    fn destroy_twice_is_harmless() {
        let mgr = AfeManager::create(fast_config(), Arc::new(MockEngine::new()), None).unwrap();
        mgr.destroy();
        mgr.destroy();
        assert!(matches!(mgr.suspend(false), Err(SpeakerError::InvalidState(_))));
    }
}
