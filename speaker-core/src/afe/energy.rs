//! Software AFE engine: RMS voice activity with hysteresis, no models.
//!
//! ## Algorithm
//!
//! 1. Pick the first `M` channel out of each interleaved feed chunk.
//! 2. Compute its level in dBFS.
//! 3. Count consecutive loud and quiet time. The VAD flips to `Speech` once
//!    loud time reaches `min_speech_ms` and back to `Silence` once quiet time
//!    reaches `min_noise_ms`. In between it holds its last decision.
//! 4. Queue the mic channel with the decision for `fetch`.
//!
//! Wake words are never detected on their own; [`EnergyAfe::trigger_wakeup`]
//! marks the next queued chunk as a detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{AfeEngine, AfeFeature, AfeFeatures, FetchResult, VadState, WakeupState};
use crate::audio::rms_dbfs;
use crate::error::{Result, SpeakerError};

#[derive(Debug, Clone)]
pub struct EnergyAfeConfig {
    /// One letter per interleaved channel: `M` mic, `R` playback reference,
    /// `N` unused. Default: `"M"`.
    pub input_format: String,
    /// Samples per channel per feed. Default: 512.
    pub chunk_size: usize,
    /// Default: 16000.
    pub sample_rate: u32,
    /// Level at or above which a chunk counts as loud. Default: -40 dBFS.
    pub threshold_dbfs: f32,
    /// Default: 128 ms.
    pub min_speech_ms: u32,
    /// Default: 1000 ms.
    pub min_noise_ms: u32,
    /// Fetched chunks kept before the oldest is dropped. Default: 8.
    pub queue_depth: usize,
    /// Features enabled at creation. Default: wake word and VAD.
    pub features: AfeFeatures,
}

impl Default for EnergyAfeConfig {
    fn default() -> Self {
        Self {
            input_format: "M".into(),
            chunk_size: 512,
            sample_rate: 16_000,
            threshold_dbfs: -40.0,
            min_speech_ms: 128,
            min_noise_ms: 1000,
            queue_depth: 8,
            features: AfeFeatures {
                wakeup: true,
                vad: true,
                ..AfeFeatures::default()
            },
        }
    }
}

#[derive(Debug, Default)]
struct Detector {
    state: VadState,
    loud_ms: u32,
    quiet_ms: u32,
}

impl Detector {
    fn classify(&mut self, loud: bool, chunk_ms: u32, cfg: &EnergyAfeConfig) -> VadState {
        if loud {
            self.loud_ms = self.loud_ms.saturating_add(chunk_ms);
            self.quiet_ms = 0;
            if self.loud_ms >= cfg.min_speech_ms {
                self.state = VadState::Speech;
            }
        } else {
            self.quiet_ms = self.quiet_ms.saturating_add(chunk_ms);
            self.loud_ms = 0;
            if self.quiet_ms >= cfg.min_noise_ms {
                self.state = VadState::Silence;
            }
        }
        self.state
    }
}

pub struct EnergyAfe {
    config: EnergyAfeConfig,
    channels: usize,
    mic_channel: usize,
    chunk_ms: u32,
    detector: Mutex<Detector>,
    features: Mutex<AfeFeatures>,
    wake_pending: AtomicBool,
    tx: Sender<FetchResult>,
    rx: Receiver<FetchResult>,
}

impl EnergyAfe {
    /// # Errors
    /// `InvalidArgument` when the input format has no mic channel or a
    /// size field is zero.
    pub fn new(config: EnergyAfeConfig) -> Result<Self> {
        let channels = config.input_format.len();
        let mic_channel = config
            .input_format
            .chars()
            .position(|c| c == 'M')
            .ok_or_else(|| {
                SpeakerError::InvalidArgument(format!(
                    "input format {:?} has no mic channel",
                    config.input_format
                ))
            })?;
        if config.chunk_size == 0 || config.sample_rate == 0 || config.queue_depth == 0 {
            return Err(SpeakerError::InvalidArgument(
                "chunk size, sample rate and queue depth must be non-zero".into(),
            ));
        }
        let chunk_ms = (config.chunk_size as u64 * 1000 / u64::from(config.sample_rate)) as u32;
        let (tx, rx) = bounded(config.queue_depth);
        info!(
            format = config.input_format.as_str(),
            channels,
            mic_channel,
            chunk = config.chunk_size,
            chunk_ms,
            threshold = config.threshold_dbfs,
            "energy AFE created"
        );
        Ok(Self {
            features: Mutex::new(config.features),
            channels,
            mic_channel,
            chunk_ms,
            detector: Mutex::new(Detector::default()),
            wake_pending: AtomicBool::new(false),
            tx,
            rx,
            config,
        })
    }

    fn push(&self, result: FetchResult) {
        match self.tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => {
                let _ = self.rx.try_recv();
                warn!("AFE result queue full, dropped oldest chunk");
                let _ = self.tx.try_send(result);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl AfeEngine for EnergyAfe {
    fn feed_channel_num(&self) -> usize {
        self.channels
    }

    fn feed_chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    fn fetch_chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    fn init_features(&self) -> AfeFeatures {
        self.config.features
    }

    fn feed(&self, data: &[i16]) -> Result<()> {
        let expected = self.channels * self.config.chunk_size;
        if data.len() != expected {
            return Err(SpeakerError::InvalidArgument(format!(
                "feed of {} samples, expected {expected}",
                data.len()
            )));
        }
        let mic: Vec<i16> = data
            .iter()
            .skip(self.mic_channel)
            .step_by(self.channels)
            .copied()
            .collect();
        let volume_db = rms_dbfs(&mic);
        let features = *self.features.lock();

        let vad = if features.vad {
            let loud = volume_db >= self.config.threshold_dbfs;
            self.detector.lock().classify(loud, self.chunk_ms, &self.config)
        } else {
            VadState::Silence
        };
        let woke = self.wake_pending.swap(false, Ordering::SeqCst);
        let (wakeup, index) = if woke {
            (WakeupState::Detected, 1)
        } else {
            (WakeupState::NotDetected, 0)
        };

        self.push(FetchResult {
            data: mic,
            vad,
            wakeup,
            wake_word_index: index,
            model_index: index,
            volume_db,
        });
        Ok(())
    }

    fn fetch(&self, timeout: Duration) -> Option<FetchResult> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn enable_feature(&self, feature: AfeFeature, on: bool) -> Result<bool> {
        let mut features = self.features.lock();
        let now_on = match feature {
            AfeFeature::WakeNet => {
                features.wakeup = on;
                on
            }
            AfeFeature::Vad => {
                features.vad = on;
                on
            }
            // No echo canceller or speech enhancement in software.
            AfeFeature::Aec | AfeFeature::Se => false,
        };
        debug!(?feature, on, now_on, "energy AFE feature");
        Ok(now_on)
    }

    fn reset_vad(&self) {
        *self.detector.lock() = Detector::default();
    }

    fn trigger_wakeup(&self) {
        self.wake_pending.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for EnergyAfe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnergyAfe")
            .field("input_format", &self.config.input_format)
            .field("chunk_size", &self.config.chunk_size)
            .field("features", &*self.features.lock())
            .field("queued", &self.rx.len())
            .finish_non_exhaustive()
    }
}
