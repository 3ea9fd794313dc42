//! Microphone capture: `codec in → ai_afe → rate_cvt → encoder → ring`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::afe::{AfeEngine, AfeManager, AfeManagerConfig, EnergyAfe, EnergyAfeConfig};
use crate::codec::CodecDevice;
use crate::data_bus::{DataBus, RingBuffer};
use crate::elements::{
    AfeControl, AfeElement, AfeElementConfig, AfeEvent, AfeEventFn, Encoder, EncoderFormat, RateConvert,
    AFE_TAG, ENCODER_TAG, RATE_CVT_TAG,
};
use crate::error::{Result, SpeakerError};
use crate::graph::{BusIo, CodecIo, Pipeline, PipelineEvent, Pool, Port, PortDir, PortKind, SoundInfo, Task, TaskConfig};
use crate::sync::Wait;
use crate::thread::ThreadSettings;

pub type RecorderEventFn = Arc<dyn Fn(&AfeEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Software front end built by [`Recorder::open`]. Default: mono mic,
    /// 512-sample chunks.
    pub afe: EnergyAfeConfig,
    /// Default: feed and fetch threads at priority 6 with 5 KiB stacks.
    pub manager: AfeManagerConfig,
    /// Default: `"recorder"`, 5 KiB, priority 6, core 0.
    pub task: TaskConfig,
    /// Capacity of the encoded-output ring. Default: 3072 bytes.
    pub out_ring_size: usize,
    /// Bytes requested from the codec per read. Default: 2048.
    pub in_bytes: usize,
    /// Default: 100 ms.
    pub in_wait: Duration,
    /// Default: 8000.
    pub out_rate: u32,
    /// Default: `G711a`.
    pub format: EncoderFormat,
    /// Default: 30 s.
    pub wakeup_end: Duration,
    /// Default: `false`.
    pub vcmd_detect_en: bool,
    /// Open the command window on wake word instead of on VAD start.
    /// Default: `false`.
    pub command_on_wakeup: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            afe: EnergyAfeConfig::default(),
            manager: AfeManagerConfig::default(),
            task: TaskConfig {
                thread: ThreadSettings::named("recorder")
                    .with_stack(5 * 1024)
                    .with_priority(6)
                    .with_core(0),
                ..TaskConfig::default()
            },
            out_ring_size: 3 * 1024,
            in_bytes: 2048,
            in_wait: Duration::from_millis(100),
            out_rate: 8000,
            format: EncoderFormat::G711a,
            wakeup_end: Duration::from_secs(30),
            vcmd_detect_en: false,
            command_on_wakeup: false,
        }
    }
}

struct Active {
    ring: Arc<RingBuffer>,
    manager: Arc<AfeManager>,
    control: AfeControl,
    // The event hook only holds a `Weak` to this, so dropping `Active`
    // releases the element core and with it the manager.
    control_slot: Arc<Mutex<Option<AfeControl>>>,
    pipeline: Pipeline,
}

/// Owns the capture pipeline between `open` and `close`.
pub struct Recorder {
    config: RecorderConfig,
    pool: Arc<Mutex<Pool>>,
    rec_dev: Arc<dyn CodecDevice>,
    active: Mutex<Option<Active>>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, pool: Arc<Mutex<Pool>>, rec_dev: Arc<dyn CodecDevice>) -> Self {
        Self {
            config,
            pool,
            rec_dev,
            active: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Build and start the capture pipeline around a fresh [`EnergyAfe`].
    ///
    /// # Errors
    /// `InvalidState` when already open; otherwise whatever the engine,
    /// manager, pipeline or task reported. Nothing stays allocated on error.
    pub fn open(&self, cb: RecorderEventFn) -> Result<()> {
        let engine = EnergyAfe::new(self.config.afe.clone())?;
        self.open_with_engine(Arc::new(engine), cb)
    }

    /// Same as [`open`](Self::open) with a caller-supplied engine.
    pub fn open_with_engine(&self, engine: Arc<dyn AfeEngine>, cb: RecorderEventFn) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(SpeakerError::InvalidState("recorder already open".into()));
        }
        match self.build(engine, cb) {
            Ok(built) => *active = Some(built),
            Err(e) => {
                self.pool.lock().unregister_element(AFE_TAG);
                return Err(e);
            }
        }
        info!(rate = self.config.out_rate, format = ?self.config.format, "recorder opened");
        Ok(())
    }

    // Locals drop in reverse order, so an early return tears down whatever
    // was already built: pipeline, then task, then manager.
    fn build(&self, engine: Arc<dyn AfeEngine>, cb: RecorderEventFn) -> Result<Active> {
        let ring = Arc::new(RingBuffer::new(self.config.out_ring_size, 1)?);
        let manager = AfeManager::create(self.config.manager.clone(), engine, None)?;
        let guard = ManagerGuard(Some(Arc::clone(&manager)));

        let control_slot: Arc<Mutex<Option<AfeControl>>> = Arc::new(Mutex::new(None));
        let mut el_cfg = AfeElementConfig::new(Arc::clone(&manager));
        el_cfg.wakeup_end = self.config.wakeup_end;
        el_cfg.vcmd_detect_en = self.config.vcmd_detect_en;
        el_cfg.event = Some(event_hook(
            cb,
            Arc::downgrade(&control_slot),
            self.config.vcmd_detect_en,
            self.config.command_on_wakeup,
        ));

        let pipeline = {
            let mut pool = self.pool.lock();
            pool.unregister_element(AFE_TAG);
            pool.register_element(Box::new(AfeElement::new(el_cfg)));
            pool.new_pipeline(None, &[AFE_TAG, RATE_CVT_TAG, ENCODER_TAG], None)?
        };

        let bus: Arc<dyn DataBus> = ring.clone();
        let out = BusIo::new("rec_out", PortDir::Out, PortKind::Byte, bus);
        pipeline.reg_el_port(ENCODER_TAG, PortDir::Out, Port::new(Arc::new(out), 0, Wait::Forever))?;
        let input = CodecIo::new("codec_in", PortDir::In, Arc::clone(&self.rec_dev));
        pipeline.reg_el_port(
            AFE_TAG,
            PortDir::In,
            Port::new(Arc::new(input), self.config.in_bytes, Wait::For(self.config.in_wait)),
        )?;

        let rate = self.config.out_rate;
        pipeline.with_element::<RateConvert, _>(RATE_CVT_TAG, |r| r.set_dest_rate(rate))?;
        let format = self.config.format;
        pipeline.with_element::<Encoder, _>(ENCODER_TAG, |e| e.reconfig(format, SoundInfo::new(rate, 1, 16)))??;
        let control = pipeline.with_element::<AfeElement, _>(AFE_TAG, |a| a.control())?;
        *control_slot.lock() = Some(control.clone());

        let task = Arc::new(Task::new(self.config.task.clone())?);
        pipeline.bind_task(task)?;
        pipeline.loading_jobs()?;
        pipeline.set_event(Some(Arc::new(|ev: &PipelineEvent| {
            debug!(from = ev.source.as_str(), kind = ?ev.kind, state = %ev.state, "recorder pipeline event");
        })));
        pipeline.run()?;

        guard.disarm();
        Ok(Active {
            ring,
            manager,
            control,
            control_slot,
            pipeline,
        })
    }

    /// Stop and release everything. Closing a closed recorder is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(active) = self.active.lock().take() else {
            warn!("recorder already closed");
            return Ok(());
        };
        // Wake the encoder if it is parked on a full ring.
        active.ring.abort();
        if let Err(e) = active.pipeline.stop() {
            debug!("recorder pipeline stop: {e}");
        }
        drop(active.pipeline);
        active.manager.destroy();
        active.control_slot.lock().take();
        active.control.set_event(None);
        self.pool.lock().unregister_element(AFE_TAG);
        info!("recorder closed");
        Ok(())
    }

    /// Block until `buf` is full of encoded audio.
    ///
    /// Returns fewer bytes only when the pipeline finished.
    ///
    /// # Errors
    /// `InvalidState` when closed, `Aborted` when closed while waiting.
    pub fn read_data(&self, buf: &mut [u8]) -> Result<usize> {
        let ring = self
            .active
            .lock()
            .as_ref()
            .map(|a| Arc::clone(&a.ring))
            .ok_or_else(|| SpeakerError::InvalidState("recorder not open".into()))?;
        ring.read(buf, Wait::Forever)
    }

    /// # Errors
    /// `InvalidState` when closed.
    pub fn suspend(&self, suspend: bool) -> Result<()> {
        self.with_active(|a| a.manager.suspend(suspend))?
    }

    pub fn trigger_wakeup(&self) -> Result<()> {
        self.with_active(|a| a.manager.trigger_wakeup())
    }

    /// Control handle of the running `ai_afe`.
    pub fn afe_control(&self) -> Option<AfeControl> {
        self.active.lock().as_ref().map(|a| a.control.clone())
    }

    pub fn manager(&self) -> Option<Arc<AfeManager>> {
        self.active.lock().as_ref().map(|a| Arc::clone(&a.manager))
    }

    fn with_active<R>(&self, f: impl FnOnce(&Active) -> R) -> Result<R> {
        self.active
            .lock()
            .as_ref()
            .map(f)
            .ok_or_else(|| SpeakerError::InvalidState("recorder not open".into()))
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("open", &self.is_open())
            .field("out_rate", &self.config.out_rate)
            .field("format", &self.config.format)
            .finish_non_exhaustive()
    }
}

/// Destroys the manager unless the build went through.
struct ManagerGuard(Option<Arc<AfeManager>>);

impl ManagerGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for ManagerGuard {
    fn drop(&mut self) {
        if let Some(manager) = self.0.take() {
            manager.destroy();
        }
    }
}

fn event_hook(
    cb: RecorderEventFn,
    control: Weak<Mutex<Option<AfeControl>>>,
    vcmd: bool,
    command_on_wakeup: bool,
) -> AfeEventFn {
    Arc::new(move |ev: &AfeEvent| {
        cb(ev);
        let ctl = if vcmd {
            control.upgrade().and_then(|slot| slot.lock().clone())
        } else {
            None
        };
        let window = |open: bool| {
            if let Some(ctl) = ctl.as_ref() {
                if let Err(e) = ctl.vcmd_detection_cancel() {
                    debug!("vcmd window cancel failed: {e}");
                }
                if open {
                    if let Err(e) = ctl.vcmd_detection_begin() {
                        warn!("vcmd window open failed: {e}");
                    }
                }
            }
        };
        match ev {
            AfeEvent::WakeupStart(info) => {
                if command_on_wakeup {
                    window(true);
                }
                info!(word = info.wake_word_index, model = info.model_index, "WAKEUP_START");
            }
            AfeEvent::WakeupEnd => {
                if command_on_wakeup {
                    window(false);
                }
                info!("WAKEUP_END");
            }
            AfeEvent::VadStart => {
                if !command_on_wakeup {
                    window(true);
                }
                info!("VAD_START");
            }
            AfeEvent::VadEnd => {
                if !command_on_wakeup {
                    window(false);
                }
                info!("VAD_END");
            }
            AfeEvent::VcmdTimeout => info!("VCMD_DECT_TIMEOUT"),
            AfeEvent::VcmdDetected(cmd) => {
                warn!(phrase = cmd.phrase_id, prob = cmd.prob, text = cmd.text.as_str(), "command detected");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NullCodec;
    use crate::elements::WakeState;

    fn pool() -> Arc<Mutex<Pool>> {
        let mut pool = Pool::new();
        pool.register_element(Box::new(RateConvert::default()));
        pool.register_element(Box::new(Encoder::default()));
        Arc::new(Mutex::new(pool))
    }

    fn recorder() -> Recorder {
        let dev = Arc::new(NullCodec::paced(SoundInfo::new(16_000, 1, 16)));
        Recorder::new(RecorderConfig::default(), pool(), dev)
    }

    #[test]
    fn reads_encoded_silence() {
        let rec = recorder();
        rec.open(Arc::new(|_: &AfeEvent| {})).unwrap();
        let mut buf = [0u8; 160];
        assert_eq!(rec.read_data(&mut buf).unwrap(), 160);
        // A-law silence.
        assert!(buf.iter().all(|b| *b == 0xD5));
        assert_eq!(rec.afe_control().map(|c| c.wake_state()), Some(WakeState::Idle));
        rec.close().unwrap();
    }

    #[test]
    fn double_open_is_rejected_and_close_is_idempotent() {
        let rec = recorder();
        rec.open(Arc::new(|_: &AfeEvent| {})).unwrap();
        assert!(matches!(
            rec.open(Arc::new(|_: &AfeEvent| {})),
            Err(SpeakerError::InvalidState(_))
        ));
        rec.close().unwrap();
        rec.close().unwrap();
        assert!(!rec.is_open());
        assert!(matches!(rec.read_data(&mut [0u8; 4]), Err(SpeakerError::InvalidState(_))));
        assert!(rec.suspend(true).is_err());
    }

    #[test]
    fn failed_open_leaves_nothing_behind() {
        let rec = Recorder::new(
            RecorderConfig::default(),
            Arc::new(Mutex::new(Pool::new())),
            Arc::new(NullCodec::default()),
        );
        assert!(matches!(
            rec.open(Arc::new(|_: &AfeEvent| {})),
            Err(SpeakerError::NotFound(_))
        ));
        assert!(!rec.is_open());
        assert!(rec.pool.lock().element_tags().is_empty());
    }

    #[test]
    fn reopen_after_close_works() {
        let rec = recorder();
        for _ in 0..2 {
            rec.open(Arc::new(|_: &AfeEvent| {})).unwrap();
            let mut buf = [0u8; 32];
            assert_eq!(rec.read_data(&mut buf).unwrap(), 32);
            rec.close().unwrap();
        }
        assert!(rec.pool.lock().element_tags().iter().all(|t| *t != AFE_TAG));
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn close_releases_manager_and_element_core() {
        let rec = Recorder::new(
            RecorderConfig {
                vcmd_detect_en: true,
                ..RecorderConfig::default()
            },
            pool(),
            Arc::new(NullCodec::paced(SoundInfo::new(16_000, 1, 16))),
        );
        let mut managers = Vec::new();
        for _ in 0..2 {
            rec.open(Arc::new(|_: &AfeEvent| {})).unwrap();
            let mut buf = [0u8; 32];
            assert_eq!(rec.read_data(&mut buf).unwrap(), 32);
            managers.push(Arc::downgrade(&rec.manager().unwrap()));
            rec.close().unwrap();
        }
        for manager in &managers {
            assert!(wait_for(|| manager.strong_count() == 0), "AFE manager outlived close");
        }
    }
}
