//! `rate_cvt`: mono s16le sample-rate conversion.

use std::any::Any;

use tracing::{debug, info};

use crate::audio::{bytes_to_i16, i16_to_bytes, RateConverter};
use crate::data_bus::Block;
use crate::error::{Result, SpeakerError};
use crate::graph::element::port_failure;
use crate::graph::{Element, ElementIo, JobOutcome, SoundInfo};

pub const RATE_CVT_TAG: &str = "rate_cvt";

#[derive(Debug, Clone)]
pub struct RateConvertConfig {
    /// Default: 16000.
    pub dest_rate: u32,
    /// Input samples per resampler pass. Default: 320.
    pub chunk_samples: usize,
}

impl Default for RateConvertConfig {
    fn default() -> Self {
        Self {
            dest_rate: 16_000,
            chunk_samples: 320,
        }
    }
}

#[derive(Debug)]
pub struct RateConvert {
    config: RateConvertConfig,
    converter: Option<RateConverter>,
    samples: Vec<i16>,
}

impl RateConvert {
    pub fn new(config: RateConvertConfig) -> Self {
        Self {
            config,
            converter: None,
            samples: Vec::new(),
        }
    }

    /// Takes effect on the next open.
    pub fn set_dest_rate(&mut self, rate: u32) {
        self.config.dest_rate = rate;
    }

    pub fn dest_rate(&self) -> u32 {
        self.config.dest_rate
    }
}

impl Default for RateConvert {
    fn default() -> Self {
        Self::new(RateConvertConfig::default())
    }
}

impl Element for RateConvert {
    fn tag(&self) -> &str {
        RATE_CVT_TAG
    }

    fn duplicate(&self) -> Result<Box<dyn Element>> {
        Ok(Box::new(RateConvert::new(self.config.clone())))
    }

    fn open(&mut self, io: &mut ElementIo) -> Result<()> {
        let src = io
            .in_info
            .ok_or_else(|| SpeakerError::InvalidState("rate_cvt opened without input format".into()))?;
        if src.channels != 1 || src.bits != 16 {
            return Err(SpeakerError::NotSupported(format!(
                "rate_cvt needs mono 16-bit, got {} ch {} bit",
                src.channels, src.bits
            )));
        }
        self.converter = Some(RateConverter::new(
            src.sample_rate,
            self.config.dest_rate,
            self.config.chunk_samples,
        )?);
        io.notify_info(SoundInfo::new(self.config.dest_rate, 1, 16));
        info!(from = src.sample_rate, to = self.config.dest_rate, "rate_cvt opened");
        Ok(())
    }

    fn process(&mut self, io: &mut ElementIo) -> JobOutcome {
        let Some(converter) = self.converter.as_mut() else {
            return JobOutcome::Fail;
        };
        let mut blk = Block::default();
        if let Err(e) = io.acquire_in(&mut blk, 0) {
            return if e.is_timeout() {
                JobOutcome::Continue
            } else {
                port_failure(RATE_CVT_TAG, "in", e)
            };
        }
        let last = blk.is_last;
        self.samples.clear();
        bytes_to_i16(blk.data(), &mut self.samples);
        if let Err(e) = io.release_in(&mut blk) {
            debug!(tag = RATE_CVT_TAG, "input release failed: {e}");
        }

        let mut converted = converter.process(&self.samples);
        if last {
            converted.extend(converter.flush());
        }
        if converted.is_empty() && !last {
            return JobOutcome::Continue;
        }
        let mut bytes = Vec::with_capacity(converted.len() * 2);
        i16_to_bytes(&converted, &mut bytes);
        if let Err(e) = io.write_out(&bytes, last) {
            return port_failure(RATE_CVT_TAG, "out", e);
        }
        if last {
            JobOutcome::Done
        } else {
            JobOutcome::Ok
        }
    }

    fn close(&mut self, _io: &mut ElementIo) -> Result<()> {
        self.converter = None;
        debug!("rate_cvt closed");
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(c) = self.converter.as_mut() {
            c.reset();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
