//! `encoder`: PCM to G.711 A-law / µ-law, or plain passthrough.

use std::any::Any;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::bytes_to_i16;
use crate::data_bus::Block;
use crate::error::{Result, SpeakerError};
use crate::graph::element::port_failure;
use crate::graph::{Element, ElementIo, JobOutcome, SoundInfo};

pub const ENCODER_TAG: &str = "encoder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderFormat {
    #[default]
    Pcm,
    G711a,
    G711u,
}

impl EncoderFormat {
    /// Encoded bytes per input sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            EncoderFormat::Pcm => 2,
            EncoderFormat::G711a | EncoderFormat::G711u => 1,
        }
    }
}

const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

fn segment(val: i32, table: &[i32; 8]) -> usize {
    table.iter().position(|end| val <= *end).unwrap_or(8)
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut val = i32::from(sample) >> 3;
    let mask: i32 = if val >= 0 {
        0xD5
    } else {
        val = -val - 1;
        0x55
    };
    let seg = segment(val, &SEG_AEND);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }
    let mut aval = (seg as i32) << 4;
    aval |= if seg < 2 { (val >> 1) & 0xF } else { (val >> seg) & 0xF };
    (aval ^ mask) as u8
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut val = i32::from(sample) >> 2;
    let mask: i32 = if val < 0 {
        val = -val;
        0x7F
    } else {
        0xFF
    };
    val = val.min(ULAW_CLIP) + (ULAW_BIAS >> 2);
    let seg = segment(val, &SEG_UEND);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }
    let uval = ((seg as i32) << 4) | ((val >> (seg + 1)) & 0xF);
    (uval ^ mask) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Default: `Pcm`.
    pub format: EncoderFormat,
    /// Format of the PCM arriving at the encoder. Default: 16 kHz mono 16-bit.
    pub info: SoundInfo,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            format: EncoderFormat::Pcm,
            info: SoundInfo::new(16_000, 1, 16),
        }
    }
}

#[derive(Debug, Default)]
pub struct Encoder {
    config: EncoderConfig,
    samples: Vec<i16>,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            samples: Vec::new(),
        }
    }

    /// Switch format before the next open.
    ///
    /// # Errors
    /// `NotSupported` for anything but 16-bit input.
    pub fn reconfig(&mut self, format: EncoderFormat, info: SoundInfo) -> Result<()> {
        if info.bits != 16 {
            return Err(SpeakerError::NotSupported(format!(
                "encoder input must be 16-bit, got {}",
                info.bits
            )));
        }
        debug!(?format, rate = info.sample_rate, "encoder reconfigured");
        self.config = EncoderConfig { format, info };
        Ok(())
    }

    pub fn config(&self) -> EncoderConfig {
        self.config
    }

    fn encode(&mut self, pcm: &[u8]) -> Vec<u8> {
        match self.config.format {
            EncoderFormat::Pcm => pcm.to_vec(),
            EncoderFormat::G711a => {
                self.samples.clear();
                bytes_to_i16(pcm, &mut self.samples);
                self.samples.iter().map(|s| linear_to_alaw(*s)).collect()
            }
            EncoderFormat::G711u => {
                self.samples.clear();
                bytes_to_i16(pcm, &mut self.samples);
                self.samples.iter().map(|s| linear_to_ulaw(*s)).collect()
            }
        }
    }
}

impl Element for Encoder {
    fn tag(&self) -> &str {
        ENCODER_TAG
    }

    fn duplicate(&self) -> Result<Box<dyn Element>> {
        Ok(Box::new(Encoder::new(self.config)))
    }

    fn open(&mut self, io: &mut ElementIo) -> Result<()> {
        if let Some(src) = io.in_info {
            if src.sample_rate != self.config.info.sample_rate || src.channels != self.config.info.channels {
                return Err(SpeakerError::InvalidArgument(format!(
                    "encoder configured for {} Hz {} ch, upstream sends {} Hz {} ch",
                    self.config.info.sample_rate,
                    self.config.info.channels,
                    src.sample_rate,
                    src.channels
                )));
            }
        }
        io.notify_info(self.config.info);
        info!(format = ?self.config.format, rate = self.config.info.sample_rate, "encoder opened");
        Ok(())
    }

    fn process(&mut self, io: &mut ElementIo) -> JobOutcome {
        let mut blk = Block::default();
        if let Err(e) = io.acquire_in(&mut blk, 0) {
            return if e.is_timeout() {
                JobOutcome::Continue
            } else {
                port_failure(ENCODER_TAG, "in", e)
            };
        }
        let last = blk.is_last;
        let encoded = self.encode(blk.data());
        if let Err(e) = io.release_in(&mut blk) {
            debug!(tag = ENCODER_TAG, "input release failed: {e}");
        }
        if let Err(e) = io.write_out(&encoded, last) {
            return port_failure(ENCODER_TAG, "out", e);
        }
        if last {
            JobOutcome::Done
        } else {
            JobOutcome::Ok
        }
    }

    fn close(&mut self, _io: &mut ElementIo) -> Result<()> {
        self.samples = Vec::new();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Port;

    #[test]
    fn alaw_reference_points() {
        assert_eq!(linear_to_alaw(0), 0xD5);
        assert_eq!(linear_to_alaw(-1), 0x55);
        assert_eq!(linear_to_alaw(i16::MAX), 0xAA);
        assert_eq!(linear_to_alaw(i16::MIN), 0x2A);
    }

    #[test]
    fn ulaw_reference_points() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        assert_eq!(linear_to_ulaw(-1), 0x7E);
    }

    #[test]
    fn encodes_blocks_one_byte_per_sample() {
        let (up, el_in) = Port::link(8).unwrap();
        let (el_out, down) = Port::link(8).unwrap();
        let mut io = ElementIo {
            input: Some(el_in),
            output: Some(el_out),
            in_info: Some(SoundInfo::new(8000, 1, 16)),
            out_info: None,
        };
        let mut enc = Encoder::default();
        enc.reconfig(EncoderFormat::G711a, SoundInfo::new(8000, 1, 16)).unwrap();
        enc.open(&mut io).unwrap();

        let mut blk = Block::default();
        up.acquire(&mut blk, 4).unwrap();
        blk.buf[..4].copy_from_slice(&[0, 0, 0xFF, 0x7F]);
        blk.valid_size = 4;
        up.release(&mut blk).unwrap();
        assert_eq!(enc.process(&mut io), JobOutcome::Ok);

        let mut out = Block::default();
        down.acquire(&mut out, 0).unwrap();
        assert_eq!(out.data(), &[0xD5, 0xAA]);
    }

    #[test]
    fn mismatched_upstream_is_rejected() {
        let mut io = ElementIo {
            in_info: Some(SoundInfo::new(16_000, 1, 16)),
            ..ElementIo::default()
        };
        let mut enc = Encoder::new(EncoderConfig {
            format: EncoderFormat::G711u,
            info: SoundInfo::new(8000, 1, 16),
        });
        assert!(matches!(enc.open(&mut io), Err(SpeakerError::InvalidArgument(_))));
        assert!(enc.reconfig(EncoderFormat::Pcm, SoundInfo::new(8000, 1, 8)).is_err());
    }
}
