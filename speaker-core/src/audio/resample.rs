//! Sample-rate conversion for mono 16-bit PCM using a rubato `FastFixedIn`
//! resampler.
//!
//! The AFE produces 16 kHz; the uplink wants 8 kHz, and host devices often
//! run at 44.1 or 48 kHz. When both rates match the converter is a plain
//! passthrough and no rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{Result, SpeakerError};

/// Converts mono i16 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input waiting for a full chunk.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// # Errors
    /// `InvalidArgument` for a zero rate or chunk, `Device` if rubato refuses
    /// the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || chunk_size == 0 {
            return Err(SpeakerError::InvalidArgument(format!(
                "bad resampler setup {from_rate} -> {to_rate}, chunk {chunk_size}"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let ratio = f64::from(to_rate) / f64::from(from_rate);
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| SpeakerError::Device(format!("resampler init: {e}")))?;
        let max_out = resampler.output_frames_max();
        info!(from_rate, to_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            from_rate,
            to_rate,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from_rate, self.to_rate)
    }

    /// Feed samples and collect whatever output full chunks produced.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.input_buf
            .extend(samples.iter().map(|s| f32::from(*s) / 32768.0));

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.output_buf, None) {
                Ok((_, produced)) => push_i16(&mut result, &self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
        result
    }

    /// Push out the partial chunk held back by `process`.
    pub fn flush(&mut self) -> Vec<i16> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }
        let mut result = Vec::new();
        let input = std::mem::take(&mut self.input_buf);
        let channels: [&[f32]; 1] = [input.as_slice()];
        match resampler.process_partial_into_buffer(Some(&channels[..]), &mut self.output_buf, None) {
            Ok((_, produced)) => push_i16(&mut result, &self.output_buf[0][..produced]),
            Err(e) => error!("resampler flush error: {e}"),
        }
        result
    }

    /// Forget buffered input and filter history.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
    }
}

fn push_i16(out: &mut Vec<i16>, samples: &[f32]) {
    out.extend(
        samples
            .iter()
            .map(|s| (s * 32767.0).round().clamp(-32768.0, 32767.0) as i16),
    );
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("from_rate", &self.from_rate)
            .field("to_rate", &self.to_rate)
            .field("chunk_size", &self.chunk_size)
            .field("pending", &self.input_buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 320).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<i16> = (0..480).map(|i| i as i16 * 3).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn halves_16k_to_8k() {
        let mut rc = RateConverter::new(16_000, 8_000, 320).unwrap();
        let out = rc.process(&vec![0i16; 320]);
        assert!(
            (out.len() as isize - 160).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_chunk_waits_for_more() {
        let mut rc = RateConverter::new(16_000, 8_000, 320).unwrap();
        assert!(rc.process(&[0i16; 200]).is_empty());
        assert!(!rc.process(&[0i16; 200]).is_empty());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            RateConverter::new(0, 8_000, 320),
            Err(SpeakerError::InvalidArgument(_))
        ));
    }
}
