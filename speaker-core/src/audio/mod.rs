//! PCM helpers shared by the codec devices and pipeline elements.
//!
//! Everything on the wire is signed 16-bit little-endian.

pub mod resample;

pub use resample::RateConverter;

/// Append the samples encoded in `bytes` to `out`. A trailing odd byte is ignored.
pub fn bytes_to_i16(bytes: &[u8], out: &mut Vec<i16>) {
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]])),
    );
}

pub fn i16_to_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

/// Root-mean-square level of `samples` relative to full scale, in dBFS.
/// Silence reports -96.
pub fn rms_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return -96.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|s| {
            let v = f64::from(*s) / 32768.0;
            v * v
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    if rms <= 1.0e-5 {
        -96.0
    } else {
        (20.0 * rms.log10()) as f32
    }
}
