//! Codec devices: the synchronous PCM endpoints the pipeline reads the
//! microphone from and the players write to.
//!
//! Implementations:
//! - [`NullCodec`]: silence in, output discarded (counted).
//! - [`WavSource`]: loops a WAV file or sample buffer as the microphone.
//! - `CpalCodec`: host capture/playback, behind the `audio-cpal` feature.

#[cfg(feature = "audio-cpal")]
mod host;

#[cfg(feature = "audio-cpal")]
pub use host::CpalCodec;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::audio::i16_to_bytes;
use crate::error::{Result, SpeakerError};
use crate::graph::SoundInfo;

/// A blocking PCM device.
pub trait CodecDevice: Send + Sync {
    /// Fill `buf` completely with captured PCM.
    fn read(&self, buf: &mut [u8]) -> Result<()>;

    /// Play `buf`.
    fn write(&self, buf: &[u8]) -> Result<()>;

    fn set_out_mute(&self, mute: bool) -> Result<()>;

    /// Output volume in percent, 0..=100.
    fn set_out_volume(&self, volume: u8) -> Result<()>;
}

/// Output-side bookkeeping shared by the software devices.
#[derive(Debug, Default)]
pub struct OutputStats {
    written: AtomicUsize,
    mute_toggles: AtomicUsize,
    muted: AtomicBool,
    volume: AtomicU8,
}

impl OutputStats {
    fn record_write(&self, n: usize) {
        if !self.muted.load(Ordering::Relaxed) {
            self.written.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn record_mute(&self, mute: bool) {
        self.muted.store(mute, Ordering::Relaxed);
        self.mute_toggles.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes played while unmuted.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub fn mute_toggles(&self) -> usize {
        self.mute_toggles.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }
}

/// Silent microphone and a speaker that only counts.
#[derive(Debug, Default)]
pub struct NullCodec {
    stats: OutputStats,
    pace: Option<SoundInfo>,
}

impl NullCodec {
    /// Sleep on each read for as long as `info` takes to capture it.
    pub fn paced(info: SoundInfo) -> Self {
        Self {
            stats: OutputStats::default(),
            pace: Some(info),
        }
    }

    pub fn stats(&self) -> &OutputStats {
        &self.stats
    }
}

impl CodecDevice for NullCodec {
    fn read(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        if let Some(info) = self.pace {
            std::thread::sleep(capture_time(info, buf.len()));
        }
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        self.stats.record_write(buf.len());
        Ok(())
    }

    fn set_out_mute(&self, mute: bool) -> Result<()> {
        self.stats.record_mute(mute);
        Ok(())
    }

    fn set_out_volume(&self, volume: u8) -> Result<()> {
        self.stats.volume.store(volume.min(100), Ordering::Relaxed);
        Ok(())
    }
}

fn capture_time(info: SoundInfo, bytes: usize) -> Duration {
    let bytes_per_sec = info.sample_rate as u64 * info.frame_bytes() as u64;
    if bytes_per_sec == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(bytes as u64 * 1_000_000 / bytes_per_sec)
}

/// File-backed microphone. Loops its samples forever.
#[derive(Debug)]
pub struct WavSource {
    samples: Vec<i16>,
    info: SoundInfo,
    pos: Mutex<usize>,
    pace: bool,
    stats: OutputStats,
}

impl WavSource {
    /// Load a 16-bit WAV file.
    ///
    /// # Errors
    /// `NotSupported` for anything but 16-bit integer PCM, `Device` when the
    /// file cannot be decoded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| SpeakerError::Device(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(SpeakerError::NotSupported(format!(
                "{}: need 16-bit PCM, got {} bit {:?}",
                path.display(),
                spec.bits_per_sample,
                spec.sample_format
            )));
        }
        let samples = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpeakerError::Device(format!("{}: {e}", path.display())))?;
        let channels = u8::try_from(spec.channels)
            .map_err(|_| SpeakerError::NotSupported(format!("{} channels", spec.channels)))?;
        info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels,
            samples = samples.len(),
            "wav source loaded"
        );
        Self::from_samples(samples, SoundInfo::new(spec.sample_rate, channels, 16))
    }

    /// # Errors
    /// `InvalidArgument` for an empty buffer.
    pub fn from_samples(samples: Vec<i16>, info: SoundInfo) -> Result<Self> {
        if samples.is_empty() {
            return Err(SpeakerError::InvalidArgument("wav source has no samples".into()));
        }
        Ok(Self {
            samples,
            info,
            pos: Mutex::new(0),
            pace: false,
            stats: OutputStats::default(),
        })
    }

    /// Deliver reads no faster than real time.
    pub fn with_pacing(mut self) -> Self {
        self.pace = true;
        self
    }

    pub fn info(&self) -> SoundInfo {
        self.info
    }

    pub fn stats(&self) -> &OutputStats {
        &self.stats
    }
}

impl CodecDevice for WavSource {
    fn read(&self, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len() / 2;
        let mut chunk = Vec::with_capacity(wanted);
        {
            let mut pos = self.pos.lock();
            for _ in 0..wanted {
                chunk.push(self.samples[*pos]);
                *pos = (*pos + 1) % self.samples.len();
            }
        }
        let mut bytes = Vec::with_capacity(buf.len());
        i16_to_bytes(&chunk, &mut bytes);
        buf[..bytes.len()].copy_from_slice(&bytes);
        if buf.len() > bytes.len() {
            buf[bytes.len()..].fill(0);
        }
        if self.pace {
            std::thread::sleep(capture_time(self.info, buf.len()));
        }
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        self.stats.record_write(buf.len());
        Ok(())
    }

    fn set_out_mute(&self, mute: bool) -> Result<()> {
        debug!(mute, "wav source mute");
        self.stats.record_mute(mute);
        Ok(())
    }

    fn set_out_volume(&self, volume: u8) -> Result<()> {
        self.stats.volume.store(volume.min(100), Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_codec_counts_unmuted_output() {
        let codec = NullCodec::default();
        codec.write(&[0; 10]).unwrap();
        codec.set_out_mute(true).unwrap();
        codec.write(&[0; 10]).unwrap();
        codec.set_out_mute(false).unwrap();
        codec.set_out_volume(170).unwrap();
        assert_eq!(codec.stats().written(), 10);
        assert_eq!(codec.stats().mute_toggles(), 2);
        assert_eq!(codec.stats().volume(), 100);

        let mut buf = [7u8; 4];
        codec.read(&mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn wav_source_loops() {
        let src = WavSource::from_samples(vec![1, 2, 3], SoundInfo::new(16000, 1, 16)).unwrap();
        let mut buf = [0u8; 8];
        src.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 0, 2, 0, 3, 0, 1, 0]);
        src.read(&mut buf[..2]).unwrap();
        assert_eq!(buf[..2], [2, 0]);
    }

    #[test]
    fn wav_source_reads_a_file() {
        let path = std::env::temp_dir().join(format!("speaker-wav-{}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for s in [100i16, -100, 200] {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();

        let src = WavSource::open(&path).unwrap();
        assert_eq!(src.info(), SoundInfo::new(16000, 1, 16));
        let mut buf = [0u8; 6];
        src.read(&mut buf).unwrap();
        assert_eq!(i16::from_le_bytes([buf[2], buf[3]]), -100);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn pacing_matches_capture_time() {
        let t = capture_time(SoundInfo::new(16000, 1, 16), 3200);
        assert_eq!(t, Duration::from_millis(100));
    }
}
