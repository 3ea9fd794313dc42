//! Host sound card as a codec device, via cpal.
//!
//! `cpal::Stream` is `!Send`, so both streams are built and kept alive on a
//! dedicated thread that parks until the codec is dropped. The audio
//! callbacks only touch lock-free `ringbuf` halves; rate conversion to and
//! from the device rate happens on the caller's thread.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{error, info, warn};

use super::CodecDevice;
use crate::audio::{bytes_to_i16, i16_to_bytes, RateConverter};
use crate::error::{Result, SpeakerError};

/// Two seconds at 48 kHz.
const RING_CAPACITY: usize = 96_000;
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const RESAMPLE_CHUNK: usize = 320;

struct Capture {
    consumer: HeapCons<i16>,
    converter: RateConverter,
    pending: Vec<i16>,
    scratch: Vec<i16>,
}

struct Playback {
    producer: HeapProd<i16>,
    converter: RateConverter,
}

/// Default input and output devices, mono 16-bit at `sample_rate` on the
/// codec side.
pub struct CpalCodec {
    capture: Mutex<Capture>,
    playback: Mutex<Playback>,
    muted: Arc<AtomicBool>,
    volume: Arc<AtomicU8>,
    shutdown: Option<Sender<()>>,
    streams: Option<JoinHandle<()>>,
}

struct Opened {
    in_rate: u32,
    out_rate: u32,
}

impl CpalCodec {
    /// Open the default devices.
    ///
    /// # Errors
    /// `Device` when either device is missing or refuses a stream.
    pub fn open_default(sample_rate: u32) -> Result<Self> {
        let (in_prod, in_cons) = HeapRb::<i16>::new(RING_CAPACITY).split();
        let (out_prod, out_cons) = HeapRb::<i16>::new(RING_CAPACITY).split();
        let muted = Arc::new(AtomicBool::new(false));
        let volume = Arc::new(AtomicU8::new(100));

        let (ready_tx, ready_rx) = bounded::<Result<Opened>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cb_muted = Arc::clone(&muted);
        let cb_volume = Arc::clone(&volume);
        let streams = std::thread::Builder::new()
            .name("codec_streams".into())
            .spawn(move || match build_streams(in_prod, out_cons, cb_muted, cb_volume) {
                Ok((opened, input, output)) => {
                    let _ = ready_tx.send(Ok(opened));
                    let _ = stop_rx.recv();
                    drop(input);
                    drop(output);
                    info!("host streams closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| SpeakerError::ResourceExhausted(format!("codec thread: {e}")))?;

        let opened = ready_rx
            .recv()
            .map_err(|_| SpeakerError::Device("codec stream thread exited".into()))??;

        Ok(Self {
            capture: Mutex::new(Capture {
                consumer: in_cons,
                converter: RateConverter::new(opened.in_rate, sample_rate, RESAMPLE_CHUNK)?,
                pending: Vec::new(),
                scratch: vec![0; RESAMPLE_CHUNK],
            }),
            playback: Mutex::new(Playback {
                producer: out_prod,
                converter: RateConverter::new(sample_rate, opened.out_rate, RESAMPLE_CHUNK)?,
            }),
            muted,
            volume,
            shutdown: Some(stop_tx),
            streams: Some(streams),
        })
    }
}

fn build_streams(
    in_prod: HeapProd<i16>,
    out_cons: HeapCons<i16>,
    muted: Arc<AtomicBool>,
    volume: Arc<AtomicU8>,
) -> Result<(Opened, Stream, Stream)> {
    let host = cpal::default_host();
    let input = host
        .default_input_device()
        .ok_or_else(|| SpeakerError::Device("no default input device".into()))?;
    let output = host
        .default_output_device()
        .ok_or_else(|| SpeakerError::Device("no default output device".into()))?;

    let in_cfg = input
        .default_input_config()
        .map_err(|e| SpeakerError::Device(e.to_string()))?;
    let out_cfg = output
        .default_output_config()
        .map_err(|e| SpeakerError::Device(e.to_string()))?;
    info!(
        input = input.name().unwrap_or_default().as_str(),
        output = output.name().unwrap_or_default().as_str(),
        in_rate = in_cfg.sample_rate().0,
        out_rate = out_cfg.sample_rate().0,
        "opening host devices"
    );

    let in_stream = match in_cfg.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&input, &in_cfg.config(), in_prod)?,
        SampleFormat::I16 => build_input::<i16>(&input, &in_cfg.config(), in_prod)?,
        fmt => return Err(SpeakerError::NotSupported(format!("capture format {fmt:?}"))),
    };
    let out_stream = match out_cfg.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&output, &out_cfg.config(), out_cons, muted, volume)?,
        SampleFormat::I16 => build_output::<i16>(&output, &out_cfg.config(), out_cons, muted, volume)?,
        fmt => return Err(SpeakerError::NotSupported(format!("playback format {fmt:?}"))),
    };
    in_stream
        .play()
        .map_err(|e| SpeakerError::Device(e.to_string()))?;
    out_stream
        .play()
        .map_err(|e| SpeakerError::Device(e.to_string()))?;

    Ok((
        Opened {
            in_rate: in_cfg.sample_rate().0,
            out_rate: out_cfg.sample_rate().0,
        },
        in_stream,
        out_stream,
    ))
}

fn build_input<T>(device: &cpal::Device, config: &StreamConfig, mut producer: HeapProd<i16>) -> Result<Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let ch = usize::from(config.channels.max(1));
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                let mut dropped = 0usize;
                for frame in data.chunks(ch) {
                    let sum: i32 = frame.iter().map(|s| i32::from(i16::from_sample_(*s))).sum();
                    if producer.try_push((sum / ch as i32) as i16).is_err() {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    warn!(dropped, "capture ring full");
                }
            },
            |err| error!("capture stream error: {err}"),
            None,
        )
        .map_err(|e| SpeakerError::Device(e.to_string()))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
    muted: Arc<AtomicBool>,
    volume: Arc<AtomicU8>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let ch = usize::from(config.channels.max(1));
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let mute = muted.load(Ordering::Relaxed);
                let vol = i32::from(volume.load(Ordering::Relaxed));
                for frame in data.chunks_mut(ch) {
                    let s = consumer.try_pop().unwrap_or(0);
                    let s = if mute { 0 } else { (i32::from(s) * vol / 100) as i16 };
                    for out in frame.iter_mut() {
                        *out = T::from_sample_(s);
                    }
                }
            },
            |err| error!("playback stream error: {err}"),
            None,
        )
        .map_err(|e| SpeakerError::Device(e.to_string()))
}

impl CodecDevice for CpalCodec {
    fn read(&self, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len() / 2;
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut cap = self.capture.lock();
        let Capture {
            consumer,
            converter,
            pending,
            scratch,
        } = &mut *cap;
        while pending.len() < wanted {
            let n = consumer.pop_slice(scratch);
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(SpeakerError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            pending.extend(converter.process(&scratch[..n]));
        }
        let mut bytes = Vec::with_capacity(buf.len());
        i16_to_bytes(&pending[..wanted], &mut bytes);
        pending.drain(..wanted);
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        let mut samples = Vec::with_capacity(buf.len() / 2);
        bytes_to_i16(buf, &mut samples);
        let mut pb = self.playback.lock();
        let converted = pb.converter.process(&samples);
        let mut offset = 0;
        while offset < converted.len() {
            offset += pb.producer.push_slice(&converted[offset..]);
            if offset < converted.len() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(())
    }

    fn set_out_mute(&self, mute: bool) -> Result<()> {
        self.muted.store(mute, Ordering::Relaxed);
        Ok(())
    }

    fn set_out_volume(&self, volume: u8) -> Result<()> {
        self.volume.store(volume.min(100), Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for CpalCodec {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(h) = self.streams.take() {
            if h.join().is_err() {
                error!("codec stream thread panicked");
            }
        }
    }
}
