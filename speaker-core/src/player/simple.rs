//! Thread-per-run player.
//!
//! `file://` sources are decoded up front with `hound`, mixed down to mono
//! and converted to `out_rate`, so a missing or malformed file fails `run`
//! synchronously. `raw://` sources stream from the read callback until it
//! reports end of stream (`Ok(0)`). A `Timeout` from the callback means "no
//! data yet" and only re-checks the stop flag.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use super::{AudioPlayer, MusicInfo, PlayerEvent, PlayerEventFn, PlayerState};
use crate::audio::{i16_to_bytes, RateConverter};
use crate::error::{Result, SpeakerError};
use crate::thread::ThreadSettings;

/// Fill the buffer with PCM; `Ok(0)` ends the stream.
pub type PlayerReadFn = Arc<dyn Fn(&mut [u8]) -> Result<usize> + Send + Sync>;
pub type PlayerWriteFn = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SimplePlayerConfig {
    /// Default: `"simple_player"`, 12 KiB, priority 5, core 1.
    pub thread: ThreadSettings,
    /// Directory standing in for the `file://<mount>/` prefix. Default: `"assets"`.
    pub file_root: PathBuf,
    /// Bytes per read/write step. Default: 2048.
    pub chunk_bytes: usize,
    /// Output rate for decoded files. Default: 16000.
    pub out_rate: u32,
}

impl Default for SimplePlayerConfig {
    fn default() -> Self {
        Self {
            thread: ThreadSettings::named("simple_player")
                .with_stack(12 * 1024)
                .with_priority(5)
                .with_core(1),
            file_root: PathBuf::from("assets"),
            chunk_bytes: 2048,
            out_rate: 16_000,
        }
    }
}

enum Source {
    Decoded(Vec<u8>),
    Raw(PlayerReadFn),
}

struct Shared {
    state: Mutex<PlayerState>,
    event: Mutex<Option<PlayerEventFn>>,
    generation: AtomicU64,
}

impl Shared {
    fn emit(&self, ev: PlayerEvent) {
        let cb = self.event.lock().clone();
        if let Some(cb) = cb {
            cb(&ev);
        }
    }

    /// Record and announce a state change from run `gen`. Changes from a
    /// superseded run are dropped.
    fn transition(&self, gen: u64, state: PlayerState) {
        if self.generation.load(Ordering::SeqCst) != gen {
            debug!(?state, "stale player run, state dropped");
            return;
        }
        *self.state.lock() = state;
        self.emit(PlayerEvent::State(state));
    }
}

struct Run {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SimplePlayer {
    config: SimplePlayerConfig,
    read: Option<PlayerReadFn>,
    write: PlayerWriteFn,
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl SimplePlayer {
    /// `read` feeds `raw://` URLs; a player without one only plays files.
    pub fn new(config: SimplePlayerConfig, read: Option<PlayerReadFn>, write: PlayerWriteFn) -> Self {
        Self {
            config,
            read,
            write,
            shared: Arc::new(Shared {
                state: Mutex::new(PlayerState::None),
                event: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            run: Mutex::new(None),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf> {
        let rest = url
            .strip_prefix("file://")
            .ok_or_else(|| SpeakerError::InvalidArgument(format!("not a file url: {url}")))?;
        let (_mount, rel) = rest
            .split_once('/')
            .ok_or_else(|| SpeakerError::InvalidArgument(format!("no file in {url}")))?;
        let rel = Path::new(rel);
        if rel.as_os_str().is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(SpeakerError::InvalidArgument(format!("bad file path in {url}")));
        }
        Ok(self.config.file_root.join(rel))
    }

    fn decode(&self, path: &Path) -> Result<(Vec<u8>, MusicInfo)> {
        if !path.exists() {
            return Err(SpeakerError::NotFound(path.display().to_string()));
        }
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| SpeakerError::Device(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(SpeakerError::NotSupported(format!(
                "{}: only 16-bit PCM WAV is playable",
                path.display()
            )));
        }
        let interleaved = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpeakerError::Device(format!("{}: {e}", path.display())))?;
        let ch = usize::from(spec.channels.max(1));
        let mono: Vec<i16> = interleaved
            .chunks(ch)
            .map(|f| (f.iter().map(|s| i32::from(*s)).sum::<i32>() / f.len() as i32) as i16)
            .collect();

        let mut converter = RateConverter::new(spec.sample_rate, self.config.out_rate, 320)?;
        let mut pcm = converter.process(&mono);
        pcm.extend(converter.flush());
        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        i16_to_bytes(&pcm, &mut bytes);

        let info = MusicInfo::pcm(spec.sample_rate, spec.channels as u8, 16);
        debug!(path = %path.display(), ?info, bytes = bytes.len(), "file decoded");
        Ok((bytes, info))
    }

    fn open_source(&self, url: &str, info: Option<MusicInfo>) -> Result<(Source, MusicInfo)> {
        if url.starts_with("file://") {
            let path = self.resolve(url)?;
            let (bytes, file_info) = self.decode(&path)?;
            Ok((Source::Decoded(bytes), info.unwrap_or(file_info)))
        } else if url.starts_with("raw://") {
            let read = self
                .read
                .clone()
                .ok_or_else(|| SpeakerError::InvalidState("player has no read callback".into()))?;
            Ok((Source::Raw(read), info.unwrap_or(MusicInfo::pcm(16_000, 1, 16))))
        } else {
            Err(SpeakerError::NotSupported(format!("url scheme of {url}")))
        }
    }
}

fn play_loop(
    source: Source,
    chunk: usize,
    write: &PlayerWriteFn,
    stop: &AtomicBool,
) -> PlayerState {
    match source {
        Source::Decoded(bytes) => {
            for piece in bytes.chunks(chunk.max(2)) {
                if stop.load(Ordering::SeqCst) {
                    return PlayerState::Stopped;
                }
                if let Err(e) = write(piece) {
                    error!("player write failed: {e}");
                    return PlayerState::Error;
                }
            }
            PlayerState::Finished
        }
        Source::Raw(read) => {
            let mut buf = vec![0u8; chunk.max(2)];
            loop {
                if stop.load(Ordering::SeqCst) {
                    return PlayerState::Stopped;
                }
                match read(&mut buf) {
                    Ok(0) => return PlayerState::Finished,
                    Ok(n) => {
                        if let Err(e) = write(&buf[..n]) {
                            error!("player write failed: {e}");
                            return PlayerState::Error;
                        }
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) if e.is_aborted() => return PlayerState::Stopped,
                    Err(e) => {
                        error!("player read failed: {e}");
                        return PlayerState::Error;
                    }
                }
            }
        }
    }
}

impl AudioPlayer for SimplePlayer {
    fn run(&self, url: &str, info: Option<MusicInfo>) -> Result<()> {
        self.stop()?;
        let (source, info) = self.open_source(url, info)?;
        let gen = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::clone(&self.shared);
        let write = Arc::clone(&self.write);
        let flag = Arc::clone(&stop);
        let chunk = self.config.chunk_bytes;
        let label = url.to_string();
        let handle = self.config.thread.spawn(move || {
            let span = info_span!("player", url = label.as_str());
            let _enter = span.enter();
            shared.emit(PlayerEvent::MusicInfo(info));
            shared.transition(gen, PlayerState::Running);
            let end = play_loop(source, chunk, &write, &flag);
            info!(state = end.as_str(), "player run ended");
            shared.transition(gen, end);
        })?;
        *self.run.lock() = Some(Run { stop, handle });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Some(run) = self.run.lock().take() else {
            return Ok(());
        };
        run.stop.store(true, Ordering::SeqCst);
        if run.handle.thread().id() == std::thread::current().id() {
            warn!("player stopped from its own thread, not joining");
            return Ok(());
        }
        if run.handle.join().is_err() {
            error!("player thread panicked");
            return Err(SpeakerError::Other(anyhow::anyhow!("player thread panicked")));
        }
        Ok(())
    }

    fn set_event(&self, cb: Option<PlayerEventFn>) {
        *self.shared.event.lock() = cb;
    }

    fn state(&self) -> PlayerState {
        *self.shared.state.lock()
    }
}

impl Drop for SimplePlayer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for SimplePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimplePlayer")
            .field("state", &self.state())
            .field("file_root", &self.config.file_root)
            .field("raw_input", &self.read.is_some())
            .finish_non_exhaustive()
    }
}
