//! Headless smart speaker host.
//!
//! Wires codec devices, the audio processor and the AI-Buddy together and
//! runs until Ctrl-C. The recorder's encoded stream goes to an optional dump
//! file; wake-word events drive the buddy the way a chat service would.

mod agent;
mod settings;

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Weak};

use anyhow::Context;
use speaker_core::buddy::{AiBuddy, BuddySignal, SystemClock};
use speaker_core::codec::{CodecDevice, NullCodec, WavSource};
use speaker_core::elements::AfeEvent;
use speaker_core::graph::SoundInfo;
use speaker_core::processor::{simple_players, AudioProcessor};
use speaker_core::thread::ThreadSettings;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use agent::ConsoleAgent;
use settings::{load_settings, settings_path, AppSettings};

type Devices = (Arc<dyn CodecDevice>, Arc<dyn CodecDevice>);

fn open_devices(settings: &AppSettings) -> anyhow::Result<Devices> {
    #[cfg(feature = "audio-cpal")]
    if settings.host_audio {
        let dev: Arc<dyn CodecDevice> = Arc::new(speaker_core::codec::CpalCodec::open_default(settings.sample_rate)?);
        info!(rate = settings.sample_rate, "using host audio devices");
        return Ok((dev.clone(), dev));
    }
    #[cfg(not(feature = "audio-cpal"))]
    if settings.host_audio {
        warn!("built without audio-cpal, falling back to software devices");
    }

    let info = SoundInfo::new(settings.sample_rate, 1, 16);
    let play: Arc<dyn CodecDevice> = Arc::new(NullCodec::default());
    let rec: Arc<dyn CodecDevice> = match &settings.mic_wav {
        Some(path) => {
            info!(path = %path.display(), "looping WAV file as microphone");
            Arc::new(
                WavSource::open(path)
                    .with_context(|| format!("opening mic WAV {}", path.display()))?
                    .with_pacing(),
            )
        }
        None => Arc::new(NullCodec::paced(info)),
    };
    Ok((play, rec))
}

/// Map AFE events onto the buddy's wake and sleep requests.
fn afe_to_buddy(buddy: Weak<AiBuddy>) -> speaker_core::processor::RecorderEventFn {
    Arc::new(move |ev: &AfeEvent| {
        let Some(buddy) = buddy.upgrade() else { return };
        let signals = match ev {
            AfeEvent::WakeupStart(_) => vec![BuddySignal::WakeUpRequest { wake: true }, BuddySignal::Response],
            AfeEvent::WakeupEnd => vec![BuddySignal::WakeUpRequest { wake: false }],
            AfeEvent::VcmdDetected(cmd) => {
                info!(phrase = cmd.phrase_id, text = cmd.text.as_str(), "voice command");
                Vec::new()
            }
            _ => Vec::new(),
        };
        for signal in signals {
            if let Err(e) = buddy.signal(signal) {
                debug!("buddy not accepting signals: {e}");
            }
        }
    })
}

fn spawn_uplink(processor: Arc<AudioProcessor>, settings: &AppSettings) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let mut dump = match &settings.uplink_dump {
        Some(path) => Some(BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening uplink dump {}", path.display()))?,
        )),
        None => None,
    };
    let handle = ThreadSettings::named("uplink").spawn(move || {
        let mut buf = vec![0u8; 320];
        let mut total = 0usize;
        loop {
            match processor.recorder_read_data(&mut buf) {
                Ok(n) => {
                    total += n;
                    if let Some(out) = dump.as_mut() {
                        if let Err(e) = out.write_all(&buf[..n]) {
                            error!("uplink dump write failed: {e}");
                            dump = None;
                        }
                    }
                }
                Err(e) => {
                    debug!("uplink stopped: {e}");
                    break;
                }
            }
        }
        if let Some(mut out) = dump {
            let _ = out.flush();
        }
        info!(bytes = total, "uplink finished");
    })?;
    Ok(handle)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("speaker=info")),
        )
        .init();

    let path = settings_path();
    let settings = load_settings(&path);
    info!(path = %path.display(), "speaker starting");

    let (play_dev, rec_dev) = open_devices(&settings)?;
    let processor = Arc::new(AudioProcessor::new(
        settings.processor_config(),
        play_dev,
        rec_dev,
        simple_players(settings.player_config()),
    )?);
    processor.prompt_open()?;
    processor.playback_open()?;

    let (agent, agent_signals) = ConsoleAgent::new();
    let buddy = Arc::new(AiBuddy::new(
        settings.buddy_config(),
        settings.audio_catalog(),
        settings.expression_maps(),
        Arc::new(agent),
        processor.clone(),
        processor.clone(),
        Arc::new(SystemClock::default()),
    ));

    let mut expressions = buddy.subscribe_expression();
    let expression_log = tokio::spawn(async move {
        loop {
            match expressions.recv().await {
                Ok(update) => info!(?update, "expression"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "expression log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let forward_to = Arc::downgrade(&buddy);
    ThreadSettings::named("agent_signals").spawn(move || {
        for signal in agent_signals.iter() {
            let Some(buddy) = forward_to.upgrade() else { break };
            if let Err(e) = buddy.signal(signal) {
                debug!("agent signal dropped: {e}");
            }
        }
    })?;

    processor.recorder_open(afe_to_buddy(Arc::downgrade(&buddy)))?;
    let uplink = spawn_uplink(processor.clone(), &settings)?;
    buddy.begin()?;
    info!("speaker running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");

    buddy.shutdown();
    if let Err(e) = processor.recorder_close() {
        warn!("recorder close failed: {e}");
    }
    if uplink.join().is_err() {
        error!("uplink thread panicked");
    }
    processor.shutdown();
    drop(buddy);
    expression_log.abort();
    info!("speaker stopped");
    Ok(())
}
