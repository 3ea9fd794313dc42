//! Host settings (JSON file, path overridable with `SPEAKER_SETTINGS`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use speaker_core::buddy::{AudioCatalog, BuddyConfig, ExpressionMaps};
use speaker_core::player::SimplePlayerConfig;
use speaker_core::processor::ProcessorConfig;
use tracing::warn;

pub const SETTINGS_ENV: &str = "SPEAKER_SETTINGS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Use the host's default input/output devices (needs `audio-cpal`).
    pub host_audio: bool,
    /// WAV file looped as the microphone when host audio is off.
    pub mic_wav: Option<PathBuf>,
    pub sample_rate: u32,
    pub playback_volume: u8,
    /// Directory holding the `file://` prompt assets.
    pub asset_dir: PathBuf,
    /// Optional JSON overrides of the stock cue and expression tables.
    pub audio_catalog: Option<PathBuf>,
    pub expression_maps: Option<PathBuf>,
    pub wake_threshold_dbfs: f32,
    pub wakeup_end_secs: u64,
    pub vcmd_detect_en: bool,
    pub command_on_wakeup: bool,
    pub loop_count: i32,
    pub repeat_interval_secs: u64,
    /// The host has no Wi-Fi events of its own; start as connected.
    pub network_up: bool,
    /// Append the encoded uplink stream to this file.
    pub uplink_dump: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host_audio: false,
            mic_wav: None,
            sample_rate: 16_000,
            playback_volume: 70,
            asset_dir: PathBuf::from("assets"),
            audio_catalog: None,
            expression_maps: None,
            wake_threshold_dbfs: -40.0,
            wakeup_end_secs: 30,
            vcmd_detect_en: false,
            command_on_wakeup: false,
            loop_count: 3,
            repeat_interval_secs: 20,
            network_up: true,
            uplink_dump: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.sample_rate = match self.sample_rate {
            8_000 | 16_000 | 32_000 | 44_100 | 48_000 => self.sample_rate,
            _ => 16_000,
        };
        self.playback_volume = self.playback_volume.min(100);
        self.wake_threshold_dbfs = self.wake_threshold_dbfs.clamp(-90.0, 0.0);
        self.wakeup_end_secs = self.wakeup_end_secs.clamp(1, 600);
        self.loop_count = self.loop_count.clamp(-1, 20);
        self.repeat_interval_secs = self.repeat_interval_secs.clamp(1, 600);
        self.mic_wav = self.mic_wav.take().filter(|p| !p.as_os_str().is_empty());
        self.uplink_dump = self.uplink_dump.take().filter(|p| !p.as_os_str().is_empty());
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        let mut config = ProcessorConfig {
            playback_volume: self.playback_volume,
            ..ProcessorConfig::default()
        };
        config.recorder.afe.sample_rate = self.sample_rate;
        config.recorder.afe.threshold_dbfs = self.wake_threshold_dbfs;
        config.recorder.wakeup_end = Duration::from_secs(self.wakeup_end_secs);
        config.recorder.vcmd_detect_en = self.vcmd_detect_en;
        config.recorder.command_on_wakeup = self.command_on_wakeup;
        config
    }

    pub fn player_config(&self) -> SimplePlayerConfig {
        SimplePlayerConfig {
            file_root: self.asset_dir.clone(),
            out_rate: self.sample_rate,
            ..SimplePlayerConfig::default()
        }
    }

    pub fn buddy_config(&self) -> BuddyConfig {
        BuddyConfig {
            loop_count: self.loop_count,
            repeat_interval: Duration::from_secs(self.repeat_interval_secs),
            network_up: self.network_up,
            ..BuddyConfig::default()
        }
    }

    /// The stock catalog unless an override file is configured and parses.
    pub fn audio_catalog(&self) -> AudioCatalog {
        self.audio_catalog
            .as_deref()
            .and_then(|p| load_json(p, "audio catalog"))
            .unwrap_or_default()
    }

    pub fn expression_maps(&self) -> ExpressionMaps {
        self.expression_maps
            .as_deref()
            .and_then(|p| load_json(p, "expression maps"))
            .unwrap_or_default()
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Option<T> {
    let raw = fs::read_to_string(path)
        .inspect_err(|e| warn!(path = %path.display(), "cannot read {what}: {e}"))
        .ok()?;
    serde_json::from_str(&raw)
        .inspect_err(|e| warn!(path = %path.display(), "bad {what}, using defaults: {e}"))
        .ok()
}

pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SETTINGS_ENV) {
        return PathBuf::from(path);
    }
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("speaker")
        .join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let settings = load_settings(Path::new("/nonexistent/speaker/settings.json"));
        assert_eq!(settings.sample_rate, 16_000);
        assert!(settings.network_up);
    }

    #[test]
    fn partial_json_keeps_other_defaults_and_clamps() {
        let raw = r#"{ "playbackVolume": 250, "loopCount": -7, "sampleRate": 11025, "micWav": "" }"#;
        let mut settings: AppSettings = serde_json::from_str(raw).unwrap();
        settings.normalize();
        assert_eq!(settings.playback_volume, 100);
        assert_eq!(settings.loop_count, -1);
        assert_eq!(settings.sample_rate, 16_000);
        assert!(settings.mic_wav.is_none());
        assert_eq!(settings.repeat_interval_secs, 20);
    }

    #[test]
    fn derived_configs_follow_the_settings() {
        let settings = AppSettings {
            wakeup_end_secs: 5,
            loop_count: 1,
            ..AppSettings::default()
        };
        assert_eq!(settings.processor_config().recorder.wakeup_end, Duration::from_secs(5));
        assert_eq!(settings.buddy_config().loop_count, 1);
        assert_eq!(settings.player_config().file_root, PathBuf::from("assets"));
    }
}
