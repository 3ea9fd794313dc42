//! Audio cues, scheduling requests and the cue catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioType {
    WifiNeedConnect,
    WifiConnected,
    WifiDisconnected,
    ServerConnected,
    ServerDisconnected,
    ServerConnecting,
    MicOn,
    MicOff,
    WakeUp,
    ResponseLaiLo,
    ResponseWoZaiTingNe,
    ResponseWoZai,
    ResponseZaiNe,
    SleepBaiBaiLo,
    SleepHaoDe,
    SleepWoTuiXiaLe,
    SleepXianZheYangLo,
    InvalidConfig,
    InsufficientCredits,
}

impl AudioType {
    pub const ALL: [AudioType; 19] = [
        AudioType::WifiNeedConnect,
        AudioType::WifiConnected,
        AudioType::WifiDisconnected,
        AudioType::ServerConnected,
        AudioType::ServerDisconnected,
        AudioType::ServerConnecting,
        AudioType::MicOn,
        AudioType::MicOff,
        AudioType::WakeUp,
        AudioType::ResponseLaiLo,
        AudioType::ResponseWoZaiTingNe,
        AudioType::ResponseWoZai,
        AudioType::ResponseZaiNe,
        AudioType::SleepBaiBaiLo,
        AudioType::SleepHaoDe,
        AudioType::SleepWoTuiXiaLe,
        AudioType::SleepXianZheYangLo,
        AudioType::InvalidConfig,
        AudioType::InsufficientCredits,
    ];
}

/// A request to play a cue.
///
/// `repeat_count`: `-1` repeats until cancelled, `0` plays once, `N > 0`
/// plays `N` times. Repeats are spaced at least `repeat_interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEvent {
    pub kind: AudioType,
    pub repeat_count: i32,
    pub repeat_interval_ms: u64,
}

impl AudioEvent {
    pub const INFINITE: i32 = -1;

    pub const fn once(kind: AudioType) -> Self {
        Self {
            kind,
            repeat_count: 0,
            repeat_interval_ms: 0,
        }
    }

    pub const fn repeat(kind: AudioType, repeat_count: i32, repeat_interval_ms: u64) -> Self {
        Self {
            kind,
            repeat_count,
            repeat_interval_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioCue {
    pub url: String,
    /// Roughly how long the cue occupies the speaker.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedCue {
    pub weight: f32,
    pub kind: AudioType,
}

/// Cue files and the random phrase tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioCatalog {
    #[serde(default)]
    pub cues: BTreeMap<AudioType, AudioCue>,
    /// Acknowledgements played when the user is heard. A catalog file that
    /// omits a table gets an empty one, never the stock phrases.
    #[serde(default)]
    pub response: Vec<WeightedCue>,
    /// Goodbyes played before going to sleep.
    #[serde(default)]
    pub sleep: Vec<WeightedCue>,
}

impl AudioCatalog {
    pub fn cue(&self, kind: AudioType) -> Option<&AudioCue> {
        self.cues.get(&kind)
    }
}

impl Default for AudioCatalog {
    fn default() -> Self {
        use AudioType::*;
        let table: [(AudioType, &str, u64); 19] = [
            (WifiNeedConnect, "wifi_need_connect", 4000),
            (WifiConnected, "wifi_connect_success", 2000),
            (WifiDisconnected, "wifi_disconnect", 4000),
            (ServerConnected, "server_connected", 2000),
            (ServerDisconnected, "server_disconnect", 2000),
            (ServerConnecting, "server_connecting", 3000),
            (MicOn, "mic_open", 2000),
            (MicOff, "mic_close", 5000),
            (WakeUp, "wake_up", 3000),
            (ResponseLaiLo, "response_lai_lo", 2000),
            (ResponseWoZaiTingNe, "response_wo_zai_ting_ne", 2000),
            (ResponseWoZai, "response_wo_zai", 2000),
            (ResponseZaiNe, "response_zai_ne", 1000),
            (SleepBaiBaiLo, "sleep_bai_bai_lo", 2000),
            (SleepHaoDe, "sleep_hao_de", 3000),
            (SleepWoTuiXiaLe, "sleep_wo_tui_xia_le", 2000),
            (SleepXianZheYangLo, "sleep_xian_zhe_yang_lo", 3000),
            (InvalidConfig, "invalid_config_file", 5000),
            (InsufficientCredits, "coze_error_credits", 7000),
        ];
        let cues = table
            .into_iter()
            .map(|(kind, name, duration_ms)| {
                (
                    kind,
                    AudioCue {
                        url: format!("file://spiffs/{name}.wav"),
                        duration_ms,
                    },
                )
            })
            .collect();
        let even = |kinds: [AudioType; 4]| {
            kinds
                .into_iter()
                .map(|kind| WeightedCue { weight: 0.25, kind })
                .collect()
        };
        Self {
            cues,
            response: even([ResponseLaiLo, ResponseWoZaiTingNe, ResponseWoZai, ResponseZaiNe]),
            sleep: even([SleepBaiBaiLo, SleepHaoDe, SleepWoTuiXiaLe, SleepXianZheYangLo]),
        }
    }
}

/// Cumulative-weight pick: the first entry whose running total reaches
/// `draw`. `draw` is expected in `0..=total weight`.
pub fn pick_weighted(table: &[WeightedCue], draw: f32) -> Option<AudioType> {
    let mut cumulative = 0.0;
    for entry in table {
        cumulative += entry.weight;
        if draw <= cumulative {
            return Some(entry.kind);
        }
    }
    None
}

pub fn total_weight(table: &[WeightedCue]) -> f32 {
    table.iter().map(|e| e.weight).sum()
}
