//! Face and status-icon state for the display.
//!
//! Rendering is someone else's job: every change is published as an
//! [`ExpressionUpdate`] on a broadcast channel and the display side decides
//! how to animate it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, SpeakerError};

const BROADCAST_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Angry,
    Blush,
    FastBlink,
    SlowBlink,
    Dizzy,
    Happy,
    Sad,
    Sleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Icon {
    BrightnessDown,
    BrightnessUp,
    Confused,
    Sleep,
    Thinking,
    InvalidFile,
    ServerConnected,
    ServerConnecting,
    VolumeDown,
    VolumeMute,
    VolumeUp,
    WifiDisconnected,
}

/// What an emoji name looks like on the face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Face {
    pub emotion: Option<Emotion>,
    pub icon: Option<Icon>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpressionMaps {
    pub emoji: BTreeMap<String, Face>,
    pub system_icons: BTreeMap<String, Icon>,
}

impl Default for ExpressionMaps {
    fn default() -> Self {
        use Emotion::*;
        let faces: [(&str, Emotion, Option<Icon>); 22] = [
            ("neutral", SlowBlink, None),
            ("happy", Happy, None),
            ("laughing", Happy, None),
            ("funny", Happy, None),
            ("loving", Happy, None),
            ("relaxed", Happy, None),
            ("delicious", Happy, None),
            ("kissy", Happy, None),
            ("confident", Happy, None),
            ("sad", Sad, None),
            ("crying", Sad, None),
            ("angry", Angry, None),
            ("embarrassed", FastBlink, Some(Icon::Thinking)),
            ("thinking", FastBlink, Some(Icon::Thinking)),
            ("surprised", FastBlink, None),
            ("shocked", FastBlink, None),
            ("silly", FastBlink, None),
            ("sleepy", Sleep, Some(Icon::Sleep)),
            ("confused", FastBlink, Some(Icon::Confused)),
            ("curious", FastBlink, Some(Icon::Confused)),
            ("dizzy", Dizzy, None),
            ("blink", Blush, None),
        ];
        let emoji = faces
            .into_iter()
            .map(|(name, emotion, icon)| {
                (
                    name.to_string(),
                    Face {
                        emotion: Some(emotion),
                        icon,
                    },
                )
            })
            .collect();
        let system_icons = [
            ("brightness_down", Icon::BrightnessDown),
            ("brightness_up", Icon::BrightnessUp),
            ("invalid_config", Icon::InvalidFile),
            ("server_connected", Icon::ServerConnected),
            ("server_connecting", Icon::ServerConnecting),
            ("volume_down", Icon::VolumeDown),
            ("volume_mute", Icon::VolumeMute),
            ("volume_up", Icon::VolumeUp),
            ("wifi_disconnected", Icon::WifiDisconnected),
        ]
        .into_iter()
        .map(|(name, icon)| (name.to_string(), icon))
        .collect();
        Self { emoji, system_icons }
    }
}

/// Animation hints for one emotion or icon change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimFlags {
    pub repeat: bool,
    pub keep_when_stop: bool,
    /// Interrupt the running animation instead of queueing behind it.
    pub immediate: bool,
}

impl Default for AnimFlags {
    fn default() -> Self {
        Self {
            repeat: true,
            keep_when_stop: false,
            immediate: true,
        }
    }
}

impl AnimFlags {
    pub fn queued() -> Self {
        Self {
            immediate: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExpressionUpdate {
    #[serde(rename_all = "camelCase")]
    Emoji {
        name: String,
        face: Face,
        emotion_anim: AnimFlags,
        icon_anim: AnimFlags,
    },
    #[serde(rename_all = "camelCase")]
    SystemIcon { name: String, icon: Icon, anim: AnimFlags },
    Paused,
    #[serde(rename_all = "camelCase")]
    Resumed { emotion: bool, icon: bool },
}

#[derive(Debug, Default)]
struct Shown {
    emoji: Option<String>,
    system_icon: Option<String>,
    paused: bool,
}

pub struct Expression {
    maps: ExpressionMaps,
    tx: broadcast::Sender<ExpressionUpdate>,
    shown: Mutex<Shown>,
}

impl Expression {
    pub fn new(maps: ExpressionMaps) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            maps,
            tx,
            shown: Mutex::new(Shown::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpressionUpdate> {
        self.tx.subscribe()
    }

    pub fn maps(&self) -> &ExpressionMaps {
        &self.maps
    }

    /// # Errors
    /// `NotFound` for a name missing from the emoji map.
    pub fn set_emoji(&self, name: &str, emotion_anim: AnimFlags, icon_anim: AnimFlags) -> Result<()> {
        let Some(face) = self.maps.emoji.get(name).copied() else {
            warn!(emoji = name, "unknown emoji");
            return Err(SpeakerError::NotFound(format!("emoji {name}")));
        };
        self.shown.lock().emoji = Some(name.to_string());
        debug!(emoji = name, immediate = emotion_anim.immediate, "emoji");
        self.publish(ExpressionUpdate::Emoji {
            name: name.to_string(),
            face,
            emotion_anim,
            icon_anim,
        });
        Ok(())
    }

    /// # Errors
    /// `NotFound` for a name missing from the system-icon map.
    pub fn set_system_icon(&self, name: &str, anim: AnimFlags) -> Result<()> {
        let Some(icon) = self.maps.system_icons.get(name).copied() else {
            warn!(icon = name, "unknown system icon");
            return Err(SpeakerError::NotFound(format!("system icon {name}")));
        };
        self.shown.lock().system_icon = Some(name.to_string());
        debug!(icon = name, "system icon");
        self.publish(ExpressionUpdate::SystemIcon {
            name: name.to_string(),
            icon,
            anim,
        });
        Ok(())
    }

    pub fn pause(&self) {
        let mut shown = self.shown.lock();
        if shown.paused {
            return;
        }
        shown.paused = true;
        self.publish(ExpressionUpdate::Paused);
    }

    pub fn resume(&self, emotion: bool, icon: bool) {
        let mut shown = self.shown.lock();
        if !shown.paused {
            return;
        }
        shown.paused = false;
        self.publish(ExpressionUpdate::Resumed { emotion, icon });
    }

    pub fn is_paused(&self) -> bool {
        self.shown.lock().paused
    }

    pub fn current_emoji(&self) -> Option<String> {
        self.shown.lock().emoji.clone()
    }

    pub fn current_system_icon(&self) -> Option<String> {
        self.shown.lock().system_icon.clone()
    }

    fn publish(&self, update: ExpressionUpdate) {
        // No subscribers is fine.
        let _ = self.tx.send(update);
    }
}

impl std::fmt::Debug for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expression")
            .field("shown", &*self.shown.lock())
            .finish_non_exhaustive()
    }
}
