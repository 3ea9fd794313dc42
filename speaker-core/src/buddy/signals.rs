//! Chat-agent vocabulary and the signals the buddy reacts to.

use serde::{Deserialize, Serialize};

/// Lifecycle requests understood by the chat agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEvent {
    Deinit,
    Init,
    Stop,
    Start,
    Sleep,
    WakeUp,
}

/// Conditions the agent can be asked about. Several hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    /// Init has completed.
    Inited,
    /// A start has been requested or completed.
    Start,
    /// The session is up.
    Started,
    /// The session is asleep.
    Sleep,
}

/// Failures reported by the agent that change the buddy's behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatError {
    /// The account has run out of credits. Reconnects back off.
    InsufficientCredits,
    /// Anything else, logged and otherwise ignored.
    Code(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialSignal {
    /// The agent's configuration file could not be used.
    InitInvalidConfig,
    /// The agent gave up reconnecting.
    StartMaxRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuddySignal {
    /// The agent began handling `event`.
    ChatEventStart { event: ChatEvent },
    /// The agent finished handling `event`.
    ChatEventEnd { event: ChatEvent },
    Special { signal: SpecialSignal },
    /// The user was heard; acknowledge it.
    Response,
    /// `true` wakes the session, `false` puts it to sleep.
    WakeUpRequest { wake: bool },
    Emoji { name: String },
    Speaking { speaking: bool },
    WebsocketDisconnected,
    ChatError { error: ChatError },
    WifiDisconnected,
    GotIp,
    TerminateChat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_signal_survives_json() {
        let all = vec![
            BuddySignal::ChatEventStart { event: ChatEvent::Init },
            BuddySignal::ChatEventEnd { event: ChatEvent::WakeUp },
            BuddySignal::Special { signal: SpecialSignal::StartMaxRetry },
            BuddySignal::Response,
            BuddySignal::WakeUpRequest { wake: true },
            BuddySignal::Emoji { name: "happy".into() },
            BuddySignal::Speaking { speaking: false },
            BuddySignal::WebsocketDisconnected,
            BuddySignal::ChatError { error: ChatError::Code(-3) },
            BuddySignal::ChatError { error: ChatError::InsufficientCredits },
            BuddySignal::WifiDisconnected,
            BuddySignal::GotIp,
            BuddySignal::TerminateChat,
        ];
        for signal in all {
            let json = serde_json::to_string(&signal).unwrap();
            let back: BuddySignal = serde_json::from_str(&json).unwrap();
            assert_eq!(back, signal, "{json}");
        }
    }

    #[test]
    fn special_signal_keeps_its_field() {
        let json = serde_json::to_value(BuddySignal::Special {
            signal: SpecialSignal::InitInvalidConfig,
        })
        .unwrap();
        assert_eq!(json["kind"], "special");
        assert_eq!(json["signal"], "init_invalid_config");
    }
}
