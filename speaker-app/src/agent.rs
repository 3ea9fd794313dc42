//! Offline chat agent: acknowledges every lifecycle request immediately and
//! reports it back as buddy signals, so the device flow can be exercised
//! without a conversation service.

use std::collections::HashSet;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use speaker_core::buddy::{BuddySignal, ChatAgent, ChatEvent, ChatState};
use speaker_core::Result;
use tracing::{debug, info};

pub struct ConsoleAgent {
    states: Mutex<HashSet<ChatState>>,
    signals: Sender<BuddySignal>,
}

impl ConsoleAgent {
    /// The agent and the stream of signals it produces.
    pub fn new() -> (Self, Receiver<BuddySignal>) {
        let (signals, rx) = unbounded();
        let agent = Self {
            states: Mutex::new(HashSet::new()),
            signals,
        };
        (agent, rx)
    }

    fn emit(&self, signal: BuddySignal) {
        // The receiver goes away during shutdown.
        let _ = self.signals.send(signal);
    }

    fn start_and_end(&self, event: ChatEvent) {
        self.emit(BuddySignal::ChatEventStart { event });
        self.emit(BuddySignal::ChatEventEnd { event });
    }
}

impl ChatAgent for ConsoleAgent {
    fn has_chat_state(&self, state: ChatState) -> bool {
        self.states.lock().contains(&state)
    }

    fn send_chat_event(&self, event: ChatEvent, clear_queue: bool) -> Result<()> {
        info!(?event, clear_queue, "chat event");
        {
            let mut states = self.states.lock();
            match event {
                ChatEvent::Deinit => states.clear(),
                ChatEvent::Init => {
                    states.insert(ChatState::Inited);
                }
                ChatEvent::Start => {
                    states.insert(ChatState::Start);
                    states.insert(ChatState::Started);
                }
                ChatEvent::Stop => {
                    states.remove(&ChatState::Start);
                    states.remove(&ChatState::Started);
                }
                ChatEvent::Sleep => {
                    states.insert(ChatState::Sleep);
                }
                ChatEvent::WakeUp => {
                    states.remove(&ChatState::Sleep);
                }
            }
        }
        self.start_and_end(event);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        debug!("chat agent paused");
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        debug!("chat agent resumed");
        Ok(())
    }
}
