//! Named worker threads with per-role stack, priority and core settings.
//!
//! Priority and core affinity come from the device firmware's scheduling
//! plan. Hosted builds only record them in the spawn log line; the stack size
//! is honoured with a floor that leaves room for formatting and tracing.

use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{Result, SpeakerError};

/// Smallest stack handed to `std::thread::Builder`.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ThreadSettings {
    /// OS thread name. Default: `"speaker"`.
    pub name: String,
    /// Requested stack size in bytes. Default: 5 KiB (raised to `MIN_STACK_SIZE`).
    pub stack_size: usize,
    /// Scheduler priority on the device. Default: 6.
    pub priority: u8,
    /// CPU core to pin to on the device, `None` for no affinity. Default: `None`.
    pub core: Option<u8>,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            name: "speaker".into(),
            stack_size: 5 * 1024,
            priority: 6,
            core: None,
        }
    }
}

impl ThreadSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_stack(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_core(mut self, core: u8) -> Self {
        self.core = Some(core);
        self
    }

    /// Spawn `f` on a new thread configured by these settings.
    ///
    /// # Errors
    /// `ResourceExhausted` when the OS refuses to create the thread.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let stack = self.stack_size.max(MIN_STACK_SIZE);
        debug!(
            name = self.name.as_str(),
            stack,
            priority = self.priority,
            core = ?self.core,
            "spawning thread"
        );
        std::thread::Builder::new()
            .name(self.name.clone())
            .stack_size(stack)
            .spawn(f)
            .map_err(|e| SpeakerError::ResourceExhausted(format!("thread {}: {e}", self.name)))
    }
}
