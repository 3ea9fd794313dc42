//! Blocking primitives shared by the data bus, task and AFE manager.
//!
//! `BinarySemaphore` holds at most one pending token, so a `give()` with no
//! waiter is remembered exactly once. `EventGroup` is a 32-bit flag set whose
//! waiters can block for *any* or *all* of a mask.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail straight away if the condition does not already hold.
    Immediate,
    /// Block for at most this long.
    For(Duration),
    /// Block until the condition holds or the object is aborted.
    Forever,
}

impl Wait {
    /// Millisecond convenience: negative means `Forever`, zero `Immediate`.
    pub fn ms(ms: i64) -> Self {
        match ms {
            m if m < 0 => Wait::Forever,
            0 => Wait::Immediate,
            m => Wait::For(Duration::from_millis(m as u64)),
        }
    }

    /// Absolute deadline for this wait, `None` when unbounded.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Immediate => Some(Instant::now()),
            Wait::For(d) => Instant::now().checked_add(d),
            Wait::Forever => None,
        }
    }
}

impl Default for Wait {
    fn default() -> Self {
        Wait::Forever
    }
}

/// Single-token semaphore.
#[derive(Debug, Default)]
pub struct BinarySemaphore {
    token: Mutex<bool>,
    cv: Condvar,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the token available and wake one waiter.
    pub fn give(&self) {
        let mut token = self.token.lock();
        *token = true;
        self.cv.notify_one();
    }

    /// Take the token, blocking according to `wait`.
    ///
    /// Returns `false` when the wait expired without a token.
    pub fn take(&self, wait: Wait) -> bool {
        let deadline = wait.deadline();
        let mut token = self.token.lock();
        while !*token {
            match deadline {
                None => self.cv.wait(&mut token),
                Some(at) => {
                    if self.cv.wait_until(&mut token, at).timed_out() && !*token {
                        return false;
                    }
                }
            }
        }
        *token = false;
        true
    }
}

/// Whether `EventGroup::wait` needs every requested bit or just one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Any,
    All,
}

/// A set of 32 event flags with blocking waits.
#[derive(Debug, Default)]
pub struct EventGroup {
    bits: Mutex<u32>,
    cv: Condvar,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bits: u32) -> u32 {
        let mut cur = self.bits.lock();
        *cur |= bits;
        self.cv.notify_all();
        *cur
    }

    pub fn clear(&self, bits: u32) -> u32 {
        let mut cur = self.bits.lock();
        *cur &= !bits;
        *cur
    }

    pub fn get(&self) -> u32 {
        *self.bits.lock()
    }

    /// Block until `bits` are satisfied per `mode`.
    ///
    /// Returns the flag value observed when the condition held, or `None`
    /// on timeout. With `clear_on_exit` the requested bits are cleared
    /// before returning (only on success).
    pub fn wait(&self, bits: u32, mode: WaitMode, clear_on_exit: bool, wait: Wait) -> Option<u32> {
        let deadline = wait.deadline();
        let mut cur = self.bits.lock();
        loop {
            let hit = match mode {
                WaitMode::Any => *cur & bits != 0,
                WaitMode::All => *cur & bits == bits,
            };
            if hit {
                let seen = *cur;
                if clear_on_exit {
                    *cur &= !bits;
                }
                return Some(seen);
            }
            match deadline {
                None => self.cv.wait(&mut cur),
                Some(at) => {
                    if self.cv.wait_until(&mut cur, at).timed_out() {
                        let hit = match mode {
                            WaitMode::Any => *cur & bits != 0,
                            WaitMode::All => *cur & bits == bits,
                        };
                        if !hit {
                            return None;
                        }
                    }
                }
            }
        }
    }
}
