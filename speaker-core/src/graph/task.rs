//! Job scheduler with one OS thread.
//!
//! ## Job loop
//!
//! ```text
//! waiting ──run()──► Running ─┬─ job → Ok        next job (Once jobs are dropped)
//!                             ├─ job → Continue  back to the first job
//!                             ├─ job → Truncate  push on the resume stack, next job
//!                             ├─ job → Done      drop job; none left → Finished
//!                             └─ job → Fail      drop all jobs → Error
//! end of list → pop the resume stack (its bottom entry is never popped)
//! ```
//!
//! Pause and stop requests are honoured between jobs. Every state change is
//! reported to the event callback *before* it is stored, so the callback can
//! still read the previous state. `run`, `stop`, `pause` and `resume` wait for
//! the thread to acknowledge, bounded by the sync timeout.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, trace, warn};

use super::{JobOutcome, State};
use crate::error::{Result, SpeakerError};
use crate::sync::{BinarySemaphore, EventGroup, Wait, WaitMode};
use crate::thread::ThreadSettings;

const RUN_BIT: u32 = 1 << 0;
const PAUSE_BIT: u32 = 1 << 1;
const RESUME_BIT: u32 = 1 << 2;
const STOP_BIT: u32 = 1 << 3;
const EXIT_BIT: u32 = 1 << 4;

/// Default bound for `run`/`stop`/`pause`/`resume` acknowledgement.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(2000);

pub type JobFn = Box<dyn FnMut() -> JobOutcome + Send>;
pub type TaskEventFn = Arc<dyn Fn(&TaskEvent) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTimes {
    Once,
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    /// The task moved to `state`.
    ChangeState,
    /// The job list was emptied for `state` (finished, stopped or failed).
    LoadingJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub state: State,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Worker thread settings. Default: `"gmf_task"`, 5 KiB, priority 5, core 0.
    pub thread: ThreadSettings,
    /// Bound for control calls. Default: 2000 ms.
    pub sync_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            thread: ThreadSettings::named("gmf_task")
                .with_stack(5 * 1024)
                .with_priority(5)
                .with_core(0),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

struct Job {
    id: u64,
    label: String,
    times: JobTimes,
    func: Option<JobFn>,
}

#[derive(Default)]
struct Board {
    working: Vec<Job>,
    /// Resume stack. The first infinite job sits at the bottom.
    stack: Vec<u64>,
}

impl Board {
    fn head(&self) -> Option<u64> {
        self.working.first().map(|j| j.id)
    }

    fn index(&self, id: u64) -> Option<usize> {
        self.working.iter().position(|j| j.id == id)
    }

    fn next_after(&self, id: u64) -> Option<u64> {
        let i = self.index(id)?;
        self.working.get(i + 1).map(|j| j.id)
    }

    fn remove(&mut self, id: u64) {
        self.working.retain(|j| j.id != id);
    }

    fn pop_resume(&mut self) -> Option<u64> {
        if self.stack.len() > 1 {
            self.stack.pop()
        } else {
            self.stack.first().copied()
        }
    }

    fn clear(&mut self) {
        self.working.clear();
        self.stack.clear();
    }
}

#[derive(Default)]
struct Requests {
    run: bool,
    pause: bool,
    stop: bool,
    destroy: bool,
}

struct Shared {
    name: String,
    board: Mutex<Board>,
    state: Mutex<State>,
    requests: Mutex<Requests>,
    block_sem: BinarySemaphore,
    wait_sem: BinarySemaphore,
    bits: EventGroup,
    event: Mutex<Option<TaskEventFn>>,
    run_error: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl Shared {
    fn state(&self) -> State {
        *self.state.lock()
    }

    fn notify(&self, kind: TaskEventKind, state: State) -> Result<()> {
        let cb = self.event.lock().clone();
        match cb {
            Some(cb) => cb(&TaskEvent { kind, state }),
            None => Ok(()),
        }
    }

    fn transition(&self, kind: TaskEventKind, new: State) -> Result<()> {
        if self.state() == new {
            return Ok(());
        }
        self.notify(kind, new)?;
        *self.state.lock() = new;
        Ok(())
    }

    fn change_state(&self, new: State) -> Result<()> {
        self.transition(TaskEventKind::ChangeState, new)
    }

    fn loading_job(&self, new: State) {
        if let Err(e) = self.transition(TaskEventKind::LoadingJob, new) {
            warn!(task = self.name.as_str(), state = %new, "loading-job handler failed: {e}");
        }
    }

    fn head(&self) -> Option<u64> {
        self.board.lock().head()
    }

    fn thread_main(self: Arc<Self>) {
        let span = info_span!("task", name = self.name.as_str());
        let _enter = span.enter();

        'outer: loop {
            loop {
                {
                    let req = self.requests.lock();
                    if req.destroy {
                        break 'outer;
                    }
                    if req.run && !self.board.lock().working.is_empty() {
                        break;
                    }
                }
                debug!("waiting to run");
                self.block_sem.take(Wait::Forever);
            }

            let prepared = self.change_state(State::Running);
            self.requests.lock().run = false;
            if let Err(e) = prepared {
                error!("failed on prepare: {e}");
                *self.run_error.lock() = Some(e.to_string());
                self.bits.set(RUN_BIT);
                continue;
            }
            self.bits.set(RUN_BIT);
            self.process();
        }

        *self.state.lock() = State::None;
        self.bits.set(EXIT_BIT);
        debug!("task thread exited");
    }

    fn process(&self) {
        let mut is_stop = false;
        let mut cur = self.head();

        while let Some(id) = cur {
            let taken = {
                let mut board = self.board.lock();
                board.index(id).and_then(|i| {
                    let job = &mut board.working[i];
                    job.func
                        .take()
                        .map(|f| (f, job.times, job.label.clone()))
                })
            };
            let Some((mut func, times, label)) = taken else {
                let head = self.head();
                cur = if head == Some(id) { None } else { head };
                continue;
            };

            let outcome = func();
            {
                let mut board = self.board.lock();
                if let Some(i) = board.index(id) {
                    board.working[i].func = Some(func);
                }
            }
            trace!(job = label.as_str(), ?outcome, "job returned");

            match outcome {
                JobOutcome::Continue => {
                    cur = self.head();
                    continue;
                }
                JobOutcome::Truncate => {
                    debug!(job = label.as_str(), "job truncated");
                    self.board.lock().stack.push(id);
                }
                JobOutcome::Done => {
                    info!(job = label.as_str(), "job is done");
                    let next = {
                        let mut board = self.board.lock();
                        let next = board.next_after(id);
                        board.remove(id);
                        board.stack.retain(|s| *s != id);
                        next
                    };
                    cur = match next {
                        Some(n) => Some(n),
                        None => {
                            debug!("all jobs finished");
                            self.board.lock().stack.clear();
                            self.loading_job(State::Finished);
                            self.head()
                        }
                    };
                    continue;
                }
                JobOutcome::Fail => {
                    error!(job = label.as_str(), state = %self.state(), "job failed");
                    if self.state() != State::Stopped {
                        self.board.lock().clear();
                        self.loading_job(State::Error);
                        is_stop = true;
                        cur = self.head();
                        continue;
                    }
                }
                JobOutcome::Ok => {}
            }

            if self.requests.lock().pause {
                if self.state() != State::Error {
                    info!(job = label.as_str(), "pausing");
                    if let Err(e) = self.change_state(State::Paused) {
                        warn!("pause notification failed: {e}");
                    }
                    self.bits.set(PAUSE_BIT);
                    self.wait_sem.take(Wait::Forever);
                    info!(job = label.as_str(), "resuming");
                    if let Err(e) = self.change_state(State::Running) {
                        warn!("resume notification failed: {e}");
                    }
                    self.bits.set(RESUME_BIT);
                }
                self.requests.lock().pause = false;
            }

            if self.requests.lock().stop && self.state() != State::Error {
                debug!(job = label.as_str(), "stopping");
                self.board.lock().clear();
                self.loading_job(State::Stopped);
                self.requests.lock().stop = false;
                is_stop = true;
                cur = self.head();
                continue;
            }

            cur = {
                let mut board = self.board.lock();
                let next = board.next_after(id);
                if times == JobTimes::Once {
                    board.remove(id);
                }
                next.or_else(|| board.pop_resume())
            };
        }

        let st = self.state();
        if let Err(e) = self.notify(TaskEventKind::ChangeState, st) {
            warn!(state = %st, "final state notification failed: {e}");
        }
        if is_stop {
            self.bits.set(STOP_BIT);
        }
    }
}

/// A job runner owning one OS thread.
pub struct Task {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
    sync_timeout: Mutex<Duration>,
    bound: AtomicBool,
}

impl Task {
    /// Spawn the task thread. The task starts `Initialized` and idle.
    ///
    /// # Errors
    /// `ResourceExhausted` if the thread cannot be created.
    pub fn new(config: TaskConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: config.thread.name.clone(),
            board: Mutex::new(Board::default()),
            state: Mutex::new(State::Initialized),
            requests: Mutex::new(Requests::default()),
            block_sem: BinarySemaphore::new(),
            wait_sem: BinarySemaphore::new(),
            bits: EventGroup::new(),
            event: Mutex::new(None),
            run_error: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });
        let worker = Arc::clone(&shared);
        let handle = config.thread.spawn(move || worker.thread_main())?;
        let thread_id = Some(handle.thread().id());
        info!(name = config.thread.name.as_str(), "task created");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
            sync_timeout: Mutex::new(config.sync_timeout),
            bound: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Replace the event callback.
    pub fn set_event(&self, cb: Option<TaskEventFn>) {
        *self.shared.event.lock() = cb;
    }

    /// Override the control-call bound.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.sync_timeout.lock() = timeout;
    }

    /// Append a job to the working list. The first infinite job becomes the
    /// bottom of the resume stack.
    pub fn register_job(&self, label: impl Into<String>, times: JobTimes, func: JobFn) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        debug!(task = self.name(), job = label.as_str(), ?times, "job registered");
        let mut board = self.shared.board.lock();
        if times == JobTimes::Infinite && board.stack.is_empty() {
            board.stack.push(id);
        }
        board.working.push(Job {
            id,
            label,
            times,
            func: Some(func),
        });
    }

    pub fn job_labels(&self) -> Vec<String> {
        self.shared
            .board
            .lock()
            .working
            .iter()
            .map(|j| j.label.clone())
            .collect()
    }

    pub fn has_jobs(&self) -> bool {
        !self.shared.board.lock().working.is_empty()
    }

    pub(crate) fn try_bind(&self) -> Result<()> {
        if self.has_jobs() {
            return Err(SpeakerError::InvalidState(format!(
                "task {} still has jobs loaded",
                self.name()
            )));
        }
        self.bound.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wait_bit(&self, bit: u32) -> bool {
        let timeout = *self.sync_timeout.lock();
        self.shared
            .bits
            .wait(bit, WaitMode::All, true, Wait::For(timeout))
            .is_some()
    }

    /// Start executing the loaded jobs. A running task is left alone.
    ///
    /// # Errors
    /// - `NotSupported` while paused (use `resume`).
    /// - `InvalidState` with no thread or no jobs, or if the start handler refused.
    /// - `Timeout` if the thread did not acknowledge in time.
    pub fn run(&self) -> Result<()> {
        match self.state() {
            State::Running => {
                debug!(task = self.name(), "already running");
                return Ok(());
            }
            State::Paused => {
                return Err(SpeakerError::NotSupported(
                    "task is paused, resume it instead".into(),
                ))
            }
            _ => {}
        }
        if self.thread.lock().is_none() {
            return Err(SpeakerError::InvalidState("task thread is gone".into()));
        }
        if !self.has_jobs() {
            return Err(SpeakerError::InvalidState("no jobs loaded".into()));
        }
        self.shared.bits.clear(RUN_BIT);
        *self.shared.run_error.lock() = None;
        self.shared.requests.lock().run = true;
        self.shared.block_sem.give();
        if !self.wait_bit(RUN_BIT) {
            warn!(task = self.name(), "run not acknowledged in time");
            return Err(SpeakerError::Timeout);
        }
        if let Some(msg) = self.shared.run_error.lock().take() {
            return Err(SpeakerError::InvalidState(msg));
        }
        Ok(())
    }

    /// Ask the loop to drop its jobs after the current one returns.
    ///
    /// # Errors
    /// `NotSupported` unless running or paused; `Timeout` if the current job
    /// did not return within the sync timeout.
    pub fn stop(&self) -> Result<()> {
        let st = self.state();
        if !matches!(st, State::Running | State::Paused) {
            return Err(SpeakerError::NotSupported(format!("stop while {st}")));
        }
        self.shared.bits.clear(STOP_BIT);
        self.shared.requests.lock().stop = true;
        if st == State::Paused {
            self.shared.wait_sem.give();
        }
        if self.wait_bit(STOP_BIT) {
            return Ok(());
        }
        if self.state().is_terminal() {
            // The loop ended on its own before it saw the request.
            self.shared.requests.lock().stop = false;
            return Ok(());
        }
        warn!(task = self.name(), "stop not acknowledged in time");
        Err(SpeakerError::Timeout)
    }

    /// # Errors
    /// `NotSupported` unless running; `Timeout` when not acknowledged.
    pub fn pause(&self) -> Result<()> {
        match self.state() {
            State::Stopped | State::Paused | State::Finished | State::Error => return Ok(()),
            State::Running => {}
            st => return Err(SpeakerError::NotSupported(format!("pause while {st}"))),
        }
        self.shared.bits.clear(PAUSE_BIT);
        self.shared.requests.lock().pause = true;
        if self.wait_bit(PAUSE_BIT) {
            Ok(())
        } else {
            Err(SpeakerError::Timeout)
        }
    }

    /// # Errors
    /// `NotSupported` unless paused; `Timeout` when not acknowledged.
    pub fn resume(&self) -> Result<()> {
        let st = self.state();
        if st != State::Paused {
            return Err(SpeakerError::NotSupported(format!("resume while {st}")));
        }
        self.shared.bits.clear(RESUME_BIT);
        self.shared.wait_sem.give();
        if self.wait_bit(RESUME_BIT) {
            Ok(())
        } else {
            Err(SpeakerError::Timeout)
        }
    }

    /// Drop leftover jobs and return to `Initialized`.
    ///
    /// # Errors
    /// `InvalidState` while running or paused.
    pub fn reset(&self) -> Result<()> {
        let st = self.state();
        if matches!(st, State::Running | State::Paused) {
            return Err(SpeakerError::InvalidState(format!("reset while {st}")));
        }
        self.shared.board.lock().clear();
        {
            let mut req = self.shared.requests.lock();
            req.pause = false;
            req.stop = false;
        }
        *self.shared.state.lock() = State::Initialized;
        Ok(())
    }

    fn shutdown(&self) {
        let st = self.state();
        {
            let mut req = self.shared.requests.lock();
            if matches!(st, State::Running | State::Paused) {
                req.stop = true;
            }
            req.destroy = true;
        }
        if st == State::Paused {
            self.shared.wait_sem.give();
        }
        self.shared.block_sem.give();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if self.thread_id == Some(std::thread::current().id()) {
            warn!(task = self.name(), "task dropped from its own thread, detaching");
            return;
        }
        if self.wait_bit(EXIT_BIT) {
            if handle.join().is_err() {
                error!(task = self.name(), "task thread panicked");
            }
        } else {
            warn!(task = self.name(), "task thread did not exit in time, detaching");
        }
        self.shared.board.lock().clear();
        self.set_event(None);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("bound", &self.bound.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for_state(task: &Task, want: State) {
        let start = Instant::now();
        while task.state() != want {
            assert!(
                start.elapsed() < Duration::from_secs(2),
                "timed out waiting for {want}, at {}",
                task.state()
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<TaskEvent>>>, TaskEventFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let cb: TaskEventFn = Arc::new(move |ev: &TaskEvent| {
            sink.lock().push(*ev);
            Ok(())
        });
        (log, cb)
    }

    #[test]
    fn once_and_infinite_jobs_run_until_done() {
        let task = Task::new(TaskConfig::default()).unwrap();
        let (log, cb) = recorder();
        task.set_event(Some(cb));

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        task.register_job("a_open", JobTimes::Once, Box::new(move || {
            o.lock().push("open");
            JobOutcome::Ok
        }));
        let o = Arc::clone(&order);
        let mut n = 0;
        task.register_job("a_proc", JobTimes::Infinite, Box::new(move || {
            n += 1;
            o.lock().push("proc");
            if n == 3 {
                JobOutcome::Done
            } else {
                JobOutcome::Ok
            }
        }));

        task.run().unwrap();
        wait_for_state(&task, State::Finished);
        assert_eq!(*order.lock(), vec!["open", "proc", "proc", "proc"]);
        assert!(!task.has_jobs());

        let events = log.lock().clone();
        assert_eq!(events[0], TaskEvent { kind: TaskEventKind::ChangeState, state: State::Running });
        assert!(events.contains(&TaskEvent { kind: TaskEventKind::LoadingJob, state: State::Finished }));
    }

    #[test]
    fn continue_restarts_from_head() {
        let task = Task::new(TaskConfig::default()).unwrap();
        let head_calls = Arc::new(AtomicUsize::new(0));
        let tail_calls = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&head_calls);
        task.register_job("src", JobTimes::Infinite, Box::new(move || {
            match h.fetch_add(1, Ordering::SeqCst) + 1 {
                4 => JobOutcome::Done,
                n if n % 2 == 1 => JobOutcome::Continue,
                _ => JobOutcome::Ok,
            }
        }));
        let t = Arc::clone(&tail_calls);
        task.register_job("sink", JobTimes::Infinite, Box::new(move || {
            if t.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                JobOutcome::Done
            } else {
                JobOutcome::Ok
            }
        }));

        task.run().unwrap();
        wait_for_state(&task, State::Finished);
        // Odd calls restart at "src" without reaching "sink".
        assert_eq!(head_calls.load(Ordering::SeqCst), 4);
        assert_eq!(tail_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_job_reports_error_and_clears_jobs() {
        let task = Task::new(TaskConfig::default()).unwrap();
        let (log, cb) = recorder();
        task.set_event(Some(cb));
        task.register_job("bad", JobTimes::Infinite, Box::new(|| JobOutcome::Fail));
        task.register_job("never", JobTimes::Infinite, Box::new(|| JobOutcome::Ok));
        task.run().unwrap();
        wait_for_state(&task, State::Error);
        assert!(!task.has_jobs());
        assert!(log
            .lock()
            .contains(&TaskEvent { kind: TaskEventKind::LoadingJob, state: State::Error }));
    }

    #[test]
    fn pause_resume_stop_round_trip() {
        let task = Task::new(TaskConfig::default()).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        task.register_job("tick", JobTimes::Infinite, Box::new(move || {
            t.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            JobOutcome::Ok
        }));
        task.run().unwrap();
        task.run().unwrap(); // no-op while running

        task.pause().unwrap();
        assert_eq!(task.state(), State::Paused);
        assert!(matches!(task.run(), Err(SpeakerError::NotSupported(_))));
        let frozen = ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);

        task.resume().unwrap();
        assert_eq!(task.state(), State::Running);
        task.stop().unwrap();
        assert_eq!(task.state(), State::Stopped);
        assert!(matches!(task.stop(), Err(SpeakerError::NotSupported(_))));
    }

    #[test]
    fn stop_while_paused_releases_the_loop() {
        let task = Task::new(TaskConfig::default()).unwrap();
        task.register_job("idle", JobTimes::Infinite, Box::new(|| {
            std::thread::sleep(Duration::from_millis(1));
            JobOutcome::Ok
        }));
        task.run().unwrap();
        task.pause().unwrap();
        task.stop().unwrap();
        assert_eq!(task.state(), State::Stopped);
    }

    #[test]
    fn run_without_jobs_is_invalid_state() {
        let task = Task::new(TaskConfig::default()).unwrap();
        assert!(matches!(task.run(), Err(SpeakerError::InvalidState(_))));
    }

    #[test]
    fn refused_start_surfaces_as_error() {
        let task = Task::new(TaskConfig::default()).unwrap();
        task.set_event(Some(Arc::new(|ev: &TaskEvent| {
            if ev.state == State::Running {
                Err(SpeakerError::Device("input unavailable".into()))
            } else {
                Ok(())
            }
        })));
        task.register_job("x", JobTimes::Infinite, Box::new(|| JobOutcome::Ok));
        assert!(matches!(task.run(), Err(SpeakerError::InvalidState(_))));
        assert_eq!(task.state(), State::Initialized);
    }

    #[test]
    fn truncated_job_resumes_after_cycle() {
        let task = Task::new(TaskConfig::default()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let mut pending = 2;
        task.register_job("burst", JobTimes::Infinite, Box::new(move || {
            if pending > 0 {
                pending -= 1;
                o.lock().push("burst");
                JobOutcome::Truncate
            } else {
                o.lock().push("burst-done");
                JobOutcome::Done
            }
        }));
        let o = Arc::clone(&order);
        let mut sink_calls = 0;
        task.register_job("sink", JobTimes::Infinite, Box::new(move || {
            sink_calls += 1;
            o.lock().push("sink");
            if sink_calls == 3 {
                JobOutcome::Done
            } else {
                JobOutcome::Ok
            }
        }));
        task.run().unwrap();
        wait_for_state(&task, State::Finished);
        assert_eq!(
            *order.lock(),
            vec!["burst", "sink", "burst", "sink", "burst-done", "sink"]
        );
    }

    #[test]
    fn reset_returns_to_initialized() {
        let task = Task::new(TaskConfig::default()).unwrap();
        task.register_job("one", JobTimes::Once, Box::new(|| JobOutcome::Done));
        task.run().unwrap();
        wait_for_state(&task, State::Finished);
        task.reset().unwrap();
        assert_eq!(task.state(), State::Initialized);
    }
}
