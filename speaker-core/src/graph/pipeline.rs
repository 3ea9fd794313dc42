//! Element chain bound to a task.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::element::{Element, ElementIo};
use super::port::{Io, Port, PortDir};
use super::task::{JobTimes, Task, TaskEvent, TaskEventKind};
use super::{JobOutcome, State};
use crate::error::{Result, SpeakerError};

/// Event forwarded to the pipeline owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEvent {
    /// `"pipeline"` for task-level events, otherwise the element tag.
    pub source: String,
    pub kind: TaskEventKind,
    pub state: State,
}

pub type PipelineEventFn = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

pub(crate) struct Slot {
    pub(crate) element: Box<dyn Element>,
    pub(crate) io: ElementIo,
    pub(crate) state: State,
}

impl Slot {
    pub(crate) fn new(element: Box<dyn Element>) -> Self {
        Self {
            element,
            io: ElementIo::default(),
            state: State::Initialized,
        }
    }
}

struct Inner {
    slots: Vec<Arc<Mutex<Slot>>>,
    tags: Vec<String>,
    task: Mutex<Option<Arc<Task>>>,
    state: Mutex<State>,
    user_cb: Mutex<Option<PipelineEventFn>>,
}

impl Inner {
    fn emit(&self, source: &str, kind: TaskEventKind, state: State) {
        let cb = self.user_cb.lock().clone();
        if let Some(cb) = cb {
            cb(&PipelineEvent {
                source: source.to_string(),
                kind,
                state,
            });
        }
    }

    /// I/O objects at the two ends of the chain.
    fn edge_ios(&self) -> Vec<Arc<dyn Io>> {
        let mut ios = Vec::new();
        if let Some(first) = self.slots.first() {
            if let Some(p) = &first.lock().io.input {
                ios.push(Arc::clone(p.io()));
            }
        }
        if let Some(last) = self.slots.last() {
            if let Some(p) = &last.lock().io.output {
                ios.push(Arc::clone(p.io()));
            }
        }
        ios
    }

    fn on_task_event(&self, ev: &TaskEvent) -> Result<()> {
        match ev.kind {
            TaskEventKind::LoadingJob => {
                if ev.state.is_terminal() {
                    self.register_close_jobs(ev.state);
                    for io in self.edge_ios() {
                        if let Err(e) = io.close() {
                            warn!(io = io.tag(), "closing I/O failed: {e}");
                        }
                    }
                }
                self.emit("pipeline", ev.kind, ev.state);
                Ok(())
            }
            TaskEventKind::ChangeState => match ev.state {
                State::Running => {
                    let resuming = *self.state.lock() == State::Paused;
                    if !resuming {
                        self.emit("pipeline", ev.kind, State::Opening);
                        for io in self.edge_ios() {
                            if let Err(e) = io.open() {
                                error!(io = io.tag(), "opening I/O failed: {e}");
                                *self.state.lock() = State::Error;
                                self.emit("pipeline", ev.kind, State::Error);
                                return Err(e);
                            }
                        }
                    }
                    *self.state.lock() = State::Running;
                    self.emit("pipeline", ev.kind, State::Running);
                    Ok(())
                }
                st @ (State::Paused | State::Stopped | State::Finished | State::Error) => {
                    if st != State::Paused {
                        for (slot, tag) in self.slots.iter().zip(&self.tags) {
                            let mut slot = slot.lock();
                            if slot.state == State::Initialized {
                                debug!(element = tag.as_str(), state = %st, "element never opened");
                                slot.state = st;
                            }
                        }
                    }
                    *self.state.lock() = st;
                    self.emit("pipeline", ev.kind, st);
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }

    fn register_close_jobs(&self, terminal: State) {
        let Some(task) = self.task.lock().clone() else {
            return;
        };
        for (slot, tag) in self.slots.iter().zip(&self.tags) {
            let slot = Arc::clone(slot);
            let label = format!("{tag}_close");
            let tag = tag.clone();
            task.register_job(
                label,
                JobTimes::Once,
                Box::new(move || {
                    let mut guard = slot.lock();
                    let Slot { element, io, state } = &mut *guard;
                    if *state != State::Initialized {
                        if let Err(e) = element.close(io) {
                            warn!(element = tag.as_str(), "close failed: {e}");
                        }
                    }
                    *state = terminal;
                    JobOutcome::Ok
                }),
            );
        }
    }
}

/// An ordered chain of elements.
///
/// Built by [`Pool::new_pipeline`](super::Pool::new_pipeline). The pipeline
/// owns its elements and references the task it is bound to.
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub(crate) fn from_slots(slots: Vec<Slot>) -> Self {
        let tags = slots.iter().map(|s| s.element.tag().to_string()).collect();
        Self {
            inner: Arc::new(Inner {
                slots: slots.into_iter().map(|s| Arc::new(Mutex::new(s))).collect(),
                tags,
                task: Mutex::new(None),
                state: Mutex::new(State::None),
                user_cb: Mutex::new(None),
            }),
        }
    }

    /// Element tags in chain order.
    pub fn element_tags(&self) -> &[String] {
        &self.inner.tags
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock()
    }

    /// State of one element.
    pub fn element_state(&self, name: &str) -> Result<State> {
        Ok(self.slot(name)?.lock().state)
    }

    pub fn set_event(&self, cb: Option<PipelineEventFn>) {
        *self.inner.user_cb.lock() = cb;
    }

    fn slot(&self, name: &str) -> Result<&Arc<Mutex<Slot>>> {
        self.inner
            .tags
            .iter()
            .position(|t| t == name)
            .map(|i| &self.inner.slots[i])
            .ok_or_else(|| SpeakerError::NotFound(format!("element {name} not in pipeline")))
    }

    /// Run `f` against the named element's concrete type.
    ///
    /// # Errors
    /// `NotFound` when no element has that tag, `InvalidArgument` when it is
    /// not a `T`.
    pub fn with_element<T: Any, R>(&self, name: &str, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut slot = self.slot(name)?.lock();
        let el = slot
            .element
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| SpeakerError::InvalidArgument(format!("element {name} has another type")))?;
        Ok(f(el))
    }

    /// Attach `port` to the named element, replacing what was there.
    pub fn reg_el_port(&self, name: &str, dir: PortDir, port: Port) -> Result<()> {
        if port.dir() != dir {
            return Err(SpeakerError::InvalidArgument(format!(
                "port direction {:?} does not match {dir:?}",
                port.dir()
            )));
        }
        let mut slot = self.slot(name)?.lock();
        debug!(element = name, ?dir, io = port.io().tag(), "port registered");
        match dir {
            PortDir::In => slot.io.input = Some(port),
            PortDir::Out => slot.io.output = Some(port),
        }
        Ok(())
    }

    /// Tag of the I/O behind the named element's port, if any.
    pub fn port_tag(&self, name: &str, dir: PortDir) -> Result<Option<String>> {
        let slot = self.slot(name)?.lock();
        let port = match dir {
            PortDir::In => slot.io.input.as_ref(),
            PortDir::Out => slot.io.output.as_ref(),
        };
        Ok(port.map(|p| p.io().tag().to_string()))
    }

    /// Attach the task that will run this pipeline.
    ///
    /// # Errors
    /// `InvalidState` if the task still holds another pipeline's jobs.
    pub fn bind_task(&self, task: Arc<Task>) -> Result<()> {
        task.try_bind()?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        task.set_event(Some(Arc::new(move |ev: &TaskEvent| match weak.upgrade() {
            Some(inner) => inner.on_task_event(ev),
            None => Ok(()),
        })));
        info!(task = task.name(), elements = ?self.inner.tags, "pipeline bound");
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    pub fn task(&self) -> Option<Arc<Task>> {
        self.inner.task.lock().clone()
    }

    fn bound_task(&self) -> Result<Arc<Task>> {
        self.task()
            .ok_or_else(|| SpeakerError::InvalidArgument("pipeline has no task".into()))
    }

    /// Register an open and a process job per element.
    ///
    /// # Errors
    /// `InvalidArgument` without a bound task, `InvalidState` if an element
    /// is not freshly initialized.
    pub fn loading_jobs(&self) -> Result<()> {
        let task = self.bound_task()?;
        for (slot, tag) in self.inner.slots.iter().zip(&self.inner.tags) {
            if slot.lock().state != State::Initialized {
                return Err(SpeakerError::InvalidState(format!(
                    "element {tag} is not initialized, reset the pipeline first"
                )));
            }
        }

        let mut prev: Option<Arc<Mutex<Slot>>> = None;
        for (slot, tag) in self.inner.slots.iter().zip(&self.inner.tags) {
            let open_slot = Arc::clone(slot);
            let upstream = prev.take();
            let open_tag = tag.clone();
            task.register_job(
                format!("{tag}_open"),
                JobTimes::Once,
                Box::new(move || {
                    let info = upstream.as_ref().and_then(|p| p.lock().io.out_info);
                    let mut guard = open_slot.lock();
                    let Slot { element, io, state } = &mut *guard;
                    if io.in_info.is_none() {
                        io.in_info = info;
                    }
                    *state = State::Opening;
                    match element.open(io) {
                        Ok(()) => {
                            debug!(element = open_tag.as_str(), info = ?io.out_info, "element opened");
                            *state = State::Running;
                            JobOutcome::Ok
                        }
                        Err(e) => {
                            error!(element = open_tag.as_str(), "open failed: {e}");
                            *state = State::Error;
                            JobOutcome::Fail
                        }
                    }
                }),
            );

            let proc_slot = Arc::clone(slot);
            task.register_job(
                format!("{tag}_proc"),
                JobTimes::Infinite,
                Box::new(move || {
                    let mut guard = proc_slot.lock();
                    let Slot { element, io, state } = &mut *guard;
                    let outcome = element.process(io);
                    match outcome {
                        JobOutcome::Done => *state = State::Finished,
                        JobOutcome::Fail => *state = State::Error,
                        _ => {}
                    }
                    outcome
                }),
            );
            prev = Some(Arc::clone(slot));
        }
        debug!(jobs = ?task.job_labels(), "pipeline jobs loaded");
        Ok(())
    }

    /// Start the bound task. Already running is a no-op.
    pub fn run(&self) -> Result<()> {
        self.bound_task()?.run()
    }

    /// # Errors
    /// `NotSupported` when the pipeline is not running or paused.
    pub fn stop(&self) -> Result<()> {
        self.bound_task()?.stop()
    }

    pub fn pause(&self) -> Result<()> {
        self.bound_task()?.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.bound_task()?.resume()
    }

    /// Clear jobs, element state and buffered port data. `loading_jobs` must
    /// be called again before the next `run`.
    pub fn reset(&self) -> Result<()> {
        if let Some(task) = self.task() {
            task.reset()?;
        }
        for slot in &self.inner.slots {
            let mut slot = slot.lock();
            slot.element.reset();
            slot.state = State::Initialized;
            slot.io.in_info = None;
            slot.io.out_info = None;
            for port in [&slot.io.input, &slot.io.output].into_iter().flatten() {
                port.reset();
            }
        }
        *self.inner.state.lock() = State::Initialized;
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let Some(task) = self.inner.task.lock().take() else {
            return;
        };
        if matches!(task.state(), State::Running | State::Paused) {
            if let Err(e) = task.stop() {
                warn!(task = task.name(), "stop on drop failed: {e}");
            }
        }
        task.set_event(None);
        if let Err(e) = task.reset() {
            warn!(task = task.name(), "reset on drop failed: {e}");
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("elements", &self.inner.tags)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_bus::{Block, DataBus, RingBuffer};
    use crate::graph::port::{BusIo, PortKind};
    use crate::graph::{SoundInfo, TaskConfig};
    use crate::sync::Wait;
    use std::time::{Duration, Instant};

    /// Emits `frames` blocks of one byte each, then end-of-stream.
    struct Counter {
        frames: u8,
        sent: u8,
    }

    impl Element for Counter {
        fn tag(&self) -> &str {
            "counter"
        }
        fn duplicate(&self) -> Result<Box<dyn Element>> {
            Ok(Box::new(Counter { frames: self.frames, sent: 0 }))
        }
        fn out_size(&self) -> usize {
            1
        }
        fn open(&mut self, io: &mut ElementIo) -> Result<()> {
            io.notify_info(SoundInfo::new(16000, 1, 16));
            Ok(())
        }
        fn reset(&mut self) {
            self.sent = 0;
        }
        fn process(&mut self, io: &mut ElementIo) -> JobOutcome {
            if self.sent == self.frames {
                return match io.write_out(&[], true) {
                    Ok(()) => JobOutcome::Done,
                    Err(e) => crate::graph::element::port_failure("counter", "out", e),
                };
            }
            self.sent += 1;
            match io.write_out(&[self.sent], false) {
                Ok(()) => JobOutcome::Ok,
                Err(e) => crate::graph::element::port_failure("counter", "out", e),
            }
        }
        fn close(&mut self, _io: &mut ElementIo) -> Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Doubles each byte, records the upstream format.
    #[derive(Default)]
    struct Doubler {
        seen: Option<SoundInfo>,
    }

    impl Element for Doubler {
        fn tag(&self) -> &str {
            "doubler"
        }
        fn duplicate(&self) -> Result<Box<dyn Element>> {
            Ok(Box::new(Doubler::default()))
        }
        fn open(&mut self, io: &mut ElementIo) -> Result<()> {
            self.seen = io.in_info;
            io.out_info = io.in_info;
            Ok(())
        }
        fn process(&mut self, io: &mut ElementIo) -> JobOutcome {
            let mut blk = Block::default();
            if let Err(e) = io.acquire_in(&mut blk, 0) {
                return if e.is_timeout() {
                    JobOutcome::Continue
                } else {
                    crate::graph::element::port_failure("doubler", "in", e)
                };
            }
            let out: Vec<u8> = blk.data().iter().map(|b| b * 2).collect();
            let last = blk.is_last;
            let _ = io.release_in(&mut blk);
            if let Err(e) = io.write_out(&out, last) {
                return crate::graph::element::port_failure("doubler", "out", e);
            }
            if last {
                JobOutcome::Done
            } else {
                JobOutcome::Ok
            }
        }
        fn close(&mut self, _io: &mut ElementIo) -> Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn build(ring: &Arc<RingBuffer>) -> Pipeline {
        let mut a = Slot::new(Box::new(Counter { frames: 3, sent: 0 }));
        let mut b = Slot::new(Box::new(Doubler::default()));
        let (out, inp) = Port::link(1).unwrap();
        a.io.output = Some(out);
        b.io.input = Some(inp);
        let bus: Arc<dyn DataBus> = ring.clone();
        b.io.output = Some(Port::new(
            Arc::new(BusIo::new("sink", PortDir::Out, PortKind::Byte, bus)),
            0,
            Wait::Forever,
        ));
        Pipeline::from_slots(vec![a, b])
    }

    fn wait_for(pipe: &Pipeline, want: State) {
        let start = Instant::now();
        while pipe.state() != want {
            assert!(start.elapsed() < Duration::from_secs(2), "stuck at {}", pipe.state());
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn runs_to_finished_and_propagates_info() {
        let ring = Arc::new(RingBuffer::new(16, 1).unwrap());
        let pipe = build(&ring);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        pipe.set_event(Some(Arc::new(move |ev: &PipelineEvent| sink.lock().push(ev.state))));

        assert!(matches!(pipe.loading_jobs(), Err(SpeakerError::InvalidArgument(_))));
        let task = Arc::new(Task::new(TaskConfig::default()).unwrap());
        pipe.bind_task(Arc::clone(&task)).unwrap();
        pipe.loading_jobs().unwrap();
        pipe.run().unwrap();
        wait_for(&pipe, State::Finished);

        let mut buf = [0u8; 8];
        let n = ring.read(&mut buf, Wait::Immediate).unwrap();
        assert_eq!(&buf[..n], &[2, 4, 6]);
        assert!(ring.is_done_write());

        let seen = pipe
            .with_element::<Doubler, _>("doubler", |d| d.seen)
            .unwrap();
        assert_eq!(seen, Some(SoundInfo::new(16000, 1, 16)));
        assert_eq!(pipe.element_state("doubler").unwrap(), State::Finished);
        assert!(events.lock().contains(&State::Running));
        assert!(matches!(pipe.stop(), Err(SpeakerError::NotSupported(_))));
    }

    #[test]
    fn reset_allows_another_run() {
        let ring = Arc::new(RingBuffer::new(16, 1).unwrap());
        let pipe = build(&ring);
        let task = Arc::new(Task::new(TaskConfig::default()).unwrap());
        pipe.bind_task(task).unwrap();
        pipe.loading_jobs().unwrap();
        pipe.run().unwrap();
        wait_for(&pipe, State::Finished);
        assert!(matches!(pipe.loading_jobs(), Err(SpeakerError::InvalidState(_))));

        pipe.reset().unwrap();
        ring.reset();
        pipe.loading_jobs().unwrap();
        pipe.run().unwrap();
        wait_for(&pipe, State::Finished);
        let mut buf = [0u8; 8];
        assert_eq!(ring.read(&mut buf, Wait::Immediate).unwrap(), 3);
        assert_eq!(&buf[..3], &[2, 4, 6]);
    }

    #[test]
    fn busy_task_cannot_be_rebound() {
        let ring = Arc::new(RingBuffer::new(16, 1).unwrap());
        let first = build(&ring);
        let second = build(&ring);
        let task = Arc::new(Task::new(TaskConfig::default()).unwrap());
        first.bind_task(Arc::clone(&task)).unwrap();
        first.loading_jobs().unwrap();
        assert!(matches!(
            second.bind_task(task),
            Err(SpeakerError::InvalidState(_))
        ));
    }

    #[test]
    fn element_lookup_errors() {
        let ring = Arc::new(RingBuffer::new(16, 1).unwrap());
        let pipe = build(&ring);
        assert!(matches!(
            pipe.with_element::<Doubler, _>("missing", |_| ()),
            Err(SpeakerError::NotFound(_))
        ));
        assert!(matches!(
            pipe.with_element::<Counter, _>("doubler", |_| ()),
            Err(SpeakerError::InvalidArgument(_))
        ));
        assert_eq!(pipe.port_tag("doubler", PortDir::Out).unwrap().as_deref(), Some("sink"));
        assert_eq!(pipe.element_tags(), &["counter".to_string(), "doubler".to_string()]);
    }
}
