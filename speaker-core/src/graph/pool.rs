//! Registry of element and I/O prototypes.

use std::sync::Arc;

use tracing::{debug, error};

use super::element::Element;
use super::pipeline::{Pipeline, Slot};
use super::port::{Io, Port, PortDir};
use crate::error::{Result, SpeakerError};
use crate::sync::Wait;

/// Prototypes are duplicated, never handed out directly.
#[derive(Default)]
pub struct Pool {
    elements: Vec<Box<dyn Element>>,
    ios: Vec<Arc<dyn Io>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element prototype. Tags may repeat; lookups take the first.
    pub fn register_element(&mut self, proto: Box<dyn Element>) {
        debug!(tag = proto.tag(), "element registered");
        self.elements.push(proto);
    }

    /// Drop every element prototype registered under `tag`. Returns how many
    /// were removed.
    pub fn unregister_element(&mut self, tag: &str) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| e.tag() != tag);
        let removed = before - self.elements.len();
        if removed > 0 {
            debug!(tag, removed, "element unregistered");
        }
        removed
    }

    /// Add an I/O prototype. Lookups match tag and direction.
    pub fn register_io(&mut self, proto: Arc<dyn Io>) {
        debug!(tag = proto.tag(), dir = ?proto.dir(), "io registered");
        self.ios.push(proto);
    }

    pub fn element_tags(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.tag()).collect()
    }

    /// Fresh copy of the named element prototype.
    ///
    /// # Errors
    /// `NotFound` when nothing is registered under `name`.
    pub fn new_element(&self, name: &str) -> Result<Box<dyn Element>> {
        self.elements
            .iter()
            .find(|e| e.tag() == name)
            .ok_or_else(|| SpeakerError::NotFound(format!("element {name}")))?
            .duplicate()
    }

    fn new_io(&self, name: &str, dir: PortDir) -> Result<Arc<dyn Io>> {
        self.ios
            .iter()
            .find(|io| io.tag() == name && io.dir() == dir)
            .map(|io| io.duplicate())
            .ok_or_else(|| SpeakerError::NotFound(format!("{dir:?} io {name}")))
    }

    /// Build a pipeline from registered prototypes.
    ///
    /// Consecutive elements are linked by a block port pair sized from the
    /// upstream element's output. `in_name`/`out_name` attach a duplicated
    /// I/O to the first/last element. On any failure nothing is kept.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty element list.
    /// - `NotFound` for an unregistered element or I/O.
    pub fn new_pipeline(
        &self,
        in_name: Option<&str>,
        names: &[&str],
        out_name: Option<&str>,
    ) -> Result<Pipeline> {
        if names.is_empty() {
            return Err(SpeakerError::InvalidArgument(
                "pipeline needs at least one element".into(),
            ));
        }
        let slots = self.build_slots(in_name, names, out_name).inspect_err(|e| {
            error!(elements = ?names, "pipeline build failed: {e}");
        })?;
        debug!(elements = ?names, ?in_name, ?out_name, "pipeline created");
        Ok(Pipeline::from_slots(slots))
    }

    fn build_slots(
        &self,
        in_name: Option<&str>,
        names: &[&str],
        out_name: Option<&str>,
    ) -> Result<Vec<Slot>> {
        let mut slots: Vec<Slot> = Vec::with_capacity(names.len());
        for name in names {
            let el = self.new_element(name)?;
            if let Some(prev) = slots.last_mut() {
                let (out, inp) = Port::link(prev.element.out_size())?;
                prev.io.output = Some(out);
                let mut slot = Slot::new(el);
                slot.io.input = Some(inp);
                slots.push(slot);
            } else {
                slots.push(Slot::new(el));
            }
        }

        if let Some(name) = in_name {
            let io = self.new_io(name, PortDir::In)?;
            let first = &mut slots[0];
            let size = first.element.in_size();
            first.io.input = Some(Port::new(io, size, Wait::Forever));
        }
        if let Some(name) = out_name {
            let io = self.new_io(name, PortDir::Out)?;
            if let Some(last) = slots.last_mut() {
                let size = last.element.out_size();
                last.io.output = Some(Port::new(io, size, Wait::Forever));
            }
        }
        Ok(slots)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("elements", &self.element_tags())
            .field("ios", &self.ios.iter().map(|io| io.tag()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_bus::{DataBus, RingBuffer};
    use crate::graph::element::ElementIo;
    use crate::graph::port::{BusIo, PortKind};
    use crate::graph::JobOutcome;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts live instances so leaks show up.
    struct Probe {
        tag: &'static str,
        live: Arc<AtomicUsize>,
    }

    impl Probe {
        fn new(tag: &'static str, live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self {
                tag,
                live: Arc::clone(live),
            }
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Element for Probe {
        fn tag(&self) -> &str {
            self.tag
        }
        fn duplicate(&self) -> Result<Box<dyn Element>> {
            Ok(Box::new(Probe::new(self.tag, &self.live)))
        }
        fn in_size(&self) -> usize {
            64
        }
        fn out_size(&self) -> usize {
            32
        }
        fn open(&mut self, _io: &mut ElementIo) -> Result<()> {
            Ok(())
        }
        fn process(&mut self, _io: &mut ElementIo) -> JobOutcome {
            JobOutcome::Done
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

    fn pool(live: &Arc<AtomicUsize>) -> Pool {
        let mut pool = Pool::new();
        for tag in ["e1", "e2", "e3"] {
            pool.register_element(Box::new(Probe::new(tag, live)));
        }
        let ring: Arc<dyn DataBus> = Arc::new(RingBuffer::new(64, 2).unwrap());
        pool.register_io(Arc::new(BusIo::new("src", PortDir::In, PortKind::Byte, ring.clone())));
        pool.register_io(Arc::new(BusIo::new("dst", PortDir::Out, PortKind::Byte, ring)));
        pool
    }

    #[test]
    fn chain_keeps_order_and_edge_ports() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = pool(&live);
        let pipe = pool
            .new_pipeline(Some("src"), &["e1", "e2", "e3"], Some("dst"))
            .unwrap();
        assert_eq!(pipe.element_tags(), &["e1", "e2", "e3"]);
        assert_eq!(pipe.port_tag("e1", PortDir::In).unwrap().as_deref(), Some("src"));
        assert_eq!(pipe.port_tag("e3", PortDir::Out).unwrap().as_deref(), Some("dst"));
        assert_eq!(pipe.port_tag("e2", PortDir::In).unwrap().as_deref(), Some("link"));
        assert_eq!(live.load(Ordering::SeqCst), 6);
        drop(pipe);
        assert_eq!(live.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unknown_name_leaves_nothing_behind() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = pool(&live);
        let err = pool
            .new_pipeline(Some("src"), &["e1", "missing", "e3"], Some("dst"))
            .unwrap_err();
        assert!(matches!(err, SpeakerError::NotFound(_)));
        assert_eq!(live.load(Ordering::SeqCst), 3);

        // An in I/O registered only for output does not match.
        let err = pool.new_pipeline(Some("dst"), &["e1"], None).unwrap_err();
        assert!(matches!(err, SpeakerError::NotFound(_)));
        assert_eq!(live.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_chain_is_rejected() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = pool(&live);
        assert!(matches!(
            pool.new_pipeline(None, &[], None),
            Err(SpeakerError::InvalidArgument(_))
        ));
        assert!(matches!(pool.new_element("nope"), Err(SpeakerError::NotFound(_))));
    }

    #[test]
    fn unregister_drops_every_prototype_with_the_tag() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(&live);
        pool.register_element(Box::new(Probe::new("e1", &live)));
        assert_eq!(pool.unregister_element("e1"), 2);
        assert_eq!(pool.unregister_element("e1"), 0);
        assert_eq!(pool.element_tags(), vec!["e2", "e3"]);
        assert_eq!(live.load(Ordering::SeqCst), 2);
    }
}
