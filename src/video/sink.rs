use crate::inference::OutputSink;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_base as gst_base;
use gstreamer_base::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Src pad of a video inference element, as seen by the scheduler.
///
/// Holds a weak reference so queued buffers never keep a removed element
/// alive.
pub struct ElementSink {
    name: String,
    element: glib::WeakRef<gst_base::BaseTransform>,
    stopped: AtomicBool,
}

impl ElementSink {
    pub fn new(element: &gst_base::BaseTransform) -> Self {
        Self {
            name: element.name().to_string(),
            element: element.downgrade(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }
}

impl OutputSink for ElementSink {
    fn name(&self) -> String {
        self.name.clone()
    }

    /// Downstream is blocked when the peer is a paused `queue` that already
    /// holds buffers.
    fn is_blocked(&self) -> bool {
        let Some(element) = self.element.upgrade() else {
            return false;
        };
        let Some(peer) = element.src_pad().peer() else {
            return false;
        };
        let Some(queue) = peer.parent_element() else {
            return false;
        };
        let is_queue = queue
            .factory()
            .is_some_and(|f| f.name() == "queue");
        if !is_queue || queue.find_property("current-level-buffers").is_none() {
            return false;
        }

        let level = queue.property::<u32>("current-level-buffers");
        level > 1 && queue.current_state() == gst::State::Paused
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.element.upgrade().is_none()
    }

    fn push(&self, buffer: gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        let element = self.element.upgrade().ok_or(gst::FlowError::Flushing)?;
        element.src_pad().push(buffer)
    }

    fn post_message(&self, structure: gst::Structure) {
        if let Some(element) = self.element.upgrade() {
            let _ = element.post_message(gst::message::Element::builder(structure).src(&element).build());
        }
    }
}
