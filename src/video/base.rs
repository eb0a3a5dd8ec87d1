//! Behavior shared by `gvadetect` and `gvaclassify`
//!
//! Both elements are in-place `BaseTransform`s. Buffers needing inference
//! are handed to the shared scheduler, which pushes them on the src pad
//! once their results are in; the base class is told the buffer was
//! dropped.

use super::sink::ElementSink;
use crate::common::{ElementKind, InferenceSettings, PropertyChange};
use crate::inference::{
    CapsFeature, ClassificationHistory, ElementHandle, FrameDisposition, InferenceRegistry, InferenceScheduler,
};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_base as gst_base;
use gstreamer_video as gst_video;
use std::sync::{Arc, Mutex};

struct State {
    registry: Arc<InferenceRegistry>,
    handle: Arc<ElementHandle>,
    sink: Arc<ElementSink>,
    scheduler: Option<Arc<InferenceScheduler>>,
}

pub struct VideoInference {
    kind: ElementKind,
    cat: gst::DebugCategory,
    settings: Mutex<InferenceSettings>,
    state: Mutex<Option<State>>,
}

impl VideoInference {
    pub fn new(kind: ElementKind, cat: gst::DebugCategory) -> Self {
        Self {
            kind,
            cat,
            settings: Mutex::new(InferenceSettings::for_kind(kind)),
            state: Mutex::new(None),
        }
    }

    pub fn set_property(&self, obj: &gst_base::BaseTransform, value: &glib::Value, pspec: &glib::ParamSpec) {
        let state = self.state.lock().unwrap();
        let running = state.is_some();
        let change = self.settings.lock().unwrap().set_property(value, pspec, running);

        match change {
            PropertyChange::Applied => {
                gst::debug!(self.cat, obj = obj, "Set property '{}'", pspec.name());
                if let Some(state) = state.as_ref() {
                    state.handle.update_settings(|s| {
                        s.set_property(value, pspec, true);
                    });
                }
            }
            PropertyChange::Rejected => gst::warning!(
                self.cat,
                obj = obj,
                "'{}' cannot be changed while the element is running",
                pspec.name()
            ),
            PropertyChange::IgnoredWhileRunning => gst::warning!(
                self.cat,
                obj = obj,
                "'{}' change while running is ignored until the element restarts",
                pspec.name()
            ),
        }
    }

    pub fn property(&self, pspec: &glib::ParamSpec) -> glib::Value {
        if let Some(state) = self.state.lock().unwrap().as_ref() {
            return state.handle.settings().property(pspec);
        }
        self.settings.lock().unwrap().property(pspec)
    }

    pub fn start(&self, obj: &gst_base::BaseTransform) -> Result<(), gst::ErrorMessage> {
        let settings = self.settings.lock().unwrap().clone();
        settings.check(self.kind).map_err(|e| {
            gst::error_msg!(gst::LibraryError::Settings, ["{}", e])
        })?;
        let registry = super::registry()
            .ok_or_else(|| gst::error_msg!(gst::LibraryError::Init, ["gva plugin was not initialized"]))?;

        let sink = Arc::new(ElementSink::new(obj));
        let mut builder = ElementHandle::builder(&obj.name(), sink.clone())
            .kind(self.kind)
            .settings(settings.clone());
        if self.kind == ElementKind::Classify {
            builder = builder.history(Arc::new(ClassificationHistory::new(settings.reclassify_interval)));
        }
        let handle = builder.build();
        registry.register_element(&handle);

        gst::info!(
            self.cat,
            obj = obj,
            "Started with model {:?}, instance {:?}",
            settings.model,
            settings.model_instance_id
        );
        *self.state.lock().unwrap() = Some(State {
            registry,
            handle,
            sink,
            scheduler: None,
        });
        Ok(())
    }

    pub fn stop(&self, obj: &gst_base::BaseTransform) -> Result<(), gst::ErrorMessage> {
        if let Some(state) = self.state.lock().unwrap().take() {
            state.sink.set_stopped(true);
            state.registry.release_instance(&state.handle);
        }
        gst::info!(self.cat, obj = obj, "Stopped");
        Ok(())
    }

    pub fn set_caps(&self, obj: &gst_base::BaseTransform, caps: &gst::Caps) -> Result<(), gst::LoggableError> {
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| gst::loggable_error!(self.cat, "Failed to parse caps {}", caps))?;
        let feature = CapsFeature::from_caps(caps);

        let mut guard = self.state.lock().unwrap();
        let state = guard
            .as_mut()
            .ok_or_else(|| gst::loggable_error!(self.cat, "Caps set before the element started"))?;
        state.handle.set_video(info, feature);

        let scheduler = state.registry.acquire_instance(&state.handle).map_err(|e| {
            gst::element_error!(obj, gst::LibraryError::Init, ["{}", e]);
            gst::loggable_error!(self.cat, "Failed to acquire inference instance: {}", e)
        })?;
        gst::debug!(
            self.cat,
            obj = obj,
            "Using instance {} with {} memory",
            InferenceRegistry::instance_key(&state.handle),
            feature.as_str()
        );
        state.scheduler = Some(scheduler);
        Ok(())
    }

    fn current(&self) -> Option<(Arc<ElementHandle>, Arc<InferenceScheduler>)> {
        let state = self.state.lock().unwrap();
        let state = state.as_ref()?;
        Some((state.handle.clone(), state.scheduler.clone()?))
    }

    pub fn transform(&self, obj: &gst_base::BaseTransform, buf: &gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        let Some((handle, scheduler)) = self.current() else {
            gst::element_error!(obj, gst::CoreError::Negotiation, ["No inference instance, caps not negotiated"]);
            return Err(gst::FlowError::NotNegotiated);
        };

        match scheduler.transform_frame(&handle, buf) {
            Ok(FrameDisposition::Passthrough) => Ok(gst::FlowSuccess::Ok),
            Ok(FrameDisposition::Queued) => Ok(gst_base::BASE_TRANSFORM_FLOW_DROPPED),
            Err(e) => {
                gst::element_error!(obj, gst::StreamError::Failed, ["Inference failed: {}", e]);
                Err(gst::FlowError::Error)
            }
        }
    }

    /// Drains the scheduler on EOS and at the end of a flush.
    pub fn handle_event(&self, obj: &gst_base::BaseTransform, event: &gst::Event) {
        if !matches!(event.type_(), gst::EventType::Eos | gst::EventType::FlushStop) {
            return;
        }
        if let Some((_, scheduler)) = self.current() {
            gst::debug!(self.cat, obj = obj, "Flushing inference on {:?}", event.type_());
            scheduler.flush_inference();
        }
    }

    pub fn handle_state_change(&self, transition: gst::StateChange) {
        if transition == gst::StateChange::PausedToPlaying {
            if let Some((_, scheduler)) = self.current() {
                scheduler.flush_outputs();
            }
        }
    }
}
