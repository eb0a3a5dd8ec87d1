//! Sharing of model instances between elements
//!
//! Elements using the same `model-instance-id` with the same memory type
//! share one engine and one scheduler. The registry is created once when
//! the plugin loads and handed to every element; elements register when
//! they start, acquire the shared scheduler once caps are known and
//! release it when they stop. The last element to leave destroys the
//! shared instance.

use super::element::ElementHandle;
use super::engine::{CapsFeature, InferenceEngine, MemoryType};
use super::error::InferenceError;
use super::scheduler::InferenceScheduler;
use crate::common::{InferenceSettings, CAT};
use gstreamer as gst;
use gstreamer_video as gst_video;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Builds the engine of a shared instance from the master configuration
/// for buffers in the given memory.
pub type EngineFactory = Box<
    dyn Fn(&InferenceSettings, &gst_video::VideoInfo, MemoryType) -> Result<Arc<dyn InferenceEngine>, InferenceError>
        + Send
        + Sync,
>;

/// Elements sharing one key and their common instance.
struct InferenceRefs {
    // Insertion ordered; the first element with a model is the master.
    refs: Vec<Arc<ElementHandle>>,
    scheduler: Option<Arc<InferenceScheduler>>,
    video_format: gst_video::VideoFormat,
    caps_feature: CapsFeature,
}

impl InferenceRefs {
    fn new() -> Self {
        Self {
            refs: Vec::new(),
            scheduler: None,
            video_format: gst_video::VideoFormat::Unknown,
            caps_feature: CapsFeature::Any,
        }
    }

    fn add(&mut self, element: &Arc<ElementHandle>) {
        if !self.refs.iter().any(|e| Arc::ptr_eq(e, element)) {
            self.refs.push(element.clone());
        }
        gst::info!(
            CAT,
            "<{}> registered, {} elements share the instance",
            element.name(),
            self.refs.len()
        );
    }

    fn check_format(&mut self, key: &str, format: gst_video::VideoFormat, caps_feature: CapsFeature) -> Result<(), InferenceError> {
        if self.video_format == gst_video::VideoFormat::Unknown {
            self.video_format = format;
        }
        if self.caps_feature == CapsFeature::Any {
            self.caps_feature = caps_feature;
        }
        if self.video_format != format || self.caps_feature != caps_feature {
            return Err(InferenceError::FormatMismatch {
                key: key.to_string(),
                accepted: format!("{:?}/{}", self.video_format, self.caps_feature.as_str()),
                requested: format!("{:?}/{}", format, caps_feature.as_str()),
            });
        }
        Ok(())
    }

    /// Propagates the master's configuration to every other element.
    fn init_existing_elements(&self, key: &str) -> Result<(), InferenceError> {
        let master = self
            .refs
            .iter()
            .find(|e| e.settings().has_model())
            .ok_or_else(|| InferenceError::NoMaster(key.to_string()))?;
        for element in &self.refs {
            if !Arc::ptr_eq(element, master) {
                element.inherit_from(master);
            }
        }
        Ok(())
    }
}

pub struct InferenceRegistry {
    factory: EngineFactory,
    pool: Mutex<HashMap<String, InferenceRefs>>,
}

impl InferenceRegistry {
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            factory,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Key of the instance an element belongs to: its model-instance-id,
    /// or its name when unset, together with the memory type of its caps.
    pub fn instance_key(element: &ElementHandle) -> String {
        let id = element
            .settings()
            .model_instance_id
            .unwrap_or_else(|| element.name().to_string());
        format!("{}_{}", id, element.caps_feature().as_str())
    }

    pub fn register_element(&self, element: &Arc<ElementHandle>) {
        let key = Self::instance_key(element);
        gst::info!(CAT, "<{}> key: {}", element.name(), key);
        let mut pool = self.pool.lock().unwrap();
        pool.entry(key).or_insert_with(InferenceRefs::new).add(element);
    }

    /// Returns the scheduler shared by every element with the same key
    ///
    /// All sharing elements must agree on video format and memory type.
    /// The first element with a model is the master; every other element
    /// takes over its configuration. The engine is created on first use.
    pub fn acquire_instance(&self, element: &Arc<ElementHandle>) -> Result<Arc<InferenceScheduler>, InferenceError> {
        let video = element
            .video()
            .ok_or(InferenceError::InvalidState("video caps were not negotiated"))?;
        let key = Self::instance_key(element);
        gst::info!(CAT, "<{}> acquiring instance {}", element.name(), key);

        let mut pool = self.pool.lock().unwrap();
        let refs = pool.entry(key.clone()).or_insert_with(InferenceRefs::new);
        refs.add(element);
        refs.check_format(&key, video.info.format(), video.caps_feature)?;
        refs.init_existing_elements(&key)?;

        if let Some(scheduler) = &refs.scheduler {
            return Ok(scheduler.clone());
        }

        let memory = video.caps_feature.memory_type();
        let engine = (self.factory)(&element.settings(), &video.info, memory)?;
        if engine.memory_type() != memory {
            return Err(InferenceError::Configuration(format!(
                "engine for '{}' reads {:?} memory but caps negotiated {}",
                key,
                engine.memory_type(),
                video.caps_feature.as_str()
            )));
        }
        let scheduler = InferenceScheduler::new(engine)?;
        refs.scheduler = Some(scheduler.clone());
        gst::info!(CAT, "Created inference instance {}", key);
        Ok(scheduler)
    }

    /// Removes the element from every instance it joined. Instances left
    /// without elements are destroyed.
    pub fn release_instance(&self, element: &Arc<ElementHandle>) {
        let mut pool = self.pool.lock().unwrap();
        pool.retain(|key, refs| {
            refs.refs.retain(|e| !Arc::ptr_eq(e, element));
            if refs.refs.is_empty() {
                gst::info!(CAT, "Releasing inference instance {}", key);
                false
            } else {
                true
            }
        });
    }

    /// Number of elements registered under `key`.
    pub fn refs(&self, key: &str) -> usize {
        self.pool
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |refs| refs.refs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().unwrap().is_empty()
    }
}
