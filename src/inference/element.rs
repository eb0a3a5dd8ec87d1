use super::engine::CapsFeature;
use super::frame::RegionOfInterest;
use super::history::ClassificationHistory;
use super::post_process::{self, PostProcessor};
use crate::common::{ElementKind, InferenceSettings};
use gstreamer as gst;
use gstreamer_video as gst_video;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Downstream side of an element, where completed buffers are pushed.
pub trait OutputSink: Send + Sync {
    fn name(&self) -> String;

    /// Whether downstream is currently buffering heavily and should not
    /// receive more buffers.
    fn is_blocked(&self) -> bool;

    /// Whether the element was stopped; buffers for stopped elements are dropped.
    fn is_stopped(&self) -> bool;

    fn push(&self, buffer: gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError>;

    fn post_message(&self, _structure: gst::Structure) {}
}

/// Additional per-region predicate applied in ROI-list mode.
pub trait RoiFilter: Send + Sync {
    fn is_inference_needed(&self, frame_num: u64, roi: &RegionOfInterest) -> bool;
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub info: gst_video::VideoInfo,
    pub caps_feature: CapsFeature,
}

/// The scheduler's view of one video inference element
///
/// Elements own their handle and hand it to the registry and scheduler;
/// everything the scheduler needs from the element (configuration, video
/// geometry, the downstream sink, post-processing) is reachable from here.
pub struct ElementHandle {
    name: String,
    kind: ElementKind,
    settings: Mutex<InferenceSettings>,
    video: Mutex<Option<VideoConfig>>,
    skipped_frames: AtomicU32,
    frame_num: AtomicU64,
    sink: Arc<dyn OutputSink>,
    custom_post_processor: Option<Arc<dyn PostProcessor>>,
    post_processor: Mutex<Arc<dyn PostProcessor>>,
    roi_filter: Option<Arc<dyn RoiFilter>>,
    history: Option<Arc<ClassificationHistory>>,
}

impl fmt::Debug for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl ElementHandle {
    pub fn builder(name: &str, sink: Arc<dyn OutputSink>) -> ElementHandleBuilder {
        ElementHandleBuilder {
            name: name.to_string(),
            kind: ElementKind::Detect,
            settings: None,
            sink,
            post_processor: None,
            roi_filter: None,
            history: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn settings(&self) -> InferenceSettings {
        self.settings.lock().unwrap().clone()
    }

    pub fn update_settings<F: FnOnce(&mut InferenceSettings)>(&self, f: F) {
        let mut settings = self.settings.lock().unwrap();
        f(&mut settings);
    }

    /// Takes over the configuration of the master element of a shared instance.
    pub fn inherit_from(&self, master: &ElementHandle) {
        let master_settings = master.settings();
        self.update_settings(|s| s.inherit_from(&master_settings));
        self.refresh_post_processor();
    }

    /// Rebuilds the default post-processor from the current settings.
    pub fn refresh_post_processor(&self) {
        let pp = post_process::create(self.kind, &self.settings());
        *self.post_processor.lock().unwrap() = pp;
    }

    pub fn post_processor(&self) -> Arc<dyn PostProcessor> {
        match &self.custom_post_processor {
            Some(pp) => pp.clone(),
            None => self.post_processor.lock().unwrap().clone(),
        }
    }

    pub fn set_video(&self, info: gst_video::VideoInfo, caps_feature: CapsFeature) {
        *self.video.lock().unwrap() = Some(VideoConfig { info, caps_feature });
    }

    pub fn video(&self) -> Option<VideoConfig> {
        self.video.lock().unwrap().clone()
    }

    pub fn caps_feature(&self) -> CapsFeature {
        self.video
            .lock()
            .unwrap()
            .as_ref()
            .map(|v| v.caps_feature)
            .unwrap_or_default()
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    pub fn roi_filter(&self) -> Option<&Arc<dyn RoiFilter>> {
        self.roi_filter.as_ref()
    }

    pub fn history(&self) -> Option<&Arc<ClassificationHistory>> {
        self.history.as_ref()
    }

    /// Counts a new buffer against `inference-interval` and returns whether
    /// inference is due for it.
    pub(crate) fn interval_elapsed(&self, interval: u32) -> bool {
        let previous = self
            .skipped_frames
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_add(1)))
            .unwrap_or(u32::MAX);
        previous.saturating_add(1) >= interval
    }

    pub(crate) fn reset_interval(&self) {
        self.skipped_frames.store(0, Ordering::Release);
    }

    /// Returns the number of the current buffer and advances the counter.
    pub(crate) fn next_frame_num(&self) -> u64 {
        self.frame_num.fetch_add(1, Ordering::AcqRel)
    }

    pub fn frame_num(&self) -> u64 {
        self.frame_num.load(Ordering::Acquire)
    }
}

pub struct ElementHandleBuilder {
    name: String,
    kind: ElementKind,
    settings: Option<InferenceSettings>,
    sink: Arc<dyn OutputSink>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    roi_filter: Option<Arc<dyn RoiFilter>>,
    history: Option<Arc<ClassificationHistory>>,
}

impl ElementHandleBuilder {
    pub fn kind(mut self, kind: ElementKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn settings(mut self, settings: InferenceSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Replaces the post-processor derived from the element kind.
    pub fn post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    pub fn roi_filter(mut self, roi_filter: Arc<dyn RoiFilter>) -> Self {
        self.roi_filter = Some(roi_filter);
        self
    }

    /// Sets the classification history, which also filters regions.
    pub fn history(mut self, history: Arc<ClassificationHistory>) -> Self {
        if self.roi_filter.is_none() {
            self.roi_filter = Some(history.clone());
        }
        self.history = Some(history);
        self
    }

    pub fn build(self) -> Arc<ElementHandle> {
        let settings = self
            .settings
            .unwrap_or_else(|| InferenceSettings::for_kind(self.kind));
        let post_processor = post_process::create(self.kind, &settings);
        Arc::new(ElementHandle {
            name: self.name,
            kind: self.kind,
            settings: Mutex::new(settings),
            video: Mutex::new(None),
            // First buffer always runs inference.
            skipped_frames: AtomicU32::new(u32::MAX - 1),
            frame_num: AtomicU64::new(0),
            sink: self.sink,
            custom_post_processor: self.post_processor,
            post_processor: Mutex::new(post_processor),
            roi_filter: self.roi_filter,
            history: self.history,
        })
    }
}

/// Sink discarding everything, for handles that never push.
#[cfg(test)]
pub(crate) struct NullSink;

#[cfg(test)]
impl OutputSink for NullSink {
    fn name(&self) -> String {
        "null".to_string()
    }

    fn is_blocked(&self) -> bool {
        false
    }

    fn is_stopped(&self) -> bool {
        false
    }

    fn push(&self, _buffer: gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        Ok(gst::FlowSuccess::Ok)
    }
}
