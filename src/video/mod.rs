mod base;
mod sink;

pub use base::VideoInference;
pub use sink::ElementSink;

use crate::common::{InferenceSettings, CAT};
use crate::inference::{InferenceEngine, InferenceError, InferenceRegistry, MemoryType};
use gstreamer as gst;
use gstreamer_video as gst_video;
use once_cell::sync::OnceCell;
use std::sync::Arc;

static REGISTRY: OnceCell<Arc<InferenceRegistry>> = OnceCell::new();

/// Hands the registry created at plugin load to the video elements, which
/// take a reference to it when they start.
pub fn install_registry(registry: Arc<InferenceRegistry>) {
    if REGISTRY.set(registry).is_err() {
        gst::warning!(CAT, "Inference registry is already installed");
    }
}

pub(crate) fn registry() -> Option<Arc<InferenceRegistry>> {
    REGISTRY.get().cloned()
}

#[cfg(feature = "eim")]
pub fn create_engine(
    settings: &InferenceSettings,
    _info: &gst_video::VideoInfo,
    memory: MemoryType,
) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
    if memory != MemoryType::System {
        return Err(InferenceError::Configuration(format!(
            "EIM models read system memory only, caps negotiated {:?} memory",
            memory
        )));
    }
    let engine = crate::inference::eim::EimEngine::new(settings)?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "eim"))]
pub fn create_engine(
    _settings: &InferenceSettings,
    _info: &gst_video::VideoInfo,
    _memory: MemoryType,
) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
    Err(InferenceError::Configuration(
        "built without an inference backend, enable the 'eim' feature".to_string(),
    ))
}

/// Video caps accepted by the inference elements.
pub fn video_caps() -> gstreamer::Caps {
    gst_video::VideoCapsBuilder::new()
        .format_list([
            gst_video::VideoFormat::Rgb,
            gst_video::VideoFormat::Bgr,
            gst_video::VideoFormat::Rgbx,
            gst_video::VideoFormat::Bgrx,
            gst_video::VideoFormat::Rgba,
            gst_video::VideoFormat::Bgra,
        ])
        .build()
}
