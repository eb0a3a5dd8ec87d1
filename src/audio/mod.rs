use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use once_cell::sync::OnceCell;
use std::sync::Arc;

mod imp;
pub mod model;
pub mod window;

pub use model::AudioModels;
pub use window::{AudioFrame, AudioWindow, SAMPLE_AUDIO_RATE};

static MODELS: OnceCell<Arc<AudioModels>> = OnceCell::new();

/// Hands the model table created at plugin load to the audio elements.
pub fn install_models(models: Arc<AudioModels>) {
    if MODELS.set(models).is_err() {
        gst::warning!(crate::common::CAT, "Audio model table is already installed");
    }
}

fn models() -> Option<Arc<AudioModels>> {
    MODELS.get().cloned()
}

glib::wrapper! {
    pub struct GvaAudioDetect(ObjectSubclass<imp::GvaAudioDetect>)
        @extends gstreamer_base::BaseTransform, gst::Element, gst::Object;
}

// GStreamer elements need to be thread-safe. For the private implementation
// this is automatically enforced but for the public wrapper type we need
// to specify this manually.
unsafe impl Send for GvaAudioDetect {}
unsafe impl Sync for GvaAudioDetect {}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "gvaaudiodetect",
        gst::Rank::NONE,
        GvaAudioDetect::static_type(),
    )
}
