//! GStreamer video and audio analytics elements
//!
//! - `gvadetect`: object detection on full frames or regions of interest
//! - `gvaclassify`: classification of regions of interest
//! - `gvaaudiodetect`: audio event detection over a sliding window
//!
//! Video elements sharing a `model-instance-id` share one loaded model and
//! one inference scheduler, see [`inference`].

use gstreamer as gst;
use gstreamer::glib;
use std::sync::Arc;

pub mod audio;
mod classify;
pub mod common;
mod detect;
pub mod inference;
pub mod video;

use audio::AudioModels;
use inference::InferenceRegistry;

fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    video::install_registry(Arc::new(InferenceRegistry::new(Box::new(video::create_engine))));
    audio::install_models(Arc::new(AudioModels::default()));

    detect::register(plugin)?;
    classify::register(plugin)?;
    audio::register(plugin)?;
    Ok(())
}

gst::plugin_define!(
    gva,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    env!("CARGO_PKG_VERSION"),
    "MIT/X11",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    "https://github.com/edgeimpulse/gst-plugins-edgeimpulse",
    env!("BUILD_REL_DATE")
);
