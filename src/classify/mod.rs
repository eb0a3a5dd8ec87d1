use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;

mod imp;

glib::wrapper! {
    pub struct GvaClassify(ObjectSubclass<imp::GvaClassify>)
        @extends gstreamer_base::BaseTransform, gst::Element, gst::Object;
}

// GStreamer elements need to be thread-safe. For the private implementation
// this is automatically enforced but for the public wrapper type we need
// to specify this manually.
unsafe impl Send for GvaClassify {}
unsafe impl Sync for GvaClassify {}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "gvaclassify",
        gst::Rank::NONE,
        GvaClassify::static_type(),
    )
}
