//! Object detection element
//!
//! Runs a detection model on every frame (or on every region of interest
//! with `inference-region=roi-list`) and attaches one
//! `GstVideoRegionOfInterestMeta` per detected object. Each ROI carries a
//! `detection` param with `confidence`, `label_id` and the box normalized
//! to the frame size.
//!
//! Results are also posted on the bus as `gva-inference-result` element
//! messages with `type=detection`.
//!
//! # Pipeline Example
//! ```bash
//! gst-launch-1.0 \
//!     filesrc location=video.mp4 ! decodebin ! videoconvert ! \
//!     video/x-raw,format=RGB ! \
//!     gvadetect model=<path-to-model> model-instance-id=det0 nireq=2 ! \
//!     queue ! videoconvert ! autovideosink
//! ```
//!
//! Elements with the same `model-instance-id` share one loaded model and
//! one scheduler; only the first one needs `model` set.

use crate::common::{create_common_properties, ElementKind, InferenceRegion};
use crate::video::{video_caps, VideoInference};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer::subclass::prelude::*;
use gstreamer_base as gst_base;
use gstreamer_base::subclass::prelude::*;
use gstreamer_base::subclass::BaseTransformMode;
use once_cell::sync::Lazy;

static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "gvadetect",
        gst::DebugColorFlags::empty(),
        Some("GVA object detection"),
    )
});

pub struct GvaDetect {
    inference: VideoInference,
}

impl Default for GvaDetect {
    fn default() -> Self {
        Self {
            inference: VideoInference::new(ElementKind::Detect, *CAT),
        }
    }
}

impl GvaDetect {
    fn base(&self) -> gst_base::BaseTransform {
        self.obj().clone().upcast()
    }
}

#[glib::object_subclass]
impl ObjectSubclass for GvaDetect {
    const NAME: &'static str = "GstGvaDetect";
    type Type = super::GvaDetect;
    type ParentType = gst_base::BaseTransform;
}

impl ObjectImpl for GvaDetect {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: Lazy<Vec<glib::ParamSpec>> =
            Lazy::new(|| create_common_properties(InferenceRegion::FullFrame));
        PROPERTIES.as_ref()
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        self.inference.set_property(&self.base(), value, pspec);
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        self.inference.property(pspec)
    }
}

impl GstObjectImpl for GvaDetect {}

impl ElementImpl for GvaDetect {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: Lazy<gst::subclass::ElementMetadata> = Lazy::new(|| {
            gst::subclass::ElementMetadata::new(
                "Object detection",
                "Filter/Video/AI",
                "Performs object detection and attaches regions of interest to video frames",
                "GVA plugin developers",
            )
        });
        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: Lazy<Vec<gst::PadTemplate>> = Lazy::new(|| {
            let caps = video_caps();
            vec![
                gst::PadTemplate::new(
                    "src",
                    gst::PadDirection::Src,
                    gst::PadPresence::Always,
                    &caps,
                )
                .unwrap(),
                gst::PadTemplate::new(
                    "sink",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Always,
                    &caps,
                )
                .unwrap(),
            ]
        });
        PAD_TEMPLATES.as_ref()
    }

    fn change_state(
        &self,
        transition: gst::StateChange,
    ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
        gst::trace!(CAT, imp = self, "Changing state {:?}", transition);
        self.inference.handle_state_change(transition);
        self.parent_change_state(transition)
    }
}

impl BaseTransformImpl for GvaDetect {
    const MODE: BaseTransformMode = BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = true;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = true;

    fn start(&self) -> Result<(), gst::ErrorMessage> {
        self.inference.start(&self.base())
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        self.inference.stop(&self.base())
    }

    fn set_caps(&self, incaps: &gst::Caps, _outcaps: &gst::Caps) -> Result<(), gst::LoggableError> {
        gst::debug!(CAT, imp = self, "Set caps {}", incaps);
        self.inference.set_caps(&self.base(), incaps)
    }

    fn sink_event(&self, event: gst::Event) -> bool {
        self.inference.handle_event(&self.base(), &event);
        self.parent_sink_event(event)
    }

    fn transform_ip_passthrough(&self, buf: &gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        self.inference.transform(&self.base(), buf)
    }
}
