//! Object classification element
//!
//! Runs a classification model on the regions of interest attached by an
//! upstream `gvadetect` (or on the full frame with
//! `inference-region=full-frame`). The best label above `threshold` is
//! added as a `classification` param to the ROI it was computed for.
//!
//! With a tracker upstream, `reclassify-interval` limits how often a
//! tracked object is classified again: 0 classifies every object once, 1
//! classifies on every frame and N every Nth frame. In between, the last
//! results of the object are copied onto its ROI with a `frames_ago` field.
//!
//! # Pipeline Example
//! ```bash
//! gst-launch-1.0 \
//!     filesrc location=video.mp4 ! decodebin ! videoconvert ! \
//!     video/x-raw,format=RGB ! \
//!     gvadetect model=<detection-model> ! \
//!     gvaclassify model=<classification-model> object-class=vehicle reclassify-interval=10 ! \
//!     queue ! videoconvert ! autovideosink
//! ```

use crate::common::{
    create_common_properties, ElementKind, InferenceRegion, DEFAULT_RECLASSIFY_INTERVAL,
};
use crate::video::{video_caps, VideoInference};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::glib::ParamSpecBuilderExt;
use gstreamer::prelude::*;
use gstreamer::subclass::prelude::*;
use gstreamer_base as gst_base;
use gstreamer_base::subclass::prelude::*;
use gstreamer_base::subclass::BaseTransformMode;
use once_cell::sync::Lazy;

static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "gvaclassify",
        gst::DebugColorFlags::empty(),
        Some("GVA object classification"),
    )
});

pub struct GvaClassify {
    inference: VideoInference,
}

impl Default for GvaClassify {
    fn default() -> Self {
        Self {
            inference: VideoInference::new(ElementKind::Classify, *CAT),
        }
    }
}

impl GvaClassify {
    fn base(&self) -> gst_base::BaseTransform {
        self.obj().clone().upcast()
    }
}

#[glib::object_subclass]
impl ObjectSubclass for GvaClassify {
    const NAME: &'static str = "GstGvaClassify";
    type Type = super::GvaClassify;
    type ParentType = gst_base::BaseTransform;
}

impl ObjectImpl for GvaClassify {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: Lazy<Vec<glib::ParamSpec>> =
            Lazy::new(|| {
                let mut properties = create_common_properties(InferenceRegion::RoiList);
                properties.push(
                    glib::ParamSpecUInt::builder("reclassify-interval")
                        .nick("Reclassify Interval")
                        .blurb(
                            "How often to reclassify tracked objects. Only valid with inference-region=roi-list. \
                             0 classifies once, 1 on every frame, N on every Nth frame",
                        )
                        .minimum(0)
                        .maximum(u32::MAX)
                        .default_value(DEFAULT_RECLASSIFY_INTERVAL)
                        .build(),
                );
                properties
            });
        PROPERTIES.as_ref()
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        self.inference.set_property(&self.base(), value, pspec);
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        self.inference.property(pspec)
    }
}

impl GstObjectImpl for GvaClassify {}

impl ElementImpl for GvaClassify {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: Lazy<gst::subclass::ElementMetadata> = Lazy::new(|| {
            gst::subclass::ElementMetadata::new(
                "Object classification",
                "Filter/Video/AI",
                "Performs object classification on regions of interest and attaches the results to them",
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

impl BaseTransformImpl for GvaClassify {
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
