//! Audio event detection element
//!
//! Accumulates S16LE mono 16 kHz audio into inference windows of the length
//! the model expects and classifies each window. Windows advance by
//! `sliding-window` seconds, so with a slide shorter than the model window
//! consecutive windows overlap.
//!
//! Audio passes through unchanged. Labels scoring at least `threshold` are
//! posted as `gva-inference-result` element messages:
//!
//! ```text
//! gva-inference-result
//!   timestamp: start of the window
//!   media: "audio"
//!   type: "detection"
//!   result: {"start_timestamp": .., "end_timestamp": .., "detections": [{"label": .., "confidence": ..}]}
//! ```
//!
//! # Pipeline Example
//! ```bash
//! gst-launch-1.0 \
//!     filesrc location=audio.wav ! decodebin ! audioresample ! audioconvert ! \
//!     audio/x-raw,channels=1,format=S16LE,rate=16000 ! audiomixer output-buffer-duration=100000000 ! \
//!     gvaaudiodetect model=<path-to-model> sliding-window=0.2 ! fakesink
//! ```
//!
//! The per-buffer sample count must divide the model window; a sliding
//! window that is not a multiple of it is rounded down with a warning.

use super::model::{self, SharedClassifier};
use super::window::{AudioFrame, AudioWindow, SAMPLE_AUDIO_RATE};
use crate::common::{create_inference_message, DEFAULT_DEVICE};
use crate::inference::InferenceError;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::glib::ParamSpecBuilderExt;
use gstreamer::prelude::*;
use gstreamer::subclass::prelude::*;
use gstreamer_audio as gst_audio;
use gstreamer_base::subclass::prelude::*;
use gstreamer_base::subclass::BaseTransformMode;
use once_cell::sync::Lazy;
use serde_json::json;
use std::sync::Mutex;

static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "gvaaudiodetect",
        gst::DebugColorFlags::empty(),
        Some("GVA audio event detection"),
    )
});

const DEFAULT_SLIDING_WINDOW: f32 = 1.0;
const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
struct Settings {
    model: Option<String>,
    model_instance_id: Option<String>,
    device: String,
    sliding_window: f32,
    threshold: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: None,
            model_instance_id: None,
            device: DEFAULT_DEVICE.to_string(),
            sliding_window: DEFAULT_SLIDING_WINDOW,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

struct State {
    window: AudioWindow,
    classifier: SharedClassifier,
    checked: bool,
}

#[derive(Default)]
pub struct GvaAudioDetect {
    settings: Mutex<Settings>,
    state: Mutex<Option<State>>,
}

#[glib::object_subclass]
impl ObjectSubclass for GvaAudioDetect {
    const NAME: &'static str = "GstGvaAudioDetect";
    type Type = super::GvaAudioDetect;
    type ParentType = gstreamer_base::BaseTransform;
}

impl GvaAudioDetect {
    #[cfg(feature = "eim")]
    fn load_model(path: &str) -> Result<Box<dyn model::AudioClassifier>, InferenceError> {
        Ok(Box::new(model::EimAudioClassifier::new(path)?))
    }

    #[cfg(not(feature = "eim"))]
    fn load_model(_path: &str) -> Result<Box<dyn model::AudioClassifier>, InferenceError> {
        Err(InferenceError::Configuration(
            "built without an inference backend, enable the 'eim' feature".to_string(),
        ))
    }

    fn infer(&self, state: &State, frame: AudioFrame, threshold: f32) -> Result<(), InferenceError> {
        let samples: Vec<f32> = frame.samples.iter().map(|s| *s as f32 / 32768.0).collect();

        let now = std::time::Instant::now();
        let scores = state.classifier.lock().unwrap().classify(samples)?;
        gst::debug!(
            CAT,
            imp = self,
            "Window {} - {} classified in {} ms",
            gst::ClockTime::from_nseconds(frame.start_time),
            gst::ClockTime::from_nseconds(frame.end_time),
            now.elapsed().as_millis()
        );

        let mut detections: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(_, score)| *score >= threshold as f64)
            .collect();
        if detections.is_empty() {
            return Ok(());
        }
        detections.sort_by(|a, b| b.1.total_cmp(&a.1));

        let result = json!({
            "start_timestamp": frame.start_time,
            "end_timestamp": frame.end_time,
            "detections": detections
                .iter()
                .map(|(label, confidence)| json!({"label": label, "confidence": confidence}))
                .collect::<Vec<_>>(),
        });
        let s = create_inference_message(
            "audio",
            gst::ClockTime::from_nseconds(frame.start_time),
            "detection",
            result.to_string(),
        );
        let _ = self.obj().post_message(gst::message::Element::new(s));
        Ok(())
    }
}

impl ObjectImpl for GvaAudioDetect {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: Lazy<Vec<glib::ParamSpec>> = Lazy::new(|| {
            vec![
                glib::ParamSpecString::builder("model")
                    .nick("Model")
                    .blurb("Path to inference model file")
                    .build(),
                glib::ParamSpecString::builder("model-instance-id")
                    .nick("Model Instance Id")
                    .blurb("Identifier for the model instance. Elements with the same id share one model")
                    .build(),
                glib::ParamSpecString::builder("device")
                    .nick("Device")
                    .blurb("Target device for inference")
                    .default_value(Some(DEFAULT_DEVICE))
                    .build(),
                glib::ParamSpecFloat::builder("sliding-window")
                    .nick("Sliding window increment in seconds")
                    .blurb("Sliding window increment in seconds between consecutive inference windows")
                    .minimum(0.1)
                    .maximum(1.0)
                    .default_value(DEFAULT_SLIDING_WINDOW)
                    .mutable_playing()
                    .build(),
                glib::ParamSpecFloat::builder("threshold")
                    .nick("Threshold")
                    .blurb("Minimum confidence for a detection to be reported")
                    .minimum(0.0)
                    .maximum(1.0)
                    .default_value(DEFAULT_THRESHOLD)
                    .mutable_playing()
                    .build(),
            ]
        });
        PROPERTIES.as_ref()
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        let mut settings = self.settings.lock().unwrap();
        match pspec.name() {
            "model" => settings.model = value.get().expect("type checked upstream"),
            "model-instance-id" => {
                settings.model_instance_id = value.get().expect("type checked upstream")
            }
            "device" => {
                settings.device = value
                    .get::<Option<String>>()
                    .expect("type checked upstream")
                    .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
            }
            "sliding-window" => {
                settings.sliding_window = value.get().expect("type checked upstream");
                if let Some(state) = self.state.lock().unwrap().as_mut() {
                    state.window.set_slide_length(settings.sliding_window as f64);
                    state.checked = false;
                }
            }
            "threshold" => settings.threshold = value.get().expect("type checked upstream"),
            _ => unimplemented!(),
        }
        gst::debug!(CAT, imp = self, "Set property '{}'", pspec.name());
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let settings = self.settings.lock().unwrap();
        match pspec.name() {
            "model" => settings.model.to_value(),
            "model-instance-id" => settings.model_instance_id.to_value(),
            "device" => settings.device.to_value(),
            "sliding-window" => settings.sliding_window.to_value(),
            "threshold" => settings.threshold.to_value(),
            _ => unimplemented!(),
        }
    }
}

impl GstObjectImpl for GvaAudioDetect {}

impl ElementImpl for GvaAudioDetect {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: Lazy<gst::subclass::ElementMetadata> = Lazy::new(|| {
            gst::subclass::ElementMetadata::new(
                "Audio event detection",
                "Filter/Audio/AI",
                "Detects audio events in sliding windows of the stream",
                "GVA plugin developers",
            )
        });
        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: Lazy<Vec<gst::PadTemplate>> = Lazy::new(|| {
            let caps = gst_audio::AudioCapsBuilder::new_interleaved()
                .format(gst_audio::AudioFormat::S16le)
                .rate(SAMPLE_AUDIO_RATE as i32)
                .channels(1)
                .build();

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
}

impl BaseTransformImpl for GvaAudioDetect {
    const MODE: BaseTransformMode = BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = true;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = true;

    fn start(&self) -> Result<(), gst::ErrorMessage> {
        let settings = self.settings.lock().unwrap().clone();
        let Some(path) = settings.model.clone() else {
            return Err(gst::error_msg!(
                gst::LibraryError::Settings,
                ["'model' must be set"]
            ));
        };

        let models = super::models()
            .ok_or_else(|| gst::error_msg!(gst::LibraryError::Init, ["gva plugin was not initialized"]))?;
        let classifier = models
            .acquire(settings.model_instance_id.as_deref(), || Self::load_model(&path))
            .map_err(|e| gst::error_msg!(gst::LibraryError::Init, ["{}", e]))?;
        let sample_length = classifier.lock().unwrap().sample_length();
        let window = AudioWindow::new(sample_length, settings.sliding_window as f64)
            .map_err(|e| gst::error_msg!(gst::LibraryError::Settings, ["{}", e]))?;

        gst::info!(
            CAT,
            imp = self,
            "Started with {} on {}, window of {} samples sliding by {}",
            path,
            settings.device,
            sample_length,
            window.slide_samples()
        );
        *self.state.lock().unwrap() = Some(State {
            window,
            classifier,
            checked: false,
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        let _ = self.state.lock().unwrap().take();
        gst::info!(CAT, imp = self, "Stopped");
        Ok(())
    }

    fn sink_event(&self, event: gst::Event) -> bool {
        if event.type_() == gst::EventType::FlushStop {
            if let Some(state) = self.state.lock().unwrap().as_mut() {
                state.window.clear();
            }
        }
        self.parent_sink_event(event)
    }

    fn transform_ip_passthrough(&self, buf: &gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        let map = buf.map_readable().map_err(|_| {
            gst::error!(CAT, imp = self, "Failed to map input buffer readable");
            gst::FlowError::Error
        })?;
        let samples: Vec<i16> = map
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        drop(map);

        let threshold = self.settings.lock().unwrap().threshold;
        let mut guard = self.state.lock().unwrap();
        let state = guard.as_mut().ok_or(gst::FlowError::Flushing)?;

        let mut adjusted_window = None;
        if !state.checked {
            match state.window.adjust_sliding_length(samples.len()) {
                Ok(Some(adjusted)) => {
                    gst::element_warning!(
                        self.obj(),
                        gst::ResourceError::Settings,
                        ["sliding-window adjusted"],
                        ["New sliding-window value {} sec", adjusted]
                    );
                    adjusted_window = Some(adjusted as f32);
                }
                Ok(None) => {}
                Err(e) => {
                    gst::element_imp_error!(self, gst::CoreError::Failed, ["{}", e]);
                    return Err(gst::FlowError::Error);
                }
            }
            state.checked = true;
        }

        let start_time = buf.pts().map_or(0, |pts| pts.nseconds());
        let result = state
            .window
            .add_samples(&samples, start_time)
            .and_then(|()| {
                if !state.window.ready_to_infer() {
                    return Ok(());
                }
                let frame = state.window.fill_audio_frame()?;
                self.infer(state, frame, threshold)
            });
        drop(guard);

        if let Some(adjusted) = adjusted_window {
            self.settings.lock().unwrap().sliding_window = adjusted;
        }

        result.map(|()| gst::FlowSuccess::Ok).map_err(|e| {
            gst::element_imp_error!(self, gst::CoreError::Failed, ["Audio inference failed: {}", e]);
            gst::FlowError::Error
        })
    }
}
