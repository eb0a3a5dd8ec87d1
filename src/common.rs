use crate::inference::InferenceError;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::glib::ParamSpecBuilderExt;
use gstreamer::prelude::*;
use once_cell::sync::Lazy;
use std::str::FromStr;

pub static CAT: Lazy<gst::DebugCategory> = Lazy::new(|| {
    gst::DebugCategory::new(
        "gva",
        gst::DebugColorFlags::empty(),
        Some("GVA inference core"),
    )
});

pub const DEFAULT_DEVICE: &str = "CPU";
pub const DEFAULT_INFERENCE_INTERVAL: u32 = 1;
pub const DEFAULT_BATCH_SIZE: u32 = 0;
pub const DEFAULT_NIREQ: u32 = 0;
pub const DEFAULT_PRE_PROCESS_BACKEND: &str = "ie";
pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_RECLASSIFY_INTERVAL: u32 = 1;
pub const MAX_BATCH_SIZE: u32 = 1024;
pub const MAX_NIREQ: u32 = 1024;

/// Admission policy applied when new buffers enter the output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Admit buffers as they arrive.
    #[default]
    Throughput,
    /// Hold back buffers with later timestamps once too many are queued.
    Latency,
}

impl SchedulingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingPolicy::Throughput => "throughput",
            SchedulingPolicy::Latency => "latency",
        }
    }
}

impl FromStr for SchedulingPolicy {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "throughput" => Ok(SchedulingPolicy::Throughput),
            "latency" => Ok(SchedulingPolicy::Latency),
            other => Err(InferenceError::Configuration(format!(
                "unsupported scheduling-policy '{}', expected 'throughput' or 'latency'",
                other
            ))),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, glib::Enum)]
#[repr(u32)]
#[enum_type(name = "GstGvaInferenceRegion")]
pub enum InferenceRegion {
    #[enum_value(name = "Perform inference for full frame", nick = "full-frame")]
    FullFrame = 0,
    #[enum_value(name = "Perform inference for roi list", nick = "roi-list")]
    RoiList = 1,
}

/// Which kind of video element a configuration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Detect,
    Classify,
}

/// Outcome of setting a property on a running or stopped element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyChange {
    Applied,
    /// The property cannot be changed while the element is running.
    IgnoredWhileRunning,
    /// Model related properties cannot be changed while the element is running.
    Rejected,
}

/// Configuration of a video inference element
///
/// Mirrors the element properties. The scheduler reads it as a snapshot
/// when a buffer arrives; non-master elements sharing a model instance
/// receive the master's configuration through [`InferenceSettings::inherit_from`].
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSettings {
    pub model: Option<String>,
    pub model_proc: Option<String>,
    pub labels: Option<String>,
    pub model_instance_id: Option<String>,
    pub device: String,
    pub batch_size: u32,
    pub inference_interval: u32,
    pub no_block: bool,
    pub nireq: u32,
    pub cpu_streams: u32,
    pub gpu_streams: u32,
    pub ie_config: Option<String>,
    pub allocator_name: Option<String>,
    pub pre_process_backend: String,
    pub scheduling_policy: String,
    pub inference_region: InferenceRegion,
    pub object_class: Option<String>,
    pub threshold: f64,
    pub reclassify_interval: u32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            model: None,
            model_proc: None,
            labels: None,
            model_instance_id: None,
            device: DEFAULT_DEVICE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            inference_interval: DEFAULT_INFERENCE_INTERVAL,
            no_block: false,
            nireq: DEFAULT_NIREQ,
            cpu_streams: 0,
            gpu_streams: 0,
            ie_config: None,
            allocator_name: None,
            pre_process_backend: DEFAULT_PRE_PROCESS_BACKEND.to_string(),
            scheduling_policy: SchedulingPolicy::Throughput.as_str().to_string(),
            inference_region: InferenceRegion::FullFrame,
            object_class: None,
            threshold: DEFAULT_THRESHOLD,
            reclassify_interval: DEFAULT_RECLASSIFY_INTERVAL,
        }
    }
}

impl InferenceSettings {
    pub fn for_kind(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Detect => Self::default(),
            ElementKind::Classify => Self {
                inference_region: InferenceRegion::RoiList,
                ..Self::default()
            },
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.as_deref().is_some_and(|m| !m.is_empty())
    }

    /// Copies the configuration a master element dictates to the elements
    /// sharing its model instance. `model-instance-id` already matches.
    pub fn inherit_from(&mut self, master: &InferenceSettings) {
        self.model = master.model.clone();
        self.device = master.device.clone();
        self.model_proc = master.model_proc.clone();
        self.batch_size = master.batch_size;
        self.inference_interval = master.inference_interval;
        self.no_block = master.no_block;
        self.nireq = master.nireq;
        self.cpu_streams = master.cpu_streams;
        self.gpu_streams = master.gpu_streams;
        self.ie_config = master.ie_config.clone();
        self.allocator_name = master.allocator_name.clone();
        self.pre_process_backend = master.pre_process_backend.clone();
        self.object_class = master.object_class.clone();
        self.labels = master.labels.clone();
    }

    pub fn policy(&self) -> Result<SchedulingPolicy, InferenceError> {
        self.scheduling_policy.parse()
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1) as usize
    }

    pub fn effective_nireq(&self) -> usize {
        self.nireq.max(1) as usize
    }

    pub fn object_classes(&self) -> Vec<String> {
        split_list(self.object_class.as_deref())
    }

    pub fn label_list(&self) -> Vec<String> {
        split_list(self.labels.as_deref())
    }

    /// Validates the combination of properties before the element starts.
    pub fn check(&self, kind: ElementKind) -> Result<(), InferenceError> {
        if !self.has_model() && self.model_instance_id.is_none() {
            return Err(InferenceError::Configuration(
                "'model' or 'model-instance-id' must be set".to_string(),
            ));
        }
        if self.object_class.is_some() && self.inference_region == InferenceRegion::FullFrame {
            return Err(InferenceError::Configuration(
                "'object-class' cannot be used with 'inference-region=full-frame'".to_string(),
            ));
        }
        if kind == ElementKind::Classify
            && self.inference_region == InferenceRegion::FullFrame
            && self.reclassify_interval != DEFAULT_RECLASSIFY_INTERVAL
        {
            return Err(InferenceError::Configuration(
                "'reclassify-interval' cannot be used with 'inference-region=full-frame'".to_string(),
            ));
        }
        if self.inference_interval == 0 {
            return Err(InferenceError::Configuration(
                "'inference-interval' must be at least 1".to_string(),
            ));
        }
        self.policy()?;
        Ok(())
    }

    /// Applies a property value. While running only `object-class`,
    /// `inference-interval` and `no-block` can change.
    pub fn set_property(&mut self, value: &glib::Value, pspec: &glib::ParamSpec, running: bool) -> PropertyChange {
        let name = pspec.name();
        if running {
            match name {
                "object-class" | "inference-interval" | "no-block" => {}
                "model" | "model-proc" | "labels" => return PropertyChange::Rejected,
                _ => return PropertyChange::IgnoredWhileRunning,
            }
        }

        match name {
            "model" => self.model = value.get().unwrap_or(None),
            "model-proc" => self.model_proc = value.get().unwrap_or(None),
            "labels" => self.labels = value.get().unwrap_or(None),
            "model-instance-id" => self.model_instance_id = value.get().unwrap_or(None),
            "device" => {
                self.device = value
                    .get::<Option<String>>()
                    .unwrap_or(None)
                    .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
            }
            "batch-size" => self.batch_size = value.get().unwrap_or(DEFAULT_BATCH_SIZE),
            "inference-interval" => {
                self.inference_interval = value.get().unwrap_or(DEFAULT_INFERENCE_INTERVAL)
            }
            "no-block" => self.no_block = value.get().unwrap_or(false),
            "nireq" => self.nireq = value.get().unwrap_or(DEFAULT_NIREQ),
            "cpu-throughput-streams" => self.cpu_streams = value.get().unwrap_or(0),
            "gpu-throughput-streams" => self.gpu_streams = value.get().unwrap_or(0),
            "ie-config" => self.ie_config = value.get().unwrap_or(None),
            "allocator-name" => self.allocator_name = value.get().unwrap_or(None),
            "pre-process-backend" => {
                self.pre_process_backend = value
                    .get::<Option<String>>()
                    .unwrap_or(None)
                    .unwrap_or_else(|| DEFAULT_PRE_PROCESS_BACKEND.to_string())
            }
            "scheduling-policy" => {
                self.scheduling_policy = value
                    .get::<Option<String>>()
                    .unwrap_or(None)
                    .unwrap_or_else(|| SchedulingPolicy::Throughput.as_str().to_string())
            }
            "inference-region" => {
                self.inference_region = value.get().unwrap_or(InferenceRegion::FullFrame)
            }
            "object-class" => self.object_class = value.get().unwrap_or(None),
            "threshold" => self.threshold = value.get().unwrap_or(DEFAULT_THRESHOLD),
            "reclassify-interval" => {
                self.reclassify_interval = value.get().unwrap_or(DEFAULT_RECLASSIFY_INTERVAL)
            }
            _ => unimplemented!(),
        }
        PropertyChange::Applied
    }

    pub fn property(&self, pspec: &glib::ParamSpec) -> glib::Value {
        match pspec.name() {
            "model" => self.model.to_value(),
            "model-proc" => self.model_proc.to_value(),
            "labels" => self.labels.to_value(),
            "model-instance-id" => self.model_instance_id.to_value(),
            "device" => self.device.to_value(),
            "batch-size" => self.batch_size.to_value(),
            "inference-interval" => self.inference_interval.to_value(),
            "no-block" => self.no_block.to_value(),
            "nireq" => self.nireq.to_value(),
            "cpu-throughput-streams" => self.cpu_streams.to_value(),
            "gpu-throughput-streams" => self.gpu_streams.to_value(),
            "ie-config" => self.ie_config.to_value(),
            "allocator-name" => self.allocator_name.to_value(),
            "pre-process-backend" => self.pre_process_backend.to_value(),
            "scheduling-policy" => self.scheduling_policy.to_value(),
            "inference-region" => self.inference_region.to_value(),
            "object-class" => self.object_class.to_value(),
            "threshold" => self.threshold.to_value(),
            "reclassify-interval" => self.reclassify_interval.to_value(),
            _ => unimplemented!(),
        }
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Creates the properties shared by all video inference elements
///
/// # Example
///
/// ```bash
/// gst-launch-1.0 ... ! gvadetect model=/path/to/model.eim model-instance-id=det0 nireq=4 ! ...
/// ```
pub fn create_common_properties(default_region: InferenceRegion) -> Vec<glib::ParamSpec> {
    vec![
        glib::ParamSpecString::builder("model")
            .nick("Model")
            .blurb("Path to inference model file")
            .build(),
        glib::ParamSpecString::builder("model-proc")
            .nick("Model proc")
            .blurb("Path to JSON file with description of input/output layers pre-processing/post-processing")
            .build(),
        glib::ParamSpecString::builder("labels")
            .nick("Labels")
            .blurb("Comma separated list of labels, the position in the list is the label id")
            .build(),
        glib::ParamSpecString::builder("model-instance-id")
            .nick("Model Instance Id")
            .blurb(
                "Identifier for the model instance. Elements with the same model-instance-id share one model \
                 instance and must have the same image format and memory type",
            )
            .build(),
        glib::ParamSpecString::builder("device")
            .nick("Device")
            .blurb("Target device for inference")
            .default_value(Some(DEFAULT_DEVICE))
            .build(),
        glib::ParamSpecUInt::builder("batch-size")
            .nick("Batch size")
            .blurb("Number of frames batched together for a single inference, 0 lets the engine decide")
            .minimum(0)
            .maximum(MAX_BATCH_SIZE)
            .default_value(DEFAULT_BATCH_SIZE)
            .build(),
        glib::ParamSpecUInt::builder("inference-interval")
            .nick("Inference Interval")
            .blurb("Interval between inference requests. 1 runs inference on every frame, N on every Nth frame")
            .minimum(1)
            .maximum(u32::MAX)
            .default_value(DEFAULT_INFERENCE_INTERVAL)
            .mutable_playing()
            .build(),
        glib::ParamSpecBoolean::builder("no-block")
            .nick("Adaptive inference skipping")
            .blurb("Skip inference on frames while the inference queue is full instead of blocking")
            .default_value(false)
            .mutable_playing()
            .build(),
        glib::ParamSpecUInt::builder("nireq")
            .nick("Number of inference requests")
            .blurb("Maximum number of inference requests in flight, 0 lets the engine decide")
            .minimum(0)
            .maximum(MAX_NIREQ)
            .default_value(DEFAULT_NIREQ)
            .build(),
        glib::ParamSpecUInt::builder("cpu-throughput-streams")
            .nick("CPU throughput streams")
            .blurb("Number of CPU streams used by the engine, 0 lets the engine decide")
            .default_value(0)
            .build(),
        glib::ParamSpecUInt::builder("gpu-throughput-streams")
            .nick("GPU throughput streams")
            .blurb("Number of GPU streams used by the engine, 0 lets the engine decide")
            .default_value(0)
            .build(),
        glib::ParamSpecString::builder("ie-config")
            .nick("Engine configuration")
            .blurb("Comma separated KEY=VALUE list of engine configuration parameters")
            .build(),
        glib::ParamSpecString::builder("allocator-name")
            .nick("Allocator name")
            .blurb("Registered allocator name to be used")
            .build(),
        glib::ParamSpecString::builder("pre-process-backend")
            .nick("Pre-processing backend")
            .blurb("Backend used to crop and resize regions before inference")
            .default_value(Some(DEFAULT_PRE_PROCESS_BACKEND))
            .build(),
        glib::ParamSpecString::builder("scheduling-policy")
            .nick("Scheduling policy")
            .blurb("'throughput' admits frames as they arrive, 'latency' orders admission by timestamp")
            .default_value(Some(SchedulingPolicy::Throughput.as_str()))
            .build(),
        glib::ParamSpecEnum::builder_with_default("inference-region", default_region)
            .nick("Inference region")
            .blurb("Run inference on the full frame or on every region of interest")
            .build(),
        glib::ParamSpecString::builder("object-class")
            .nick("Object class")
            .blurb("Comma separated list of region labels to run inference on")
            .mutable_playing()
            .build(),
        glib::ParamSpecDouble::builder("threshold")
            .nick("Threshold")
            .blurb("Minimum confidence for a result to be attached")
            .minimum(0.0)
            .maximum(1.0)
            .default_value(DEFAULT_THRESHOLD)
            .build(),
    ]
}

/// Creates a message structure carrying inference results
///
/// The structure is posted as an element message on the bus:
///
/// ```text
/// gva-inference-result
///   timestamp: Buffer presentation timestamp
///   media: "video" or "audio"
///   type: "detection" or "classification"
///   result: JSON string with the results
/// ```
pub fn create_inference_message(
    media: &str,
    timestamp: gst::ClockTime,
    result_type: &str,
    result: String,
) -> gst::Structure {
    gst::Structure::builder("gva-inference-result")
        .field("timestamp", timestamp)
        .field("media", media)
        .field("type", result_type)
        .field("result", result)
        .build()
}

/// Creates a message structure for inference errors that did not stop the pipeline.
pub fn create_error_message(media: &str, timestamp: gst::ClockTime, error: String) -> gst::Structure {
    gst::Structure::builder("gva-inference-error")
        .field("timestamp", timestamp)
        .field("media", media)
        .field("error", error)
        .build()
}
