use super::error::InferenceError;
use super::frame::InferenceFrame;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Memory the engine reads frames from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    System,
    Vaapi,
    DmaBuf,
}

/// Memory feature of the negotiated caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CapsFeature {
    #[default]
    Any,
    SystemMemory,
    VaSurface,
    VaMemory,
    DmaBuf,
}

impl CapsFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapsFeature::Any => "ANY",
            CapsFeature::SystemMemory => "System",
            CapsFeature::VaSurface => "VASurface",
            CapsFeature::VaMemory => "VAMemory",
            CapsFeature::DmaBuf => "DMABuf",
        }
    }

    /// Memory an engine must read to consume buffers with this feature.
    pub fn memory_type(&self) -> MemoryType {
        match self {
            CapsFeature::Any | CapsFeature::SystemMemory => MemoryType::System,
            CapsFeature::VaSurface | CapsFeature::VaMemory => MemoryType::Vaapi,
            CapsFeature::DmaBuf => MemoryType::DmaBuf,
        }
    }

    /// Reads the memory feature of the first caps structure.
    pub fn from_caps(caps: &gstreamer::CapsRef) -> Self {
        match caps.features(0) {
            Some(f) if f.contains("memory:VASurface") => CapsFeature::VaSurface,
            Some(f) if f.contains("memory:VAMemory") => CapsFeature::VaMemory,
            Some(f) if f.contains("memory:DMABuf") => CapsFeature::DmaBuf,
            _ => CapsFeature::SystemMemory,
        }
    }
}

/// Output of one layer for a batch, one value per submitted frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputBlob {
    pub values: Vec<serde_json::Value>,
}

pub type OutputBlobs = HashMap<String, OutputBlob>;

/// Notification sent by an engine once a batch has been handled.
#[derive(Debug)]
pub enum Completion {
    Done {
        blobs: OutputBlobs,
        frames: Vec<InferenceFrame>,
    },
    Failed {
        frames: Vec<InferenceFrame>,
        error: InferenceError,
    },
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// A region handed to the engine together with the channel its completion
/// must be reported on.
#[derive(Debug)]
pub struct InferenceRequest {
    pub frame: InferenceFrame,
    pub completions: CompletionSender,
}

/// Engine running the model
///
/// Implementations must be safe to submit to from several streaming
/// threads at once and may report completions from any thread. Every
/// accepted request must eventually produce exactly one completion entry
/// for its frame, either `Done` or `Failed`.
pub trait InferenceEngine: Send + Sync {
    fn submit(&self, request: InferenceRequest) -> Result<(), InferenceError>;

    /// Blocks until every accepted request has been completed.
    fn flush(&self);

    fn is_queue_full(&self) -> bool;

    fn batch_size(&self) -> usize;

    fn nireq(&self) -> usize;

    fn memory_type(&self) -> MemoryType {
        MemoryType::System
    }
}
