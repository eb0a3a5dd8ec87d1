//! Inference scheduling shared by the video elements
//!
//! Buffers enter through [`InferenceScheduler::transform_frame`], regions
//! are submitted to an [`InferenceEngine`] and buffers leave in arrival
//! order per element once every region they carry has completed. Elements
//! sharing a `model-instance-id` share one scheduler through the
//! [`InferenceRegistry`].

#[cfg(feature = "eim")]
pub mod eim;
pub mod element;
pub mod engine;
pub mod error;
pub mod frame;
pub mod history;
pub mod meta;
pub mod post_process;
pub mod region;
pub mod registry;
pub mod scheduler;

pub use element::{ElementHandle, OutputSink, RoiFilter};
pub use engine::{CapsFeature, Completion, InferenceEngine, InferenceRequest, MemoryType, OutputBlob, OutputBlobs};
pub use error::InferenceError;
pub use frame::{FrameId, InferenceFrame, OutputFrame, Rect, RegionOfInterest};
pub use history::ClassificationHistory;
pub use post_process::PostProcessor;
pub use registry::{EngineFactory, InferenceRegistry};
pub use scheduler::{FrameDisposition, InferenceScheduler, InferenceStatus};
