use super::engine::{OutputBlob, OutputBlobs};
use super::error::InferenceError;
use super::frame::{Detection, InferenceFrame, TransformParams};
use crate::common::{ElementKind, InferenceSettings};
use gstreamer as gst;
use serde_json::Value;
use std::sync::Arc;

pub const DETECTION_LAYER: &str = "bounding_boxes";
pub const CLASSIFICATION_LAYER: &str = "classification";

/// Converts raw output blobs into results stored on the inference frames.
///
/// Called once per completed batch; `blobs` hold one value per frame, in
/// the order of `frames`.
pub trait PostProcessor: Send + Sync {
    fn process(&self, blobs: &OutputBlobs, frames: &mut [InferenceFrame]) -> Result<(), InferenceError>;
}

/// Creates the post-processor matching the element kind.
pub fn create(kind: ElementKind, settings: &InferenceSettings) -> Arc<dyn PostProcessor> {
    match kind {
        ElementKind::Detect => Arc::new(DetectionPostProcessor::new(settings)),
        ElementKind::Classify => Arc::new(ClassificationPostProcessor::new(settings)),
    }
}

fn layer<'a>(blobs: &'a OutputBlobs, name: &str) -> Result<&'a OutputBlob, InferenceError> {
    blobs
        .get(name)
        .ok_or_else(|| InferenceError::PostProcessing(format!("no '{}' output layer", name)))
}

/// Resolves a model label to a display label and id using the `labels` list.
fn resolve_label(labels: &[String], label: &str) -> (String, i32) {
    if let Some(pos) = labels.iter().position(|l| l == label) {
        return (label.to_string(), pos as i32);
    }
    match label.parse::<usize>() {
        Ok(idx) if idx < labels.len() => (labels[idx].clone(), idx as i32),
        Ok(idx) => (label.to_string(), idx as i32),
        Err(_) => (label.to_string(), -1),
    }
}

/// Turns `bounding_boxes` output into detections in frame coordinates.
#[derive(Debug, Clone)]
pub struct DetectionPostProcessor {
    threshold: f64,
    labels: Vec<String>,
}

impl DetectionPostProcessor {
    pub fn new(settings: &InferenceSettings) -> Self {
        Self {
            threshold: settings.threshold,
            labels: settings.label_list(),
        }
    }

    fn parse_box(&self, bbox: &Value, transform: &TransformParams, frame: &InferenceFrame) -> Option<Detection> {
        let x = bbox.get("x")?.as_f64()?;
        let y = bbox.get("y")?.as_f64()?;
        let w = bbox.get("width")?.as_f64()?;
        let h = bbox.get("height")?.as_f64()?;
        let confidence = bbox.get("value")?.as_f64()?;
        if confidence < self.threshold {
            return None;
        }

        let raw_label = match bbox.get("label")? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let (label, label_id) = resolve_label(&self.labels, &raw_label);
        let rect = transform
            .to_frame(x, y, w, h)
            .clamp_to(frame.info.width(), frame.info.height());
        if !rect.is_valid_size() {
            return None;
        }

        Some(Detection {
            rect,
            label,
            label_id,
            confidence,
        })
    }
}

impl PostProcessor for DetectionPostProcessor {
    fn process(&self, blobs: &OutputBlobs, frames: &mut [InferenceFrame]) -> Result<(), InferenceError> {
        let blob = layer(blobs, DETECTION_LAYER)?;
        for (i, frame) in frames.iter_mut().enumerate() {
            let Some(value) = blob.values.get(i) else {
                return Err(InferenceError::PostProcessing(format!(
                    "'{}' holds {} results for a batch of {}",
                    DETECTION_LAYER,
                    blob.values.len(),
                    i + 1
                )));
            };
            let boxes = value.as_array().ok_or_else(|| {
                InferenceError::PostProcessing(format!("'{}' is not an array", DETECTION_LAYER))
            })?;

            let transform = frame.transform.unwrap_or(TransformParams {
                crop: frame.roi.rect,
                scale_x: 1.0,
                scale_y: 1.0,
            });
            let detections: Vec<Detection> = boxes
                .iter()
                .filter_map(|bbox| self.parse_box(bbox, &transform, &*frame))
                .collect();
            frame.detections = detections;
        }
        Ok(())
    }
}

/// Turns `classification` output into one result structure per region.
///
/// The output of a frame is either an object mapping labels to scores or
/// an array of `{"label": .., "value": ..}` entries; the best label wins.
#[derive(Debug, Clone)]
pub struct ClassificationPostProcessor {
    threshold: f64,
    labels: Vec<String>,
}

impl ClassificationPostProcessor {
    pub fn new(settings: &InferenceSettings) -> Self {
        Self {
            threshold: settings.threshold,
            labels: settings.label_list(),
        }
    }

    fn scores(value: &Value) -> Result<Vec<(String, f64)>, InferenceError> {
        match value {
            Value::Object(map) => Ok(map
                .iter()
                .filter_map(|(label, score)| score.as_f64().map(|s| (label.clone(), s)))
                .collect()),
            Value::Array(entries) => Ok(entries
                .iter()
                .filter_map(|e| {
                    let label = match e.get("label")? {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Some((label, e.get("value")?.as_f64()?))
                })
                .collect()),
            _ => Err(InferenceError::PostProcessing(format!(
                "unexpected '{}' value {}",
                CLASSIFICATION_LAYER, value
            ))),
        }
    }
}

impl PostProcessor for ClassificationPostProcessor {
    fn process(&self, blobs: &OutputBlobs, frames: &mut [InferenceFrame]) -> Result<(), InferenceError> {
        let blob = layer(blobs, CLASSIFICATION_LAYER)?;
        for (i, frame) in frames.iter_mut().enumerate() {
            let Some(value) = blob.values.get(i) else {
                return Err(InferenceError::PostProcessing(format!(
                    "'{}' holds {} results for a batch of {}",
                    CLASSIFICATION_LAYER,
                    blob.values.len(),
                    i + 1
                )));
            };

            let best = Self::scores(value)?
                .into_iter()
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let Some((raw_label, confidence)) = best else {
                continue;
            };
            if confidence < self.threshold {
                continue;
            }

            let (label, label_id) = resolve_label(&self.labels, &raw_label);
            frame.classifications.push(
                gst::Structure::builder(CLASSIFICATION_LAYER)
                    .field("layer_name", CLASSIFICATION_LAYER)
                    .field("label", label)
                    .field("label_id", label_id)
                    .field("confidence", confidence)
                    .build(),
            );
        }
        Ok(())
    }
}
