use crate::inference::InferenceError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Model classifying one audio window.
pub trait AudioClassifier: Send {
    /// Number of samples the model expects per inference.
    fn sample_length(&self) -> usize;

    /// Classifies `samples` normalized to [-1, 1] and returns label scores.
    fn classify(&mut self, samples: Vec<f32>) -> Result<HashMap<String, f64>, InferenceError>;
}

pub type SharedClassifier = Arc<Mutex<Box<dyn AudioClassifier>>>;

/// Loaded models shared by audio elements with the same model-instance-id
///
/// Entries are weak; a model is unloaded once the last element holding it
/// stops.
#[derive(Default)]
pub struct AudioModels {
    instances: Mutex<HashMap<String, Weak<Mutex<Box<dyn AudioClassifier>>>>>,
}

impl AudioModels {
    /// Returns the model registered under `instance_id`, loading it with
    /// `load` when no element holds it anymore.
    pub fn acquire<F>(&self, instance_id: Option<&str>, load: F) -> Result<SharedClassifier, InferenceError>
    where
        F: FnOnce() -> Result<Box<dyn AudioClassifier>, InferenceError>,
    {
        let Some(id) = instance_id else {
            return Ok(Arc::new(Mutex::new(load()?)));
        };

        let mut instances = self.instances.lock().unwrap();
        if let Some(classifier) = instances.get(id).and_then(Weak::upgrade) {
            return Ok(classifier);
        }
        let classifier: SharedClassifier = Arc::new(Mutex::new(load()?));
        instances.insert(id.to_string(), Arc::downgrade(&classifier));
        instances.retain(|_, weak| weak.strong_count() > 0);
        Ok(classifier)
    }
}

/// Extracts label scores from a result document, either a
/// `classification` object or the object itself.
pub fn scores(result: &Value) -> HashMap<String, f64> {
    let map = result
        .get("classification")
        .and_then(Value::as_object)
        .or_else(|| result.as_object());
    map.map(|m| {
        m.iter()
            .filter_map(|(label, score)| score.as_f64().map(|s| (label.clone(), s)))
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(feature = "eim")]
pub struct EimAudioClassifier {
    model: edge_impulse_runner::EimModel,
    sample_length: usize,
}

#[cfg(feature = "eim")]
impl EimAudioClassifier {
    pub fn new(path: &str) -> Result<Self, InferenceError> {
        let model = edge_impulse_runner::EimModel::new(path)
            .map_err(|e| InferenceError::Configuration(format!("Failed to load model {}: {}", path, e)))?;
        let sample_length = model
            .parameters()
            .map_err(|e| InferenceError::Engine(format!("Failed to read model parameters: {}", e)))?
            .slice_size;
        Ok(Self { model, sample_length })
    }
}

#[cfg(feature = "eim")]
impl AudioClassifier for EimAudioClassifier {
    fn sample_length(&self) -> usize {
        self.sample_length
    }

    fn classify(&mut self, samples: Vec<f32>) -> Result<HashMap<String, f64>, InferenceError> {
        let response = self
            .model
            .classify(samples, None)
            .map_err(|e| InferenceError::Engine(e.to_string()))?;
        let value = serde_json::to_value(&response.result)
            .map_err(|e| InferenceError::Engine(format!("Failed to serialize result: {}", e)))?;
        Ok(scores(&value))
    }
}
