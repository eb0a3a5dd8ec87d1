//! Edge Impulse engine
//!
//! Runs `.eim` models through `edge-impulse-runner`. Regions are cropped,
//! resized to the model input and packed into features when they are
//! submitted; full batches are classified on a blocking thread of the
//! plugin runtime and reported through the completion channel. At most
//! `nireq` batches run at once, further submissions wait for a free slot.
//!
//! Features are packed one value per pixel:
//!
//! ```text
//! RGB models:        packed = (r << 16) | (g << 8) | b
//! grayscale models:  gray = 0.299*r + 0.587*g + 0.114*b
//!                    packed = (gray << 16) | (gray << 8) | gray
//! ```

use super::engine::{
    Completion, CompletionSender, InferenceEngine, InferenceRequest, OutputBlob, OutputBlobs,
};
use super::error::InferenceError;
use super::frame::{InferenceFrame, Rect, TransformParams};
use crate::common::{InferenceSettings, CAT};
use edge_impulse_runner::EimModel;
use gstreamer as gst;
use gstreamer_video as gst_video;
use image::{imageops, RgbImage};
use once_cell::sync::Lazy;
use std::sync::{Arc, Condvar, Mutex};
use tokio::runtime;

static RUNTIME: Lazy<runtime::Runtime> = Lazy::new(|| {
    runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .thread_name("gva-eim")
        .build()
        .unwrap()
});

/// Input geometry expected by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Model classifying the packed features of one region.
pub trait FeatureClassifier: Send {
    fn classify_features(&mut self, features: Vec<f32>) -> Result<serde_json::Value, InferenceError>;
}

impl FeatureClassifier for EimModel {
    fn classify_features(&mut self, features: Vec<f32>) -> Result<serde_json::Value, InferenceError> {
        let response = EimModel::classify(self, features, None).map_err(|e| InferenceError::Engine(e.to_string()))?;
        serde_json::to_value(&response.result)
            .map_err(|e| InferenceError::Engine(format!("Failed to serialize result: {}", e)))
    }
}

struct PendingRequest {
    frame: InferenceFrame,
    features: Vec<f32>,
    completions: CompletionSender,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    done: Condvar,
}

impl InFlight {
    /// Takes a request slot, waiting while `limit` batches are running.
    fn begin(&self, limit: usize) {
        let mut count = self.count.lock().unwrap();
        while *count >= limit.max(1) {
            count = self.done.wait(count).unwrap();
        }
        *count += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        self.done.notify_all();
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap()
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.done.wait(count).unwrap();
        }
    }
}

pub struct EimEngine {
    model: Arc<Mutex<Box<dyn FeatureClassifier>>>,
    input: ModelInput,
    batch_size: usize,
    nireq: usize,
    pending: Mutex<Vec<PendingRequest>>,
    in_flight: Arc<InFlight>,
}

impl EimEngine {
    /// Loads the model named by `settings` and reads its input geometry.
    pub fn new(settings: &InferenceSettings) -> Result<Self, InferenceError> {
        let path = settings
            .model
            .as_deref()
            .ok_or_else(|| InferenceError::Configuration("'model' is not set".to_string()))?;

        gst::info!(CAT, "Loading model from {}", path);
        let model = EimModel::new(path)
            .map_err(|e| InferenceError::Configuration(format!("Failed to load model {}: {}", path, e)))?;
        let params = model
            .parameters()
            .map_err(|e| InferenceError::Engine(format!("Failed to read model parameters: {}", e)))?;

        let input = ModelInput {
            width: params.image_input_width,
            height: params.image_input_height,
            channels: params.image_channel_count,
        };
        if input.width == 0 || input.height == 0 {
            return Err(InferenceError::Configuration(format!(
                "{} is not an image model ({})",
                path, params.model_type
            )));
        }

        gst::info!(
            CAT,
            "Loaded {} model, input {}x{}x{}",
            params.model_type,
            input.width,
            input.height,
            input.channels
        );

        Ok(Self::with_classifier(
            Box::new(model),
            input,
            settings.effective_batch_size(),
            settings.effective_nireq(),
        ))
    }

    pub fn with_classifier(
        classifier: Box<dyn FeatureClassifier>,
        input: ModelInput,
        batch_size: usize,
        nireq: usize,
    ) -> Self {
        Self {
            model: Arc::new(Mutex::new(classifier)),
            input,
            batch_size: batch_size.max(1),
            nireq: nireq.max(1),
            pending: Mutex::new(Vec::new()),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn input(&self) -> ModelInput {
        self.input
    }

    fn run_batch(&self, batch: Vec<PendingRequest>) {
        let Some(completions) = batch.first().map(|r| r.completions.clone()) else {
            return;
        };
        if self.in_flight.current() >= self.nireq {
            gst::debug!(CAT, "All {} inference requests busy, waiting", self.nireq);
        }
        self.in_flight.begin(self.nireq);
        let model = self.model.clone();
        let in_flight = self.in_flight.clone();

        RUNTIME.spawn_blocking(move || {
            let mut frames = Vec::with_capacity(batch.len());
            let mut features = Vec::with_capacity(batch.len());
            for request in batch {
                frames.push(request.frame);
                features.push(request.features);
            }

            let completion = match classify_batch(&model, features) {
                Ok(blobs) => Completion::Done { blobs, frames },
                Err(error) => Completion::Failed { frames, error },
            };
            if completions.send(completion).is_err() {
                gst::warning!(CAT, "Completion receiver is gone, dropping batch results");
            }
            in_flight.end();
        });
    }
}

impl InferenceEngine for EimEngine {
    fn submit(&self, request: InferenceRequest) -> Result<(), InferenceError> {
        let InferenceRequest { mut frame, completions } = request;

        let image = region_image(&frame.buffer, &frame.info, &frame.roi.rect)?;
        let resized = imageops::resize(
            &image,
            self.input.width,
            self.input.height,
            imageops::FilterType::Triangle,
        );
        frame.transform = Some(TransformParams {
            crop: frame.roi.rect,
            scale_x: self.input.width as f64 / frame.roi.rect.w as f64,
            scale_y: self.input.height as f64 / frame.roi.rect.h as f64,
        });
        let features = pack_features(&resized, self.input.channels);

        let batch = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(PendingRequest {
                frame,
                features,
                completions,
            });
            if pending.len() < self.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };
        self.run_batch(batch);
        Ok(())
    }

    fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        if !batch.is_empty() {
            gst::debug!(CAT, "Submitting partial batch of {}", batch.len());
            self.run_batch(batch);
        }
        self.in_flight.wait_idle();
    }

    fn is_queue_full(&self) -> bool {
        self.in_flight.current() >= self.nireq
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn nireq(&self) -> usize {
        self.nireq
    }
}

fn classify_batch(
    model: &Mutex<Box<dyn FeatureClassifier>>,
    features: Vec<Vec<f32>>,
) -> Result<OutputBlobs, InferenceError> {
    let mut model = model.lock().unwrap();
    let mut results = Vec::with_capacity(features.len());
    for input in features {
        let now = std::time::Instant::now();
        results.push(model.classify_features(input)?);
        gst::trace!(CAT, "Inference took {} ms", now.elapsed().as_millis());
    }
    Ok(split_layers(results))
}

/// Splits per-frame result documents into one blob per output layer.
///
/// Every layer holds one value per frame; frames missing a layer get `null`.
pub fn split_layers(results: Vec<serde_json::Value>) -> OutputBlobs {
    let mut blobs = OutputBlobs::new();
    let count = results.len();
    for (i, result) in results.into_iter().enumerate() {
        let serde_json::Value::Object(layers) = result else {
            continue;
        };
        for (name, value) in layers {
            let blob = blobs.entry(name).or_insert_with(|| OutputBlob {
                values: vec![serde_json::Value::Null; count],
            });
            blob.values[i] = value;
        }
    }
    blobs
}

/// Byte offsets of red, green and blue and the pixel size of packed RGB formats.
fn rgb_layout(format: gst_video::VideoFormat) -> Option<([usize; 3], usize)> {
    use gst_video::VideoFormat::*;
    match format {
        Rgb => Some(([0, 1, 2], 3)),
        Bgr => Some(([2, 1, 0], 3)),
        Rgbx | Rgba => Some(([0, 1, 2], 4)),
        Bgrx | Bgra => Some(([2, 1, 0], 4)),
        Xrgb | Argb => Some(([1, 2, 3], 4)),
        Xbgr | Abgr => Some(([3, 2, 1], 4)),
        _ => None,
    }
}

/// Copies `rect` of a mapped video buffer into an RGB image.
pub fn region_image(
    buffer: &gst::Buffer,
    info: &gst_video::VideoInfo,
    rect: &Rect,
) -> Result<RgbImage, InferenceError> {
    let (offsets, pixel_size) = rgb_layout(info.format()).ok_or_else(|| {
        InferenceError::InvalidInput(format!("unsupported video format {:?}", info.format()))
    })?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(&**buffer, info)
        .map_err(|_| InferenceError::InvalidInput("failed to map video frame".to_string()))?;
    let data = frame
        .plane_data(0)
        .map_err(|_| InferenceError::InvalidInput("failed to read plane data".to_string()))?;
    let stride = frame.plane_stride()[0] as usize;

    let rect = rect.clamp_to(info.width(), info.height());
    let mut image = RgbImage::new(rect.w, rect.h);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let start = (rect.y + y) as usize * stride + (rect.x + x) as usize * pixel_size;
        let Some(src) = data.get(start..start + pixel_size) else {
            return Err(InferenceError::InvalidInput(
                "video frame is smaller than its caps".to_string(),
            ));
        };
        pixel.0 = [src[offsets[0]], src[offsets[1]], src[offsets[2]]];
    }
    Ok(image)
}

/// Packs pixels into model features, see the module documentation.
pub fn pack_features(image: &RgbImage, channels: u32) -> Vec<f32> {
    image
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            let packed = if channels == 3 {
                (r as u32) << 16 | (g as u32) << 8 | b as u32
            } else {
                let gray = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) as u32;
                gray << 16 | gray << 8 | gray
            };
            packed as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::frame::{FrameId, RegionOfInterest};
    use crate::inference::scheduler::tests::{element, init, wait_for, RecordingSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn rgbx_buffer(info: &gst_video::VideoInfo) -> gst::Buffer {
        let stride = info.stride()[0] as usize;
        let mut data = vec![0u8; info.size()];
        for y in 0..info.height() as usize {
            for x in 0..info.width() as usize {
                let px = y * stride + x * 4;
                data[px] = x as u8;
                data[px + 1] = y as u8;
                data[px + 2] = 200;
            }
        }
        gst::Buffer::from_mut_slice(data)
    }

    #[test]
    fn region_is_cropped_from_frame() {
        init();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgbx, 16, 8)
            .build()
            .unwrap();
        let buffer = rgbx_buffer(&info);

        let image = region_image(&buffer, &info, &Rect::new(4, 2, 6, 3)).unwrap();

        assert_eq!(image.dimensions(), (6, 3));
        assert_eq!(image.get_pixel(0, 0).0, [4, 2, 200]);
        assert_eq!(image.get_pixel(5, 2).0, [9, 4, 200]);
    }

    #[test]
    fn unsupported_format_is_rejected() {
        init();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, 16, 8)
            .build()
            .unwrap();
        let buffer = gst::Buffer::with_size(info.size()).unwrap();
        let err = region_image(&buffer, &info, &Rect::new(0, 0, 16, 8)).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
    }

    #[test]
    fn features_pack_rgb_and_grayscale() {
        let image = RgbImage::from_raw(2, 1, vec![1, 2, 3, 100, 100, 100]).unwrap();

        let rgb = pack_features(&image, 3);
        assert_eq!(rgb, vec![((1 << 16) | (2 << 8) | 3) as f32, 0x646464 as f32]);

        let gray = pack_features(&image, 1);
        let packed = gray[1] as u32;
        assert_eq!(packed >> 16, packed & 0xff);
        assert_eq!((packed >> 8) & 0xff, packed & 0xff);
    }

    #[test]
    fn results_are_split_per_layer() {
        let blobs = split_layers(vec![
            json!({"bounding_boxes": [{"label": "a"}], "classification": {}}),
            json!({"bounding_boxes": []}),
        ]);

        assert_eq!(blobs["bounding_boxes"].values.len(), 2);
        assert_eq!(blobs["bounding_boxes"].values[1], json!([]));
        assert_eq!(blobs["classification"].values[1], serde_json::Value::Null);
    }

    /// Classifier holding each inference until the test releases it.
    struct GatedClassifier {
        gate: std::sync::mpsc::Receiver<()>,
    }

    impl FeatureClassifier for GatedClassifier {
        fn classify_features(&mut self, _features: Vec<f32>) -> Result<serde_json::Value, InferenceError> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            Ok(json!({"classification": {"person": 0.9}}))
        }
    }

    fn request(pts: u64, completions: &CompletionSender) -> InferenceRequest {
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, 8, 8)
            .build()
            .unwrap();
        let mut buffer = gst::Buffer::with_size(info.size()).unwrap();
        buffer.get_mut().unwrap().set_pts(gst::ClockTime::from_nseconds(pts));
        let handle = element("detect0", RecordingSink::named("sink0"), InferenceSettings::default());
        InferenceRequest {
            frame: InferenceFrame::new(FrameId(pts), buffer, RegionOfInterest::full_frame(8, 8), handle, info),
            completions: completions.clone(),
        }
    }

    #[test]
    fn submit_waits_for_a_free_request_slot() {
        init();
        let (release, gate) = std::sync::mpsc::channel();
        let input = ModelInput {
            width: 4,
            height: 4,
            channels: 3,
        };
        let engine = Arc::new(EimEngine::with_classifier(Box::new(GatedClassifier { gate }), input, 1, 1));
        let (completions, mut receiver) = tokio::sync::mpsc::unbounded_channel();

        engine.submit(request(1, &completions)).unwrap();
        assert!(engine.is_queue_full());

        let submitted = Arc::new(AtomicBool::new(false));
        let second = {
            let engine = engine.clone();
            let completions = completions.clone();
            let submitted = submitted.clone();
            thread::spawn(move || {
                engine.submit(request(2, &completions)).unwrap();
                submitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!submitted.load(Ordering::SeqCst));

        release.send(()).unwrap();
        assert!(wait_for(|| submitted.load(Ordering::SeqCst)));
        second.join().unwrap();

        release.send(()).unwrap();
        engine.flush();
        assert!(!engine.is_queue_full());
        for _ in 0..2 {
            match receiver.try_recv() {
                Ok(Completion::Done { blobs, frames }) => {
                    assert_eq!(frames.len(), 1);
                    assert!(blobs.contains_key("classification"));
                }
                other => panic!("unexpected completion {:?}", other),
            }
        }
    }
}
