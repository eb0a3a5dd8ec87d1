use super::element::ElementHandle;
use gstreamer as gst;
use gstreamer_video as gst_video;
use serde::Serialize;
use std::sync::Arc;

/// Id of the region generated for full-frame inference.
pub const FULL_FRAME_ROI_ID: i32 = -1;

/// Identity of a queued output buffer.
///
/// Shallow buffer copies can share memory with buffers that are still
/// queued, so completions are matched by this id rather than by the
/// buffer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Regions of one pixel or less in either dimension cannot be inferred on.
    pub fn is_valid_size(&self) -> bool {
        self.w > 1 && self.h > 1
    }

    /// Clips the rectangle to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect {
            x,
            y,
            w: self.w.min(width - x),
            h: self.h.min(height - y),
        }
    }
}

impl From<(u32, u32, u32, u32)> for Rect {
    fn from((x, y, w, h): (u32, u32, u32, u32)) -> Self {
        Rect { x, y, w, h }
    }
}

/// A region of a buffer selected for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOfInterest {
    /// Id of the ROI meta the region was taken from, [`FULL_FRAME_ROI_ID`] for full frames.
    pub id: i32,
    pub rect: Rect,
    pub label: Option<String>,
    /// Tracking id set by an upstream tracker, if any.
    pub object_id: Option<i32>,
}

impl RegionOfInterest {
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            id: FULL_FRAME_ROI_ID,
            rect: Rect::new(0, 0, width, height),
            label: None,
            object_id: None,
        }
    }

    pub fn is_full_frame(&self) -> bool {
        self.id == FULL_FRAME_ROI_ID
    }
}

/// Pre-processing applied to a region: the crop taken from the frame and
/// the scale factors used to resize it to the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    pub crop: Rect,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl TransformParams {
    /// Maps a rectangle in model input coordinates back to frame coordinates.
    pub fn to_frame(&self, x: f64, y: f64, w: f64, h: f64) -> Rect {
        let sx = if self.scale_x > 0.0 { self.scale_x } else { 1.0 };
        let sy = if self.scale_y > 0.0 { self.scale_y } else { 1.0 };
        Rect {
            x: self.crop.x.saturating_add((x.max(0.0) / sx).round() as u32),
            y: self.crop.y.saturating_add((y.max(0.0) / sy).round() as u32),
            w: (w.max(0.0) / sx).round() as u32,
            h: (h.max(0.0) / sy).round() as u32,
        }
    }
}

/// One object found by a detection model, in frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub rect: Rect,
    pub label: String,
    pub label_id: i32,
    pub confidence: f64,
}

/// One region submitted for inference
///
/// Travels from the scheduler to the engine and back through the
/// completion channel. Post-processing stores its results here; they are
/// written onto the buffer when the owning [`OutputFrame`] is pushed.
#[derive(Debug)]
pub struct InferenceFrame {
    pub output_id: FrameId,
    pub buffer: gst::Buffer,
    pub roi: RegionOfInterest,
    pub element: Arc<ElementHandle>,
    pub info: gst_video::VideoInfo,
    pub transform: Option<TransformParams>,
    pub detections: Vec<Detection>,
    pub classifications: Vec<gst::Structure>,
}

impl InferenceFrame {
    pub fn new(
        output_id: FrameId,
        buffer: gst::Buffer,
        roi: RegionOfInterest,
        element: Arc<ElementHandle>,
        info: gst_video::VideoInfo,
    ) -> Self {
        Self {
            output_id,
            buffer,
            roi,
            element,
            info,
            transform: None,
            detections: Vec::new(),
            classifications: Vec::new(),
        }
    }
}

/// A buffer waiting in the output queue.
#[derive(Debug)]
pub struct OutputFrame {
    pub id: FrameId,
    pub buffer: gst::Buffer,
    /// Completions still outstanding for this buffer. Only ever decreases.
    pub inference_count: usize,
    pub element: Arc<ElementHandle>,
    pub inference_rois: Vec<InferenceFrame>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_regions_are_invalid() {
        assert!(Rect::new(0, 0, 2, 2).is_valid_size());
        assert!(!Rect::new(0, 0, 1, 100).is_valid_size());
        assert!(!Rect::new(0, 0, 100, 0).is_valid_size());
    }

    #[test]
    fn clamp_keeps_rect_inside_frame() {
        assert_eq!(
            Rect::new(600, 400, 100, 100).clamp_to(640, 480),
            Rect::new(600, 400, 40, 80)
        );
        assert_eq!(
            Rect::new(700, 10, 10, 10).clamp_to(640, 480),
            Rect::new(640, 10, 0, 10)
        );
    }

    #[test]
    fn transform_maps_model_coordinates_to_frame() {
        let params = TransformParams {
            crop: Rect::new(100, 50, 200, 100),
            scale_x: 0.5,
            scale_y: 2.0,
        };
        assert_eq!(
            params.to_frame(10.0, 20.0, 50.0, 40.0),
            Rect::new(120, 60, 100, 20)
        );
    }

    #[test]
    fn out_of_range_model_box_saturates() {
        let params = TransformParams {
            crop: Rect::new(100, 50, 200, 100),
            scale_x: 1e-12,
            scale_y: 1.0,
        };
        let rect = params.to_frame(1e9, 5.0, 10.0, 10.0);
        assert_eq!(rect.x, u32::MAX);
        assert_eq!(rect.y, 55);
        assert_eq!(rect.clamp_to(640, 480), Rect::new(640, 55, 0, 10));
    }
}
