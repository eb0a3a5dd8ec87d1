//! Writing inference results onto buffers
//!
//! Detections become `GstVideoRegionOfInterestMeta`s carrying a `detection`
//! param, compatible with elements that render ROI metas. Classification
//! results are added as params of the ROI meta they were computed for.

use super::frame::{Detection, InferenceFrame, RegionOfInterest};
use gstreamer as gst;
use gstreamer_video as gst_video;
use serde_json::json;

/// Label of the ROI meta added for full-frame classification results.
pub const FULL_FRAME_ROI_TYPE: &str = "frame";

/// Results of one region, detached from the buffer it was computed on.
#[derive(Debug, Clone)]
pub struct RegionResult {
    pub roi: RegionOfInterest,
    pub detections: Vec<Detection>,
    pub classifications: Vec<gst::Structure>,
}

impl From<InferenceFrame> for RegionResult {
    fn from(frame: InferenceFrame) -> Self {
        RegionResult {
            roi: frame.roi,
            detections: frame.detections,
            classifications: frame.classifications,
        }
    }
}

fn detection_param(detection: &Detection, width: u32, height: u32) -> gst::Structure {
    let w = width.max(1) as f64;
    let h = height.max(1) as f64;
    let r = &detection.rect;
    gst::Structure::builder("detection")
        .field("confidence", detection.confidence)
        .field("label_id", detection.label_id)
        .field("x_min", r.x as f64 / w)
        .field("y_min", r.y as f64 / h)
        .field("x_max", (r.x + r.w) as f64 / w)
        .field("y_max", (r.y + r.h) as f64 / h)
        .build()
}

/// Attaches `results` to a `width` x `height` video buffer.
pub fn attach_results(buffer: &mut gst::BufferRef, results: &[RegionResult], width: u32, height: u32) {
    let mut next_id = buffer
        .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
        .map(|m| m.id())
        .max()
        .map_or(0, |id| id.max(0) + 1);

    for result in results {
        for detection in &result.detections {
            let r = &detection.rect;
            let mut meta = gst_video::VideoRegionOfInterestMeta::add(
                buffer,
                &detection.label,
                (r.x, r.y, r.w, r.h),
            );
            meta.set_id(next_id);
            if !result.roi.is_full_frame() {
                meta.set_parent_id(result.roi.id);
            }
            meta.add_param(detection_param(detection, width, height));
            next_id += 1;
        }

        if result.classifications.is_empty() {
            continue;
        }

        if result.roi.is_full_frame() {
            let r = &result.roi.rect;
            let mut meta =
                gst_video::VideoRegionOfInterestMeta::add(buffer, FULL_FRAME_ROI_TYPE, (r.x, r.y, r.w, r.h));
            meta.set_id(next_id);
            next_id += 1;
            for classification in &result.classifications {
                meta.add_param(classification.clone());
            }
            continue;
        }

        let target = buffer
            .iter_meta_mut::<gst_video::VideoRegionOfInterestMeta>()
            .find(|m| {
                let (x, y, _, _) = m.rect();
                m.id() == result.roi.id && x == result.roi.rect.x && y == result.roi.rect.y
            });
        match target {
            Some(mut meta) => {
                for classification in &result.classifications {
                    meta.add_param(classification.clone());
                }
            }
            None => gst::warning!(
                crate::common::CAT,
                "Region {} disappeared from the buffer, dropping its classification",
                result.roi.id
            ),
        }
    }
}

/// Summarizes results as a JSON document for bus messages.
///
/// Returns the result type and the document, or `None` when there is
/// nothing to report.
pub fn results_json(results: &[RegionResult]) -> Option<(&'static str, String)> {
    let detections: Vec<_> = results.iter().flat_map(|r| r.detections.iter()).collect();
    if !detections.is_empty() {
        let doc = json!({ "bounding_boxes": detections });
        return Some(("detection", doc.to_string()));
    }

    let classifications: Vec<_> = results
        .iter()
        .flat_map(|r| {
            r.classifications.iter().map(move |s| {
                json!({
                    "roi_id": r.roi.id,
                    "layer": s.name().as_str(),
                    "label": s.get::<&str>("label").unwrap_or_default(),
                    "confidence": s.get::<f64>("confidence").unwrap_or_default(),
                })
            })
        })
        .collect();
    if !classifications.is_empty() {
        let doc = json!({ "classification": classifications });
        return Some(("classification", doc.to_string()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::frame::Rect;

    fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            gst::init().unwrap();
        });
    }

    #[test]
    fn detections_become_roi_metas() {
        init();
        let mut buffer = gst::Buffer::new();
        let results = vec![RegionResult {
            roi: RegionOfInterest::full_frame(200, 100),
            detections: vec![Detection {
                rect: Rect::new(20, 10, 100, 50),
                label: "person".into(),
                label_id: 0,
                confidence: 0.75,
            }],
            classifications: vec![],
        }];

        attach_results(buffer.get_mut().unwrap(), &results, 200, 100);

        let metas: Vec<_> = buffer
            .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
            .collect();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].rect(), (20, 10, 100, 50));
        assert_eq!(metas[0].roi_type(), "person");
        let param = metas[0].param("detection").unwrap();
        assert_eq!(param.get::<f64>("confidence").unwrap(), 0.75);
        assert_eq!(param.get::<f64>("x_max").unwrap(), 0.6);

        let (kind, doc) = results_json(&results).unwrap();
        assert_eq!(kind, "detection");
        assert!(doc.contains("person"));
    }

    #[test]
    fn classifications_attach_to_their_region() {
        init();
        let mut buffer = gst::Buffer::new();
        let roi_id = {
            let buffer = buffer.get_mut().unwrap();
            gst_video::VideoRegionOfInterestMeta::add(buffer, "car", (0, 0, 10, 10));
            let mut meta = gst_video::VideoRegionOfInterestMeta::add(buffer, "car", (30, 30, 20, 20));
            meta.set_id(5);
            meta.id()
        };
        let results = vec![RegionResult {
            roi: RegionOfInterest {
                id: roi_id,
                rect: Rect::new(30, 30, 20, 20),
                label: Some("car".into()),
                object_id: None,
            },
            detections: vec![],
            classifications: vec![gst::Structure::builder("classification")
                .field("label", "blue")
                .field("confidence", 0.9f64)
                .build()],
        }];

        attach_results(buffer.get_mut().unwrap(), &results, 640, 480);

        let metas: Vec<_> = buffer
            .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
            .collect();
        assert!(metas[0].param("classification").is_none());
        let param = metas[1].param("classification").unwrap();
        assert_eq!(param.get::<&str>("label").unwrap(), "blue");
    }
}
