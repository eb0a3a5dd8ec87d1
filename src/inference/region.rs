use super::element::ElementHandle;
use super::frame::{Rect, RegionOfInterest};
use super::history::object_id_of;
use crate::common::{InferenceRegion, InferenceSettings};
use gstreamer as gst;
use gstreamer_video as gst_video;

/// Collects the regions of `buffer` to run inference on.
///
/// Full-frame mode yields a single region covering the frame unless the
/// frame is degenerate. ROI-list mode yields the ROI metas already
/// attached to the buffer that are large enough, whose label passes the
/// `object-class` allow-list and that the element's ROI filter accepts.
pub fn collect_regions(
    element: &ElementHandle,
    settings: &InferenceSettings,
    buffer: &gst::BufferRef,
    info: &gst_video::VideoInfo,
    frame_num: u64,
) -> Vec<RegionOfInterest> {
    match settings.inference_region {
        InferenceRegion::FullFrame => {
            let roi = RegionOfInterest::full_frame(info.width(), info.height());
            if roi.rect.is_valid_size() {
                vec![roi]
            } else {
                Vec::new()
            }
        }
        InferenceRegion::RoiList => {
            let object_classes = settings.object_classes();
            buffer
                .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
                .filter_map(|meta| {
                    let rect = Rect::from(meta.rect()).clamp_to(info.width(), info.height());
                    if !rect.is_valid_size() {
                        return None;
                    }
                    let label = meta.roi_type();
                    if !object_classes.is_empty() && !object_classes.iter().any(|c| c == label) {
                        return None;
                    }
                    let roi = RegionOfInterest {
                        id: meta.id(),
                        rect,
                        label: Some(label.to_string()),
                        object_id: object_id_of(&meta),
                    };
                    match element.roi_filter() {
                        Some(filter) if !filter.is_inference_needed(frame_num, &roi) => None,
                        _ => Some(roi),
                    }
                })
                .collect()
        }
    }
}
