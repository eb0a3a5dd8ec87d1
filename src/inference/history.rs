//! Classification history for tracked objects
//!
//! `gvaclassify` uses the history to avoid classifying a tracked object on
//! every frame. Objects carry a tracking id (ROI param `object_id`, field
//! `id`); the latest result per output layer is remembered and copied onto
//! the object's ROI on frames where it was not classified again, together
//! with a `frames_ago` field.

use super::element::RoiFilter;
use super::frame::RegionOfInterest;
use crate::common::CAT;
use gstreamer as gst;
use gstreamer_video as gst_video;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Number of tracked objects remembered.
pub const CLASSIFICATION_HISTORY_SIZE: usize = 100;

#[derive(Debug, Default)]
struct ObjectHistory {
    frame_of_last_update: u64,
    layers: HashMap<String, gst::Structure>,
}

#[derive(Debug)]
struct HistoryState {
    current_frame: u64,
    objects: HashMap<i32, ObjectHistory>,
    // Least recently used first.
    order: VecDeque<i32>,
}

impl HistoryState {
    fn touch(&mut self, id: i32) {
        if let Some(pos) = self.order.iter().position(|&o| o == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id);
    }

    fn get_mut(&mut self, id: i32) -> Option<&mut ObjectHistory> {
        if self.objects.contains_key(&id) {
            self.touch(id);
        }
        self.objects.get_mut(&id)
    }

    fn put(&mut self, id: i32, frame: u64) -> &mut ObjectHistory {
        if !self.objects.contains_key(&id) && self.objects.len() >= CLASSIFICATION_HISTORY_SIZE {
            if let Some(evicted) = self.order.pop_front() {
                self.objects.remove(&evicted);
            }
        }
        self.touch(id);
        let entry = self.objects.entry(id).or_default();
        entry.frame_of_last_update = frame;
        entry
    }
}

#[derive(Debug)]
pub struct ClassificationHistory {
    reclassify_interval: u32,
    state: Mutex<HistoryState>,
}

impl ClassificationHistory {
    pub fn new(reclassify_interval: u32) -> Self {
        Self {
            reclassify_interval,
            state: Mutex::new(HistoryState {
                current_frame: 0,
                objects: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn reclassify_interval(&self) -> u32 {
        self.reclassify_interval
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decides whether a region must be classified on frame `frame_num`.
    ///
    /// Untracked regions are always classified. A newly seen object is
    /// classified once; afterwards an interval of 0 never reclassifies and
    /// an interval of N reclassifies once N frames have passed.
    pub fn is_classification_needed(&self, roi: &RegionOfInterest, frame_num: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        state.current_frame = frame_num;

        let Some(id) = roi.object_id else {
            return true;
        };

        if !state.objects.contains_key(&id) {
            state.put(id, frame_num);
            return true;
        }
        if self.reclassify_interval == 0 {
            return false;
        }

        let reclassify_interval = self.reclassify_interval;
        let Some(object) = state.get_mut(id) else {
            return true;
        };
        let elapsed = frame_num.wrapping_sub(object.frame_of_last_update);
        if elapsed >= reclassify_interval as u64 {
            object.frame_of_last_update = frame_num;
            true
        } else {
            false
        }
    }

    /// Remembers the latest result of layer `roi_param.name()` for an object.
    pub fn update_roi_params(&self, object_id: i32, roi_param: &gst::StructureRef) {
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(&object_id) {
            gst::warning!(
                CAT,
                "Classification history size limit is exceeded, object {} will be reclassified",
                object_id
            );
            let current = state.current_frame;
            state.put(object_id, current);
        }
        if let Some(object) = state.get_mut(object_id) {
            object
                .layers
                .insert(roi_param.name().to_string(), roi_param.to_owned());
        }
    }

    /// Copies remembered results onto the tracked ROIs of `buffer` that do
    /// not carry a result for that layer yet.
    ///
    /// Only ROIs whose label passes `object_classes` are filled; an empty
    /// list accepts every label.
    pub fn fill_roi_params(&self, buffer: &mut gst::BufferRef, object_classes: &[String]) {
        let state = self.state.lock().unwrap();
        for mut meta in buffer.iter_meta_mut::<gst_video::VideoRegionOfInterestMeta>() {
            let Some(id) = object_id_of(&meta) else {
                continue;
            };
            if !object_classes.is_empty() && !object_classes.iter().any(|c| c == meta.roi_type()) {
                continue;
            }
            let Some(object) = state.objects.get(&id) else {
                continue;
            };

            let frames_ago = state.current_frame.wrapping_sub(object.frame_of_last_update) as i32;
            for (layer, param) in &object.layers {
                if meta.param(layer).is_some() {
                    continue;
                }
                let mut param = param.clone();
                param.set("frames_ago", frames_ago);
                meta.add_param(param);
            }
        }
    }
}

impl RoiFilter for ClassificationHistory {
    fn is_inference_needed(&self, frame_num: u64, roi: &RegionOfInterest) -> bool {
        self.is_classification_needed(roi, frame_num)
    }
}

/// Reads the tracking id stored by a tracker on a ROI meta.
pub fn object_id_of(meta: &gst_video::VideoRegionOfInterestMeta) -> Option<i32> {
    meta.param("object_id")
        .and_then(|s| s.get::<i32>("id").ok())
        .filter(|id| *id != 0)
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

    fn tracked(id: i32) -> RegionOfInterest {
        RegionOfInterest {
            id: 0,
            rect: Rect::new(0, 0, 10, 10),
            label: Some("car".into()),
            object_id: Some(id),
        }
    }

    #[test]
    fn untracked_regions_are_always_classified() {
        let history = ClassificationHistory::new(0);
        let roi = RegionOfInterest {
            object_id: None,
            ..tracked(1)
        };
        assert!(history.is_classification_needed(&roi, 0));
        assert!(history.is_classification_needed(&roi, 1));
        assert!(history.is_empty());
    }

    #[test]
    fn zero_interval_classifies_each_object_once() {
        let history = ClassificationHistory::new(0);
        assert!(history.is_classification_needed(&tracked(7), 0));
        assert!(!history.is_classification_needed(&tracked(7), 1));
        assert!(!history.is_classification_needed(&tracked(7), 500));
        assert!(history.is_classification_needed(&tracked(8), 500));
    }

    #[test]
    fn interval_reclassifies_every_n_frames() {
        let history = ClassificationHistory::new(3);
        let decisions: Vec<bool> = (0..7)
            .map(|frame| history.is_classification_needed(&tracked(1), frame))
            .collect();
        assert_eq!(decisions, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn least_recently_used_object_is_evicted() {
        let history = ClassificationHistory::new(0);
        for id in 1..=CLASSIFICATION_HISTORY_SIZE as i32 {
            history.is_classification_needed(&tracked(id), 0);
        }
        // Refresh object 1 so object 2 becomes the oldest.
        history.update_roi_params(1, &gst::Structure::new_empty("classification"));
        history.is_classification_needed(&tracked(1000), 1);

        assert_eq!(history.len(), CLASSIFICATION_HISTORY_SIZE);
        assert!(!history.is_classification_needed(&tracked(1), 2));
        assert!(history.is_classification_needed(&tracked(2), 2));
    }

    #[test]
    fn fill_copies_results_with_frames_ago() {
        init();
        let history = ClassificationHistory::new(5);
        assert!(history.is_classification_needed(&tracked(3), 10));
        history.update_roi_params(
            3,
            &gst::Structure::builder("color")
                .field("label", "red")
                .build(),
        );
        assert!(!history.is_classification_needed(&tracked(3), 12));

        let mut buffer = gst::Buffer::new();
        {
            let buffer = buffer.get_mut().unwrap();
            let mut meta = gst_video::VideoRegionOfInterestMeta::add(buffer, "car", (0, 0, 10, 10));
            meta.add_param(gst::Structure::builder("object_id").field("id", 3i32).build());
            gst_video::VideoRegionOfInterestMeta::add(buffer, "car", (20, 20, 10, 10));
        }

        history.fill_roi_params(buffer.get_mut().unwrap(), &[]);

        let metas: Vec<_> = buffer
            .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
            .collect();
        let color = metas[0].param("color").expect("history result attached");
        assert_eq!(color.get::<&str>("label").unwrap(), "red");
        assert_eq!(color.get::<i32>("frames_ago").unwrap(), 2);
        assert!(metas[1].param("color").is_none());
    }
}
