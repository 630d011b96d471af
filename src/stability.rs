//! Temporal stability filtering.
//!
//! A detection survives only when a majority of the recently seen frames contain
//! a detection of the same class at an overlapping position. This suppresses
//! single-frame false positives at the cost of a couple of frames of latency
//! when an object first appears.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::Detection;

pub const DEFAULT_HISTORY_CAPACITY: usize = 5;
pub const DEFAULT_REQUIRE_FRAMES: usize = 2;
pub const DEFAULT_MATCH_IOU: f32 = 0.3;

/// Fixed-capacity ring of per-frame detection sets, oldest first.
#[derive(Clone, Debug)]
pub struct DetectionHistoryWindow {
    frames: VecDeque<Vec<Detection>>,
    capacity: usize,
}

impl DetectionHistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame's detections, evicting the oldest set when full.
    pub fn push(&mut self, detections: Vec<Detection>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(detections);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<Detection>> {
        self.frames.iter()
    }
}

/// Tuning for `StabilityFilter`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StabilityConfig {
    pub history_capacity: usize,
    /// Frames needed before filtering starts; earlier frames pass through.
    pub require_frames: usize,
    /// Overlap above which two same-class boxes count as the same object.
    pub iou_threshold: f32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            require_frames: DEFAULT_REQUIRE_FRAMES,
            iou_threshold: DEFAULT_MATCH_IOU,
        }
    }
}

/// Majority-vote filter over the last few frames.
#[derive(Clone, Debug)]
pub struct StabilityFilter {
    window: DetectionHistoryWindow,
    require_frames: usize,
    iou_threshold: f32,
}

impl StabilityFilter {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            window: DetectionHistoryWindow::new(config.history_capacity),
            require_frames: config.require_frames,
            iou_threshold: config.iou_threshold,
        }
    }

    pub fn window(&self) -> &DetectionHistoryWindow {
        &self.window
    }

    /// Forget all history, e.g. between sessions.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Record `current` and return the subset corroborated by the window.
    ///
    /// The current frame is part of the window it is scored against.
    pub fn filter(&mut self, current: Vec<Detection>) -> Vec<Detection> {
        self.window.push(current.clone());
        if self.window.len() < self.require_frames {
            return current;
        }

        let needed = self.window.len() / 2;
        current
            .into_iter()
            .filter(|detection| self.score(detection) >= needed)
            .collect()
    }

    /// Number of stored frames holding a match for `detection`.
    pub fn score(&self, detection: &Detection) -> usize {
        self.window
            .iter()
            .filter(|frame| frame.iter().any(|other| self.matches(detection, other)))
            .count()
    }

    fn matches(&self, a: &Detection, b: &Detection) -> bool {
        match pair_overlap(a, b) {
            Ok(Some(iou)) => iou > self.iou_threshold,
            Ok(None) => false,
            Err(err) => {
                log::warn!("stability: treating pair as unmatched: {:#}", err);
                false
            }
        }
    }
}

impl Default for StabilityFilter {
    fn default() -> Self {
        Self::new(StabilityConfig::default())
    }
}

/// IoU of a same-class pair, `None` for different classes.
fn pair_overlap(a: &Detection, b: &Detection) -> Result<Option<f32>> {
    if a.class_id != b.class_id {
        return Ok(None);
    }
    if !a.bbox.is_finite() || !b.bbox.is_finite() {
        return Err(anyhow!(
            "non-finite box in comparison ({:?} vs {:?})",
            a.bbox,
            b.bbox
        ));
    }
    let iou = a.bbox.iou(&b.bbox);
    if !iou.is_finite() {
        return Err(anyhow!("IoU evaluated to {}", iou));
    }
    Ok(Some(iou))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn det(class_id: u32, x1: f32, y1: f32) -> Detection {
        Detection::new(
            class_id,
            format!("c{class_id}"),
            0.9,
            BoundingBox::new(x1, y1, x1 + 50.0, y1 + 50.0),
        )
    }

    #[test]
    fn window_evicts_oldest() {
        let mut window = DetectionHistoryWindow::new(2);
        window.push(vec![det(0, 0.0, 0.0)]);
        window.push(vec![]);
        window.push(vec![det(1, 0.0, 0.0)]);
        assert_eq!(window.len(), 2);
        let first = window.iter().next().cloned().unwrap_or_default();
        assert!(first.is_empty());
    }

    #[test]
    fn cold_start_passes_everything_through() {
        let mut filter = StabilityFilter::new(StabilityConfig {
            require_frames: 3,
            ..StabilityConfig::default()
        });
        let frame = vec![det(0, 0.0, 0.0), det(7, 300.0, 300.0)];
        assert_eq!(filter.filter(frame.clone()), frame);
        assert_eq!(filter.filter(vec![det(2, 10.0, 10.0)]).len(), 1);
    }

    #[test]
    fn majority_vote_keeps_stable_box_and_drops_one_frame_box() {
        let mut filter = StabilityFilter::default();
        let stable = det(3, 100.0, 100.0);
        let blip = det(3, 400.0, 400.0);

        let frames = vec![
            vec![stable.clone()],
            vec![stable.clone()],
            vec![stable.clone()],
            vec![blip.clone()],
            vec![stable.clone()],
        ];
        let mut outputs = Vec::new();
        for frame in frames {
            outputs.push(filter.filter(frame));
        }

        assert!(outputs[3].is_empty(), "frame-4-only box must be suppressed");
        assert_eq!(outputs[4], vec![stable.clone()]);
        assert_eq!(filter.score(&stable), 4);
        assert!(!outputs[4].contains(&blip));
    }

    #[test]
    fn class_mismatch_never_matches() {
        let mut filter = StabilityFilter::default();
        filter.filter(vec![det(1, 0.0, 0.0)]);
        filter.filter(vec![det(1, 0.0, 0.0)]);
        filter.filter(vec![det(1, 0.0, 0.0)]);
        // Same box, other class: only matches itself (1 of 4, needs 2).
        assert!(filter.filter(vec![det(2, 0.0, 0.0)]).is_empty());
    }

    #[test]
    fn score_never_exceeds_window_length() {
        let mut filter = StabilityFilter::default();
        for _ in 0..8 {
            filter.filter(vec![det(0, 0.0, 0.0), det(0, 1.0, 1.0)]);
        }
        assert_eq!(filter.window().len(), 5);
        assert_eq!(filter.score(&det(0, 0.0, 0.0)), 5);
    }

    #[test]
    fn non_finite_boxes_are_treated_as_unmatched() {
        let mut filter = StabilityFilter::default();
        let bad = Detection::new(0, "c0", 0.9, BoundingBox::new(f32::NAN, 0.0, 10.0, 10.0));
        filter.filter(vec![bad.clone()]);
        // Window of 2, needs 1, but the NaN box matches nothing, not even itself.
        assert!(filter.filter(vec![bad]).is_empty());
    }
}
