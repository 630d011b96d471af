use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// One detected object.
///
/// `bbox` is in whatever coordinate space the producing stage works in:
/// detector-input space straight out of a backend, display space after the
/// coordinate mapper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: u32, class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }

    /// Same detection, different box.
    pub fn with_bbox(&self, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            ..self.clone()
        }
    }

    /// Text drawn next to the box, e.g. `bottle 0.87`.
    pub fn label(&self) -> String {
        format!("{} {:.2}", self.class_name, self.confidence)
    }
}

/// Per-class greedy non-maximum suppression.
///
/// Candidates are visited in descending confidence order; a candidate is dropped
/// when it overlaps an already kept box of the same class by more than
/// `iou_threshold`.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, confidence: f32, x1: f32) -> Detection {
        Detection::new(
            class_id,
            format!("c{class_id}"),
            confidence,
            BoundingBox::new(x1, 0.0, x1 + 10.0, 10.0),
        )
    }

    #[test]
    fn nms_keeps_strongest_of_overlapping_same_class() {
        let kept = non_max_suppression(vec![det(0, 0.6, 1.0), det(0, 0.9, 0.0)], 0.45);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn nms_never_suppresses_across_classes() {
        let kept = non_max_suppression(vec![det(0, 0.9, 0.0), det(1, 0.8, 0.0)], 0.45);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn label_uses_two_decimals() {
        assert_eq!(det(0, 0.876, 0.0).label(), "c0 0.88");
    }
}
