//! Axis-aligned box geometry shared by every pipeline stage.

use serde::{Deserialize, Serialize};

/// Added to the union area so degenerate boxes never divide by zero.
pub const IOU_EPSILON: f32 = 1e-6;

/// Axis-aligned bounding box in corner form (x1, y1) - (x2, y2).
///
/// The coordinate space is implied by where the box came from: detector-input
/// space straight out of a backend, source space after the letterbox is
/// undone, display space after the coordinate mapper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    #[inline]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build a box from center form (cx, cy, w, h), the layout YOLO heads emit.
    #[inline]
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area of the box. Inverted boxes have zero area rather than negative.
    #[inline]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Intersection-over-Union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter + IOU_EPSILON;
        inter / union
    }

    /// Corner coordinates as `[x1, y1, x2, y2]`.
    #[inline]
    pub fn to_xyxy(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_boxes_have_unit_iou() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn half_shifted_boxes_have_one_third_iou() {
        // Each box overlaps half of the other: inter = 50, union = 150.
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-4);
        assert!((b.iou(&a) - a.iou(&b)).abs() < f32::EPSILON);
    }

    #[test]
    fn degenerate_boxes_do_not_divide_by_zero() {
        let point = BoundingBox::new(5.0, 5.0, 5.0, 5.0);
        let iou = point.iou(&point);
        assert!(iou.is_finite());
        assert_eq!(iou, 0.0);
    }

    #[test]
    fn center_form_round_trips_extent() {
        let b = BoundingBox::from_center(100.0, 50.0, 40.0, 20.0);
        assert_eq!(b.to_xyxy(), [80.0, 40.0, 120.0, 60.0]);
        assert_eq!(b.area(), 800.0);
    }
}
