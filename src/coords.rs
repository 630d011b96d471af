//! Detector-space to display-space box mapping.

use crate::detect::Detection;
use crate::geometry::BoundingBox;
use crate::preprocess::GeometricTransform;

/// Undoes the letterbox transform and rescales boxes onto a fixed display size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateMapper {
    pub display_width: u32,
    pub display_height: u32,
}

impl CoordinateMapper {
    pub fn new(display_width: u32, display_height: u32) -> Self {
        Self {
            display_width,
            display_height,
        }
    }

    /// Display size equal to the source frame, i.e. plain source coordinates.
    pub fn for_source(transform: &GeometricTransform) -> Self {
        Self::new(transform.source_width, transform.source_height)
    }

    /// Map one detector-space box. `None` when it clamps to an empty box.
    pub fn map_box(&self, bbox: &BoundingBox, transform: &GeometricTransform) -> Option<BoundingBox> {
        if transform.scale <= 0.0 || transform.source_width == 0 || transform.source_height == 0 {
            return None;
        }
        let source = transform.inverse(bbox);
        let sx = self.display_width as f32 / transform.source_width as f32;
        let sy = self.display_height as f32 / transform.source_height as f32;
        let max_x = self.display_width as f32;
        let max_y = self.display_height as f32;

        let mapped = BoundingBox::new(
            (source.x1 * sx).clamp(0.0, max_x),
            (source.y1 * sy).clamp(0.0, max_y),
            (source.x2 * sx).clamp(0.0, max_x),
            (source.y2 * sy).clamp(0.0, max_y),
        );
        // NaN fails both comparisons below, so check explicitly.
        if !mapped.is_finite() || mapped.x1 >= mapped.x2 || mapped.y1 >= mapped.y2 {
            return None;
        }
        Some(mapped)
    }

    pub fn map(&self, detection: &Detection, transform: &GeometricTransform) -> Option<Detection> {
        self.map_box(&detection.bbox, transform)
            .map(|bbox| detection.with_bbox(bbox))
    }

    /// Map a detection set, dropping boxes that clamp away.
    pub fn map_all(&self, detections: &[Detection], transform: &GeometricTransform) -> Vec<Detection> {
        detections
            .iter()
            .filter_map(|d| self.map(d, transform))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::Preprocessor;
    use anyhow::Result;

    #[test]
    fn letterbox_round_trip_within_one_pixel() -> Result<()> {
        let pre = Preprocessor::new(640, 640)?;
        let transform = pre.transform_for(640, 480)?;
        let mapper = CoordinateMapper::for_source(&transform);

        let original = BoundingBox::new(37.0, 52.5, 411.0, 470.0);
        let detector_space = transform.forward(&original);
        let recovered = mapper
            .map_box(&detector_space, &transform)
            .ok_or_else(|| anyhow::anyhow!("box dropped"))?;

        for (a, b) in recovered.to_xyxy().iter().zip(original.to_xyxy()) {
            assert!((a - b).abs() <= 1.0, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn boxes_are_scaled_to_display() -> Result<()> {
        let pre = Preprocessor::new(640, 640)?;
        // 1280x960 -> scale 0.5, content 640x480, pad 80 top.
        let transform = pre.transform_for(1280, 960)?;
        let mapper = CoordinateMapper::new(640, 640);
        let mapped = mapper
            .map_box(&BoundingBox::new(100.0, 180.0, 200.0, 280.0), &transform)
            .ok_or_else(|| anyhow::anyhow!("box dropped"))?;
        // Source (200, 200, 400, 400), display ratio (0.5, 2/3).
        assert!((mapped.x1 - 100.0).abs() < 1e-3);
        assert!((mapped.y1 - 133.333).abs() < 1e-2);
        assert!((mapped.x2 - 200.0).abs() < 1e-3);
        assert!((mapped.y2 - 266.667).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn out_of_range_boxes_are_clamped() -> Result<()> {
        let transform = Preprocessor::new(640, 640)?.transform_for(640, 640)?;
        let mapper = CoordinateMapper::new(640, 640);
        let mapped = mapper
            .map_box(&BoundingBox::new(-20.0, 600.0, 100.0, 700.0), &transform)
            .ok_or_else(|| anyhow::anyhow!("box dropped"))?;
        assert_eq!(mapped, BoundingBox::new(0.0, 600.0, 100.0, 640.0));
        Ok(())
    }

    #[test]
    fn boxes_clamping_to_nothing_are_dropped() -> Result<()> {
        let transform = Preprocessor::new(640, 640)?.transform_for(640, 480)?;
        let mapper = CoordinateMapper::new(640, 640);
        // Entirely inside the top padding band.
        assert!(mapper
            .map_box(&BoundingBox::new(10.0, 0.0, 50.0, 40.0), &transform)
            .is_none());
        // Entirely right of the frame.
        assert!(mapper
            .map_box(&BoundingBox::new(700.0, 100.0, 800.0, 200.0), &transform)
            .is_none());
        let dets = vec![Detection::new(0, "x", 0.5, BoundingBox::new(5.0, 5.0, 5.0, 90.0))];
        assert!(mapper.map_all(&dets, &transform).is_empty());
        Ok(())
    }
}
