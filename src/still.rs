//! Single-image detection.
//!
//! Runs one decoded image through the same letterbox and detector as the live
//! pipeline, without temporal filtering. Boxes come back in source-image pixels.

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::classify::WasteCatalog;
use crate::coords::CoordinateMapper;
use crate::detect::{Detection, SharedBackend};
use crate::preprocess::Preprocessor;
use crate::render::{RenderedFrame, Renderer};
use crate::storage::{NewDetectionRecord, RecordedDetection, SourceKind};

/// Outcome of one still-image run.
#[derive(Clone, Debug)]
pub struct StillDetection {
    pub source_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Source-space boxes, highest confidence first.
    pub detections: Vec<Detection>,
    pub annotated: RenderedFrame,
    pub processing_time: Duration,
    /// Encoded bytes of the input, when it was read from disk.
    pub original_bytes: Option<Vec<u8>>,
}

impl StillDetection {
    /// Annotated image as JPEG bytes.
    pub fn annotated_jpeg(&self) -> Result<Vec<u8>> {
        encode_jpeg(&self.annotated.image)
    }

    /// History record for this run with detections classified through `catalog`.
    pub fn to_record(&self, catalog: &WasteCatalog, source_kind: SourceKind) -> Result<NewDetectionRecord> {
        let detections: Vec<RecordedDetection> = catalog
            .classify_all(&self.detections)
            .iter()
            .map(RecordedDetection::from)
            .collect();
        Ok(NewDetectionRecord {
            image_path: self.source_path.display().to_string(),
            image_data: self.original_bytes.clone(),
            result_image_path: None,
            result_image_data: Some(self.annotated_jpeg()?),
            confidence_scores: self.detections.iter().map(|d| d.confidence).collect(),
            detections,
            processing_time_s: self.processing_time.as_secs_f64(),
            source_kind: Some(source_kind),
            detected_at: None,
        })
    }
}

pub(crate) fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("encode jpeg")?;
    Ok(out.into_inner())
}

pub struct StillImageDetector {
    backend: SharedBackend,
    preprocessor: Preprocessor,
    renderer: Renderer,
}

impl StillImageDetector {
    pub fn new(backend: SharedBackend, input_width: u32, input_height: u32) -> Result<Self> {
        Ok(Self {
            backend,
            preprocessor: Preprocessor::new(input_width, input_height)?,
            renderer: Renderer::new(),
        })
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn detect_path(&self, path: &Path, confidence_threshold: f32) -> Result<StillDetection> {
        let bytes = std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("decode image {}", path.display()))?
            .to_rgb8();
        let mut result = self.detect_image(&image, confidence_threshold)?;
        result.source_path = path.to_path_buf();
        result.original_bytes = Some(bytes);
        Ok(result)
    }

    pub fn detect_image(&self, image: &RgbImage, confidence_threshold: f32) -> Result<StillDetection> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                confidence_threshold
            ));
        }
        let started = Instant::now();
        let (tensor, transform) = self.preprocessor.process_image(image)?;
        let raw = {
            let mut backend = self
                .backend
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            backend.infer(&tensor, confidence_threshold)?
        };
        let mut detections = CoordinateMapper::for_source(&transform).map_all(&raw, &transform);
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let annotated = self.renderer.render(image, &detections);
        let processing_time = started.elapsed();
        log::debug!(
            "still: {} detections on {}x{} in {:?}",
            detections.len(),
            image.width(),
            image.height(),
            processing_time
        );

        Ok(StillDetection {
            source_path: PathBuf::new(),
            width: image.width(),
            height: image.height(),
            detections,
            annotated,
            processing_time,
            original_bytes: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::WasteCategory;
    use crate::detect::StubBackend;
    use crate::geometry::BoundingBox;
    use image::Rgb;
    use std::sync::{Arc, Mutex};

    fn detector(detections: Vec<Detection>) -> Result<StillImageDetector> {
        let backend: SharedBackend = Arc::new(Mutex::new(
            StubBackend::new(vec!["bottle".into(), "banana".into()]).with_detections(detections),
        ));
        StillImageDetector::new(backend, 640, 640)
    }

    #[test]
    fn boxes_map_back_to_source_pixels() -> Result<()> {
        // 640x480 source: scale 1, 80px padding top and bottom.
        let still = detector(vec![
            Detection::new(0, "bottle", 0.6, BoundingBox::new(100.0, 180.0, 200.0, 280.0)),
            Detection::new(1, "banana", 0.9, BoundingBox::new(0.0, 100.0, 50.0, 150.0)),
        ])?;
        let image = RgbImage::from_pixel(640, 480, Rgb([10, 10, 10]));
        let result = still.detect_image(&image, 0.5)?;

        assert_eq!((result.width, result.height), (640, 480));
        assert_eq!(result.detections.len(), 2);
        assert_eq!(result.detections[0].class_name, "banana");
        let bottle = &result.detections[1].bbox;
        assert!((bottle.y1 - 100.0).abs() < 1e-3 && (bottle.y2 - 200.0).abs() < 1e-3);
        assert_eq!(result.annotated.labels.len(), 2);
        assert_eq!(result.annotated.image.dimensions(), (640, 480));
        Ok(())
    }

    #[test]
    fn detect_path_builds_a_history_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("input.png");
        RgbImage::from_pixel(64, 48, Rgb([200, 200, 200])).save(&path)?;

        let still = detector(vec![Detection::new(
            0,
            "bottle",
            0.8,
            BoundingBox::new(100.0, 200.0, 300.0, 400.0),
        )])?;
        let result = still.detect_path(&path, 0.4)?;
        let record = result.to_record(&WasteCatalog::builtin(), SourceKind::Upload)?;

        assert_eq!(record.source_kind, Some(SourceKind::Upload));
        assert_eq!(record.confidence_scores, vec![0.8]);
        assert_eq!(record.detections[0].category, Some(WasteCategory::Recyclable));
        assert!(record.image_data.as_ref().map_or(false, |b| !b.is_empty()));
        let jpeg = record.result_image_data.unwrap_or_default();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn threshold_out_of_range_is_rejected() -> Result<()> {
        let still = detector(Vec::new())?;
        assert!(still.detect_image(&RgbImage::new(8, 8), 1.5).is_err());
        Ok(())
    }
}
