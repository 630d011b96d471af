//! Auto-save of live detections into the history store.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::{Duration, Instant};

use crate::classify::WasteCatalog;
use crate::detect::Detection;
use crate::pipeline::{NullSink, PipelineSink};
use crate::render::RenderedFrame;
use crate::still::encode_jpeg;
use crate::storage::{NewDetectionRecord, RecordedDetection, SharedHistoryStore, SourceKind};

const LIVE_IMAGE_PATH: &str = "live-camera";

/// Sink decorator that forwards every callback and periodically records
/// non-empty detection sets as `camera` history entries.
pub struct HistoryRecorder {
    inner: Box<dyn PipelineSink>,
    store: SharedHistoryStore,
    catalog: WasteCatalog,
    interval: Duration,
    last_saved: Option<Instant>,
    last_annotated: Option<RgbImage>,
    saved: u64,
}

impl HistoryRecorder {
    pub fn new(store: SharedHistoryStore, catalog: WasteCatalog, interval: Duration) -> Self {
        Self {
            inner: Box::new(NullSink),
            store,
            catalog,
            interval,
            last_saved: None,
            last_annotated: None,
            saved: 0,
        }
    }

    pub fn wrapping(mut self, inner: Box<dyn PipelineSink>) -> Self {
        self.inner = inner;
        self
    }

    /// Records written so far.
    pub fn saved(&self) -> u64 {
        self.saved
    }

    fn due(&self, now: Instant) -> bool {
        self.last_saved
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    fn save(&mut self, detections: &[Detection]) -> Result<i64> {
        let result_image_data = match &self.last_annotated {
            Some(image) => Some(encode_jpeg(image)?),
            None => None,
        };
        let record = NewDetectionRecord {
            image_path: LIVE_IMAGE_PATH.to_string(),
            result_image_data,
            detections: self
                .catalog
                .classify_all(detections)
                .iter()
                .map(RecordedDetection::from)
                .collect(),
            confidence_scores: detections.iter().map(|d| d.confidence).collect(),
            source_kind: Some(SourceKind::Camera),
            ..NewDetectionRecord::default()
        };
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("history store lock poisoned"))?;
        store.save_record(record)
    }
}

impl PipelineSink for HistoryRecorder {
    fn on_plain_frame(&mut self, frame: &RgbImage) {
        self.inner.on_plain_frame(frame);
    }

    fn on_annotated_frame(&mut self, frame: &RenderedFrame) {
        self.last_annotated = if frame.labels.is_empty() {
            None
        } else {
            Some(frame.image.clone())
        };
        self.inner.on_annotated_frame(frame);
    }

    fn on_detections(&mut self, detections: &[Detection]) {
        self.inner.on_detections(detections);
        let now = Instant::now();
        if detections.is_empty() || !self.due(now) {
            return;
        }
        // Failed saves also wait out the interval.
        self.last_saved = Some(now);
        match self.save(detections) {
            Ok(id) => {
                self.saved += 1;
                log::debug!("recorder: saved {} detections as record {}", detections.len(), id);
            }
            Err(err) => log::warn!("recorder: history save failed: {:#}", err),
        }
    }
}
