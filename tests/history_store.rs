use std::sync::{Arc, Mutex};

use image::{Rgb, RgbImage};

use binwise::storage::{HistoryStore, NewDetectionRecord, NewFeedback};
use binwise::{
    BoundingBox, Detection, SharedBackend, SourceKind, SqliteHistoryStore, StillImageDetector,
    StubBackend, WasteCatalog, WasteCategory,
};

fn db_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("history.db").to_string_lossy().into_owned()
}

#[test]
fn records_survive_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir);

    let id = {
        let mut store = SqliteHistoryStore::open(&path)?;
        store.save_record(NewDetectionRecord {
            confidence_scores: vec![0.7, 0.4],
            processing_time_s: 0.12,
            ..NewDetectionRecord::new(SourceKind::ManualSave, "snap.jpg")
        })?
    };

    // Schema creation is idempotent.
    let store = SqliteHistoryStore::open(&path)?;
    let records = store.list_records(10, 0, None)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].source_kind, SourceKind::ManualSave);
    assert_eq!(records[0].confidence_scores, vec![0.7, 0.4]);
    assert!(records[0].image_sha256.is_none());
    assert_eq!(store.count_records(Some(SourceKind::Upload))?, 0);
    Ok(())
}

#[test]
fn deleting_a_record_keeps_its_feedback() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = SqliteHistoryStore::open(&db_path(&dir))?;
    let id = store.save_record(NewDetectionRecord::new(SourceKind::Camera, "live-camera"))?;
    store.save_feedback(NewFeedback {
        detection_id: Some(id),
        item_name: "can".into(),
        predicted_category: "recyclable".into(),
        is_correct: true,
        satisfaction: Some(5),
        ..NewFeedback::default()
    })?;

    assert!(store.delete_record(id)?);
    let feedback = store.list_feedback(10, 0)?;
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].detection_id, None);
    assert_eq!(store.feedback_stats()?.satisfaction_distribution, [0, 0, 0, 0, 1]);
    Ok(())
}

#[test]
fn still_detection_lands_in_history() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image_path = dir.path().join("desk.png");
    RgbImage::from_pixel(320, 240, Rgb([120, 130, 140])).save(&image_path)?;

    let backend: SharedBackend = Arc::new(Mutex::new(
        StubBackend::new(vec!["battery".into()]).with_detections(vec![Detection::new(
            0,
            "battery",
            0.8,
            BoundingBox::new(200.0, 200.0, 300.0, 300.0),
        )]),
    ));
    let detector = StillImageDetector::new(backend, 640, 640)?;
    let result = detector.detect_path(&image_path, 0.5)?;
    assert_eq!(result.detections.len(), 1);

    let mut store = SqliteHistoryStore::open(&db_path(&dir))?;
    let record = result.to_record(&WasteCatalog::builtin(), SourceKind::Upload)?;
    let id = store.save_record(record)?;

    let saved = &store.list_records(1, 0, Some(SourceKind::Upload))?[0];
    assert_eq!(saved.id, id);
    assert_eq!(saved.detections[0].category, Some(WasteCategory::Hazardous));
    assert!(saved.image_sha256.as_ref().map_or(false, |h| h.len() == 64));
    assert_eq!(store.image_data(id)?, Some(std::fs::read(&image_path)?));
    assert!(store.result_image_data(id)?.is_some());
    assert!(store.latest_detection_time(None)?.is_some());
    Ok(())
}
