//! Detection history and user feedback persistence.
//!
//! Two stores implement `HistoryStore`: SQLite for real use and an in-memory
//! store for tests and ephemeral sessions. Detection payload lists are kept as
//! JSON text so the schema stays stable as the detection fields evolve.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::classify::{ClassifiedDetection, WasteCategory};

const SECONDS_PER_DAY: i64 = 86_400;

pub(crate) fn now_s() -> Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64)
}

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// Where a detection record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Upload,
    Camera,
    ManualSave,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Upload => "upload",
            SourceKind::Camera => "camera",
            SourceKind::ManualSave => "manual_save",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "upload" => Ok(SourceKind::Upload),
            "camera" => Ok(SourceKind::Camera),
            "manual_save" | "manual" => Ok(SourceKind::ManualSave),
            other => Err(anyhow!("unknown source kind '{}'", other)),
        }
    }
}

/// One classified detection as persisted; box in source-image pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedDetection {
    pub class_name: String,
    pub display_name: String,
    pub category: Option<WasteCategory>,
    pub tips: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<&ClassifiedDetection> for RecordedDetection {
    fn from(c: &ClassifiedDetection) -> Self {
        let bbox = c.detection.bbox;
        Self {
            class_name: c.detection.class_name.clone(),
            display_name: c.display_name.clone(),
            category: c.category,
            tips: c.tips.clone(),
            confidence: c.detection.confidence,
            x: bbox.x1,
            y: bbox.y1,
            width: bbox.width(),
            height: bbox.height(),
        }
    }
}

/// Input for `HistoryStore::save_record`.
#[derive(Clone, Debug, Default)]
pub struct NewDetectionRecord {
    pub image_path: String,
    pub image_data: Option<Vec<u8>>,
    pub result_image_path: Option<String>,
    pub result_image_data: Option<Vec<u8>>,
    pub detections: Vec<RecordedDetection>,
    pub confidence_scores: Vec<f32>,
    pub processing_time_s: f64,
    pub source_kind: Option<SourceKind>,
    /// Unix seconds; defaults to now.
    pub detected_at: Option<i64>,
}

impl NewDetectionRecord {
    pub fn new(source_kind: SourceKind, image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            source_kind: Some(source_kind),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub image_path: String,
    /// Hex SHA-256 of the stored original image, when one was stored.
    pub image_sha256: Option<String>,
    pub result_image_path: Option<String>,
    pub detections: Vec<RecordedDetection>,
    pub confidence_scores: Vec<f32>,
    pub processing_time_s: f64,
    pub source_kind: SourceKind,
    pub detected_at: i64,
    pub created_at: i64,
}

// ----------------------------------------------------------------------------
// Feedback
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct NewFeedback {
    pub detection_id: Option<i64>,
    pub item_name: String,
    pub predicted_category: String,
    pub is_correct: bool,
    pub correct_category: Option<String>,
    /// 1..=5 when present.
    pub satisfaction: Option<u8>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeedbackRecord {
    pub id: i64,
    pub detection_id: Option<i64>,
    pub item_name: String,
    pub predicted_category: String,
    pub is_correct: bool,
    pub correct_category: Option<String>,
    pub satisfaction: Option<u8>,
    pub comment: Option<String>,
    pub feedback_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CategoryAccuracy {
    pub category: String,
    pub total: u64,
    pub correct: u64,
    pub accuracy_pct: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total: u64,
    pub correct: u64,
    pub incorrect: u64,
    pub accuracy_pct: f64,
    /// Mean of the ratings given; 0 when nobody rated.
    pub average_satisfaction: f64,
    pub by_category: Vec<CategoryAccuracy>,
    /// Counts for ratings 1 through 5.
    pub satisfaction_distribution: [u64; 5],
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn validate_feedback(feedback: &NewFeedback) -> Result<()> {
    if feedback.item_name.trim().is_empty() {
        return Err(anyhow!("feedback item name must not be empty"));
    }
    if let Some(score) = feedback.satisfaction {
        if !(1..=5).contains(&score) {
            return Err(anyhow!("satisfaction must be between 1 and 5, got {}", score));
        }
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ----------------------------------------------------------------------------
// Store trait
// ----------------------------------------------------------------------------

pub trait HistoryStore: Send {
    fn save_record(&mut self, record: NewDetectionRecord) -> Result<i64>;

    /// Newest first.
    fn list_records(
        &self,
        limit: usize,
        offset: usize,
        source: Option<SourceKind>,
    ) -> Result<Vec<DetectionRecord>>;

    /// Records detected strictly after `after_s`, newest first.
    fn list_records_after(
        &self,
        after_s: i64,
        source: Option<SourceKind>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>>;

    fn count_records(&self, source: Option<SourceKind>) -> Result<u64>;

    fn latest_detection_time(&self, source: Option<SourceKind>) -> Result<Option<i64>>;

    /// Returns false when no record had that id.
    fn delete_record(&mut self, id: i64) -> Result<bool>;

    fn image_data(&self, id: i64) -> Result<Option<Vec<u8>>>;

    fn result_image_data(&self, id: i64) -> Result<Option<Vec<u8>>>;

    /// Delete records detected more than `days` days ago; returns how many.
    fn clear_older_than(&mut self, days: u32) -> Result<usize>;

    fn save_feedback(&mut self, feedback: NewFeedback) -> Result<i64>;

    /// Newest first.
    fn list_feedback(&self, limit: usize, offset: usize) -> Result<Vec<FeedbackRecord>>;

    fn feedback_stats(&self) -> Result<FeedbackStats>;

    /// Distinct detection ids that received feedback.
    fn feedback_detection_ids(&self) -> Result<Vec<i64>>;

    fn delete_feedback(&mut self, id: i64) -> Result<bool>;
}

/// Store shared between a recorder sink and its owner.
pub type SharedHistoryStore = Arc<Mutex<dyn HistoryStore>>;

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub struct SqliteHistoryStore {
    conn: Connection,
}

const RECORD_COLUMNS: &str = "id, image_path, image_sha256, result_image_path, detections_json, \
     confidence_json, processing_time_s, source_kind, detected_at, created_at";

const FEEDBACK_COLUMNS: &str = "id, detection_id, item_name, predicted_category, is_correct, \
     correct_category, satisfaction, comment, feedback_at";

impl SqliteHistoryStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open history database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS detection_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              image_path TEXT NOT NULL,
              image_data BLOB,
              image_sha256 TEXT,
              result_image_path TEXT,
              result_image_data BLOB,
              detections_json TEXT NOT NULL,
              confidence_json TEXT NOT NULL,
              processing_time_s REAL NOT NULL,
              source_kind TEXT NOT NULL
                CHECK (source_kind IN ('upload', 'camera', 'manual_save')),
              detected_at INTEGER NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection_feedback (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_id INTEGER REFERENCES detection_history(id) ON DELETE SET NULL,
              item_name TEXT NOT NULL,
              predicted_category TEXT NOT NULL,
              is_correct INTEGER NOT NULL,
              correct_category TEXT,
              satisfaction INTEGER CHECK (satisfaction IS NULL OR satisfaction BETWEEN 1 AND 5),
              comment TEXT,
              feedback_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_detected ON detection_history(detected_at);
            CREATE INDEX IF NOT EXISTS idx_history_source ON detection_history(source_kind);
            CREATE INDEX IF NOT EXISTS idx_feedback_time ON detection_feedback(feedback_at);
            CREATE INDEX IF NOT EXISTS idx_feedback_category ON detection_feedback(predicted_category);
            "#,
        )?;
        Ok(())
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            id: row.get(0)?,
            image_path: row.get(1)?,
            image_sha256: row.get(2)?,
            result_image_path: row.get(3)?,
            detections_json: row.get(4)?,
            confidence_json: row.get(5)?,
            processing_time_s: row.get(6)?,
            source_kind: row.get(7)?,
            detected_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<FeedbackRecord> {
        let satisfaction: Option<i64> = row.get(6)?;
        Ok(FeedbackRecord {
            id: row.get(0)?,
            detection_id: row.get(1)?,
            item_name: row.get(2)?,
            predicted_category: row.get(3)?,
            is_correct: row.get::<_, i64>(4)? != 0,
            correct_category: row.get(5)?,
            satisfaction: satisfaction.and_then(|s| u8::try_from(s).ok()),
            comment: row.get(7)?,
            feedback_at: row.get(8)?,
        })
    }

    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DetectionRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, Self::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawRecord::decode).collect()
    }

    fn blob(&self, column: &str, id: i64) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT {} FROM detection_history WHERE id = ?1", column);
        let blob: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;
        Ok(blob.flatten())
    }
}

struct RawRecord {
    id: i64,
    image_path: String,
    image_sha256: Option<String>,
    result_image_path: Option<String>,
    detections_json: String,
    confidence_json: String,
    processing_time_s: f64,
    source_kind: String,
    detected_at: i64,
    created_at: i64,
}

impl RawRecord {
    fn decode(self) -> Result<DetectionRecord> {
        let detections = serde_json::from_str(&self.detections_json)
            .with_context(|| format!("corrupt detections payload in record {}", self.id))?;
        let confidence_scores = serde_json::from_str(&self.confidence_json)
            .with_context(|| format!("corrupt confidence payload in record {}", self.id))?;
        Ok(DetectionRecord {
            id: self.id,
            image_path: self.image_path,
            image_sha256: self.image_sha256,
            result_image_path: self.result_image_path,
            detections,
            confidence_scores,
            processing_time_s: self.processing_time_s,
            source_kind: self.source_kind.parse()?,
            detected_at: self.detected_at,
            created_at: self.created_at,
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn save_record(&mut self, record: NewDetectionRecord) -> Result<i64> {
        let now = now_s()?;
        let source_kind = record.source_kind.unwrap_or(SourceKind::Upload);
        let detections_json = serde_json::to_string(&record.detections)?;
        let confidence_json = serde_json::to_string(&record.confidence_scores)?;
        let image_sha256 = record.image_data.as_deref().map(sha256_hex);

        self.conn.execute(
            r#"
            INSERT INTO detection_history(image_path, image_data, image_sha256, result_image_path,
              result_image_data, detections_json, confidence_json, processing_time_s, source_kind,
              detected_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.image_path,
                record.image_data,
                image_sha256,
                record.result_image_path,
                record.result_image_data,
                detections_json,
                confidence_json,
                record.processing_time_s,
                source_kind.as_str(),
                record.detected_at.unwrap_or(now),
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        log::debug!("history: saved {} record {} ({})", source_kind, id, record.image_path);
        Ok(id)
    }

    fn list_records(
        &self,
        limit: usize,
        offset: usize,
        source: Option<SourceKind>,
    ) -> Result<Vec<DetectionRecord>> {
        let limit = limit as i64;
        let offset = offset as i64;
        match source {
            Some(kind) => self.query_records(
                &format!(
                    "SELECT {} FROM detection_history WHERE source_kind = ?1 \
                     ORDER BY detected_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                    RECORD_COLUMNS
                ),
                &[&kind.as_str(), &limit, &offset],
            ),
            None => self.query_records(
                &format!(
                    "SELECT {} FROM detection_history \
                     ORDER BY detected_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    RECORD_COLUMNS
                ),
                &[&limit, &offset],
            ),
        }
    }

    fn list_records_after(
        &self,
        after_s: i64,
        source: Option<SourceKind>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>> {
        let limit = limit as i64;
        match source {
            Some(kind) => self.query_records(
                &format!(
                    "SELECT {} FROM detection_history WHERE detected_at > ?1 AND source_kind = ?2 \
                     ORDER BY detected_at DESC, id DESC LIMIT ?3",
                    RECORD_COLUMNS
                ),
                &[&after_s, &kind.as_str(), &limit],
            ),
            None => self.query_records(
                &format!(
                    "SELECT {} FROM detection_history WHERE detected_at > ?1 \
                     ORDER BY detected_at DESC, id DESC LIMIT ?2",
                    RECORD_COLUMNS
                ),
                &[&after_s, &limit],
            ),
        }
    }

    fn count_records(&self, source: Option<SourceKind>) -> Result<u64> {
        let count: i64 = match source {
            Some(kind) => self.conn.query_row(
                "SELECT COUNT(*) FROM detection_history WHERE source_kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM detection_history", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    fn latest_detection_time(&self, source: Option<SourceKind>) -> Result<Option<i64>> {
        let latest: Option<i64> = match source {
            Some(kind) => self.conn.query_row(
                "SELECT MAX(detected_at) FROM detection_history WHERE source_kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT MAX(detected_at) FROM detection_history",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(latest)
    }

    fn delete_record(&mut self, id: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM detection_history WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn image_data(&self, id: i64) -> Result<Option<Vec<u8>>> {
        self.blob("image_data", id)
    }

    fn result_image_data(&self, id: i64) -> Result<Option<Vec<u8>>> {
        self.blob("result_image_data", id)
    }

    fn clear_older_than(&mut self, days: u32) -> Result<usize> {
        let cutoff = now_s()? - days as i64 * SECONDS_PER_DAY;
        let removed = self.conn.execute(
            "DELETE FROM detection_history WHERE detected_at < ?1",
            params![cutoff],
        )?;
        log::info!("history: removed {} records older than {} days", removed, days);
        Ok(removed)
    }

    fn save_feedback(&mut self, feedback: NewFeedback) -> Result<i64> {
        validate_feedback(&feedback)?;
        self.conn.execute(
            r#"
            INSERT INTO detection_feedback(detection_id, item_name, predicted_category, is_correct,
              correct_category, satisfaction, comment, feedback_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                feedback.detection_id,
                feedback.item_name,
                feedback.predicted_category,
                feedback.is_correct as i64,
                feedback.correct_category,
                feedback.satisfaction.map(i64::from),
                feedback.comment,
                now_s()?
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_feedback(&self, limit: usize, offset: usize) -> Result<Vec<FeedbackRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM detection_feedback ORDER BY feedback_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            FEEDBACK_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], Self::feedback_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn feedback_stats(&self) -> Result<FeedbackStats> {
        let (total, correct): (i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), SUM(is_correct) FROM detection_feedback",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let average: Option<f64> = self.conn.query_row(
            "SELECT AVG(satisfaction) FROM detection_feedback WHERE satisfaction IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT predicted_category, COUNT(*), SUM(is_correct) FROM detection_feedback \
             GROUP BY predicted_category ORDER BY predicted_category",
        )?;
        let by_category = stmt
            .query_map([], |row| {
                let total: i64 = row.get(1)?;
                let correct: i64 = row.get(2)?;
                Ok(CategoryAccuracy {
                    category: row.get(0)?,
                    total: total as u64,
                    correct: correct as u64,
                    accuracy_pct: percent(correct as u64, total as u64),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut distribution = [0u64; 5];
        let mut stmt = self.conn.prepare(
            "SELECT satisfaction, COUNT(*) FROM detection_feedback \
             WHERE satisfaction IS NOT NULL GROUP BY satisfaction",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let score: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            if (1..=5).contains(&score) {
                distribution[(score - 1) as usize] = count as u64;
            }
        }

        let total = total as u64;
        let correct = correct.unwrap_or(0) as u64;
        Ok(FeedbackStats {
            total,
            correct,
            incorrect: total - correct,
            accuracy_pct: percent(correct, total),
            average_satisfaction: average.map(round2).unwrap_or(0.0),
            by_category,
            satisfaction_distribution: distribution,
        })
    }

    fn feedback_detection_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT detection_id FROM detection_feedback \
             WHERE detection_id IS NOT NULL ORDER BY detection_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn delete_feedback(&mut self, id: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM detection_feedback WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

struct StoredRecord {
    record: DetectionRecord,
    image_data: Option<Vec<u8>>,
    result_image_data: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: Vec<StoredRecord>,
    feedback: Vec<FeedbackRecord>,
    next_record_id: i64,
    next_feedback_id: i64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first<'a>(
        &'a self,
        source: Option<SourceKind>,
    ) -> impl Iterator<Item = &'a DetectionRecord> + 'a {
        let mut matching: Vec<&DetectionRecord> = self
            .records
            .iter()
            .map(|s| &s.record)
            .filter(|r| source.map_or(true, |kind| r.source_kind == kind))
            .collect();
        matching.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(b.id.cmp(&a.id)));
        matching.into_iter()
    }

    fn stored(&self, id: i64) -> Option<&StoredRecord> {
        self.records.iter().find(|s| s.record.id == id)
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn save_record(&mut self, record: NewDetectionRecord) -> Result<i64> {
        let now = now_s()?;
        self.next_record_id += 1;
        let id = self.next_record_id;
        self.records.push(StoredRecord {
            record: DetectionRecord {
                id,
                image_sha256: record.image_data.as_deref().map(sha256_hex),
                image_path: record.image_path,
                result_image_path: record.result_image_path,
                detections: record.detections,
                confidence_scores: record.confidence_scores,
                processing_time_s: record.processing_time_s,
                source_kind: record.source_kind.unwrap_or(SourceKind::Upload),
                detected_at: record.detected_at.unwrap_or(now),
                created_at: now,
            },
            image_data: record.image_data,
            result_image_data: record.result_image_data,
        });
        Ok(id)
    }

    fn list_records(
        &self,
        limit: usize,
        offset: usize,
        source: Option<SourceKind>,
    ) -> Result<Vec<DetectionRecord>> {
        Ok(self
            .newest_first(source)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_records_after(
        &self,
        after_s: i64,
        source: Option<SourceKind>,
        limit: usize,
    ) -> Result<Vec<DetectionRecord>> {
        Ok(self
            .newest_first(source)
            .filter(|r| r.detected_at > after_s)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count_records(&self, source: Option<SourceKind>) -> Result<u64> {
        Ok(self.newest_first(source).count() as u64)
    }

    fn latest_detection_time(&self, source: Option<SourceKind>) -> Result<Option<i64>> {
        Ok(self.newest_first(source).map(|r| r.detected_at).max())
    }

    fn delete_record(&mut self, id: i64) -> Result<bool> {
        let before = self.records.len();
        self.records.retain(|s| s.record.id != id);
        let removed = self.records.len() != before;
        if removed {
            for fb in self.feedback.iter_mut().filter(|f| f.detection_id == Some(id)) {
                fb.detection_id = None;
            }
        }
        Ok(removed)
    }

    fn image_data(&self, id: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.stored(id).and_then(|s| s.image_data.clone()))
    }

    fn result_image_data(&self, id: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.stored(id).and_then(|s| s.result_image_data.clone()))
    }

    fn clear_older_than(&mut self, days: u32) -> Result<usize> {
        let cutoff = now_s()? - days as i64 * SECONDS_PER_DAY;
        let doomed: Vec<i64> = self
            .records
            .iter()
            .filter(|s| s.record.detected_at < cutoff)
            .map(|s| s.record.id)
            .collect();
        for id in &doomed {
            self.delete_record(*id)?;
        }
        Ok(doomed.len())
    }

    fn save_feedback(&mut self, feedback: NewFeedback) -> Result<i64> {
        validate_feedback(&feedback)?;
        self.next_feedback_id += 1;
        let id = self.next_feedback_id;
        self.feedback.push(FeedbackRecord {
            id,
            detection_id: feedback.detection_id,
            item_name: feedback.item_name,
            predicted_category: feedback.predicted_category,
            is_correct: feedback.is_correct,
            correct_category: feedback.correct_category,
            satisfaction: feedback.satisfaction,
            comment: feedback.comment,
            feedback_at: now_s()?,
        });
        Ok(id)
    }

    fn list_feedback(&self, limit: usize, offset: usize) -> Result<Vec<FeedbackRecord>> {
        let mut all: Vec<&FeedbackRecord> = self.feedback.iter().collect();
        all.sort_by(|a, b| b.feedback_at.cmp(&a.feedback_at).then(b.id.cmp(&a.id)));
        Ok(all.into_iter().skip(offset).take(limit).cloned().collect())
    }

    fn feedback_stats(&self) -> Result<FeedbackStats> {
        let total = self.feedback.len() as u64;
        let correct = self.feedback.iter().filter(|f| f.is_correct).count() as u64;

        let ratings: Vec<u8> = self.feedback.iter().filter_map(|f| f.satisfaction).collect();
        let average_satisfaction = if ratings.is_empty() {
            0.0
        } else {
            round2(ratings.iter().map(|&s| s as f64).sum::<f64>() / ratings.len() as f64)
        };
        let mut distribution = [0u64; 5];
        for score in ratings.iter().filter(|s| (1..=5).contains(*s)) {
            distribution[(*score - 1) as usize] += 1;
        }

        let mut grouped: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for fb in &self.feedback {
            let entry = grouped.entry(fb.predicted_category.as_str()).or_default();
            entry.0 += 1;
            if fb.is_correct {
                entry.1 += 1;
            }
        }
        let by_category = grouped
            .into_iter()
            .map(|(category, (total, correct))| CategoryAccuracy {
                category: category.to_string(),
                total,
                correct,
                accuracy_pct: percent(correct, total),
            })
            .collect();

        Ok(FeedbackStats {
            total,
            correct,
            incorrect: total - correct,
            accuracy_pct: percent(correct, total),
            average_satisfaction,
            by_category,
            satisfaction_distribution: distribution,
        })
    }

    fn feedback_detection_ids(&self) -> Result<Vec<i64>> {
        let ids: BTreeSet<i64> = self.feedback.iter().filter_map(|f| f.detection_id).collect();
        Ok(ids.into_iter().collect())
    }

    fn delete_feedback(&mut self, id: i64) -> Result<bool> {
        let before = self.feedback.len();
        self.feedback.retain(|f| f.id != id);
        Ok(self.feedback.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bottle() -> RecordedDetection {
        RecordedDetection {
            class_name: "bottle".into(),
            display_name: "Plastic bottle".into(),
            category: Some(WasteCategory::Recyclable),
            tips: String::new(),
            confidence: 0.9,
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
        }
    }

    fn record(kind: SourceKind, detected_at: i64) -> NewDetectionRecord {
        NewDetectionRecord {
            detections: vec![bottle()],
            confidence_scores: vec![0.9],
            detected_at: Some(detected_at),
            ..NewDetectionRecord::new(kind, "img.jpg")
        }
    }

    fn exercise(store: &mut dyn HistoryStore) -> Result<()> {
        let now = now_s()?;
        let old = store.save_record(record(SourceKind::Upload, now - 40 * SECONDS_PER_DAY))?;
        let cam = store.save_record(record(SourceKind::Camera, now - 10))?;
        let mut with_image = record(SourceKind::ManualSave, now);
        with_image.image_data = Some(b"abc".to_vec());
        with_image.result_image_data = Some(vec![1, 2, 3]);
        let manual = store.save_record(with_image)?;

        let all = store.list_records(10, 0, None)?;
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![manual, cam, old]);
        assert_eq!(all[0].detections, vec![bottle()]);
        assert_eq!(
            all[0].image_sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(store.list_records(1, 1, None)?[0].id, cam);
        assert_eq!(store.count_records(Some(SourceKind::Camera))?, 1);
        assert_eq!(store.latest_detection_time(Some(SourceKind::Camera))?, Some(now - 10));
        assert_eq!(store.list_records_after(now - 20, None, 10)?.len(), 2);
        assert_eq!(store.image_data(manual)?, Some(b"abc".to_vec()));
        assert_eq!(store.result_image_data(cam)?, None);

        let fb = store.save_feedback(NewFeedback {
            detection_id: Some(cam),
            item_name: "bottle".into(),
            predicted_category: "recyclable".into(),
            is_correct: true,
            satisfaction: Some(4),
            ..NewFeedback::default()
        })?;
        store.save_feedback(NewFeedback {
            item_name: "battery".into(),
            predicted_category: "other".into(),
            is_correct: false,
            correct_category: Some("hazardous".into()),
            satisfaction: Some(2),
            ..NewFeedback::default()
        })?;
        assert!(store
            .save_feedback(NewFeedback {
                item_name: "x".into(),
                satisfaction: Some(6),
                ..NewFeedback::default()
            })
            .is_err());

        let stats = store.feedback_stats()?;
        assert_eq!((stats.total, stats.correct, stats.incorrect), (2, 1, 1));
        assert!((stats.accuracy_pct - 50.0).abs() < 1e-9);
        assert!((stats.average_satisfaction - 3.0).abs() < 1e-9);
        assert_eq!(stats.satisfaction_distribution, [0, 1, 0, 1, 0]);
        assert_eq!(stats.by_category.len(), 2);
        assert_eq!(store.feedback_detection_ids()?, vec![cam]);

        assert!(store.delete_record(cam)?);
        assert!(!store.delete_record(cam)?);
        assert!(store.feedback_detection_ids()?.is_empty());
        assert_eq!(store.list_feedback(10, 0)?.len(), 2);
        assert!(store.delete_feedback(fb)?);

        assert_eq!(store.clear_older_than(30)?, 1);
        assert_eq!(store.count_records(None)?, 1);
        Ok(())
    }

    #[test]
    fn in_memory_store_behaves() -> Result<()> {
        exercise(&mut InMemoryHistoryStore::new())
    }

    #[test]
    fn sqlite_store_behaves() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.db");
        let mut store = SqliteHistoryStore::open(&path.to_string_lossy())?;
        exercise(&mut store)
    }

    #[test]
    fn source_kind_round_trips_names() -> Result<()> {
        for kind in [SourceKind::Upload, SourceKind::Camera, SourceKind::ManualSave] {
            assert_eq!(kind.as_str().parse::<SourceKind>()?, kind);
        }
        assert!("webcam".parse::<SourceKind>().is_err());
        Ok(())
    }
}
