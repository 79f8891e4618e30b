use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info};
use wastecam_common::prediction::{PredictionReport, NO_LABEL};

use crate::error::CollectorError;

/// A report as the collector keeps it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPrediction {
    pub id: i64,
    pub category: String,
    pub confidence: f32,
    pub device_id: String,
    /// Device clock when the report was sent, Unix millis.
    pub timestamp: i64,
    /// Collector receive time, RFC 3339.
    pub received_at: String,
}

/// Aggregates over the in-memory history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionStats {
    pub total_classifications: usize,
    pub category_counts: BTreeMap<String, usize>,
    pub average_confidence: f64,
    pub average_confidence_per_category: BTreeMap<String, f64>,
    pub most_common_category: String,
}

/// SQLite log of every report plus the most recent `history` in memory.
///
/// WAL mode so external readers can query the file while we write.
pub struct PredictionStore {
    conn: Mutex<Connection>,
    recent: Mutex<VecDeque<StoredPrediction>>,
    history: usize,
}

impl PredictionStore {
    /// Open (or create) the database file. Creates the parent directory.
    pub fn open(path: &Path, history: usize) -> Result<Self, CollectorError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| CollectorError::CreateDir(dir.display().to_string(), e))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn, history)?;
        let stored = store.total_stored()?;
        info!(
            path = path.display().to_string(),
            stored,
            restored = store.recent().len(),
            "prediction database opened"
        );
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory(history: usize) -> Result<Self, CollectorError> {
        Self::with_connection(Connection::open_in_memory()?, history)
    }

    fn with_connection(conn: Connection, history: usize) -> Result<Self, CollectorError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS predictions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                category    TEXT    NOT NULL,
                confidence  REAL    NOT NULL,
                device_id   TEXT    NOT NULL,
                timestamp   INTEGER NOT NULL,
                received_at TEXT    NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_category
                ON predictions(category);",
        )?;

        // Warm the history from the newest rows.
        let recent = {
            let mut stmt = conn.prepare(
                "SELECT id, category, confidence, device_id, timestamp, received_at
                 FROM predictions ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![history as i64], |row| {
                Ok(StoredPrediction {
                    id: row.get(0)?,
                    category: row.get(1)?,
                    confidence: row.get::<_, f64>(2)? as f32,
                    device_id: row.get(3)?,
                    timestamp: row.get(4)?,
                    received_at: row.get(5)?,
                })
            })?;
            let mut recent = rows.collect::<rusqlite::Result<VecDeque<_>>>()?;
            recent.make_contiguous().reverse();
            recent
        };

        Ok(Self {
            conn: Mutex::new(conn),
            recent: Mutex::new(recent),
            history,
        })
    }

    /// Persist one report and push it onto the history.
    pub fn insert(
        &self,
        report: &PredictionReport,
        received_at: &str,
    ) -> Result<StoredPrediction, CollectorError> {
        validate(report)?;

        let id = {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute(
                "INSERT INTO predictions (category, confidence, device_id, timestamp, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    report.category,
                    report.confidence as f64,
                    report.device_id,
                    report.timestamp,
                    received_at
                ],
            )?;
            conn.last_insert_rowid()
        };

        let stored = StoredPrediction {
            id,
            category: report.category.clone(),
            confidence: report.confidence,
            device_id: report.device_id.clone(),
            timestamp: report.timestamp,
            received_at: received_at.to_string(),
        };

        let mut recent = self.recent();
        recent.push_back(stored.clone());
        while recent.len() > self.history {
            recent.pop_front();
        }
        debug!(id, category = stored.category, "prediction stored");
        Ok(stored)
    }

    /// Oldest first.
    pub fn recent_predictions(&self) -> Vec<StoredPrediction> {
        self.recent().iter().cloned().collect()
    }

    pub fn stats(&self) -> PredictionStats {
        compute_stats(&self.recent())
    }

    /// Rows on disk, including those aged out of the history.
    pub fn total_stored(&self) -> Result<i64, CollectorError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(conn.query_row("SELECT COUNT(*) FROM predictions", [], |row| row.get(0))?)
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<StoredPrediction>> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate(report: &PredictionReport) -> Result<(), CollectorError> {
    if report.category.trim().is_empty() {
        return Err(CollectorError::Invalid("category must not be empty".into()));
    }
    if !report.confidence.is_finite() || !(0.0..=1.0).contains(&report.confidence) {
        return Err(CollectorError::Invalid(format!(
            "confidence {} outside [0, 1]",
            report.confidence
        )));
    }
    Ok(())
}

/// Ties for the most common category go to the alphabetically first.
fn compute_stats(predictions: &VecDeque<StoredPrediction>) -> PredictionStats {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut total = 0.0;
    for p in predictions {
        *counts.entry(p.category.clone()).or_default() += 1;
        *sums.entry(p.category.clone()).or_default() += p.confidence as f64;
        total += p.confidence as f64;
    }

    let mut most_common = NO_LABEL.to_string();
    let mut best = 0;
    for (category, &count) in &counts {
        if count > best {
            best = count;
            most_common = category.clone();
        }
    }

    let per_category = sums
        .into_iter()
        .map(|(category, sum)| {
            let n = counts.get(&category).copied().unwrap_or(1) as f64;
            (category, sum / n)
        })
        .collect();

    PredictionStats {
        total_classifications: predictions.len(),
        category_counts: counts,
        average_confidence: if predictions.is_empty() {
            0.0
        } else {
            total / predictions.len() as f64
        },
        average_confidence_per_category: per_category,
        most_common_category: most_common,
    }
}
