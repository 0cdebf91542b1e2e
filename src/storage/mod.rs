//! Persistence layer — SQLite behind `sqlx`.
//!
//! Three tables back the coordinator's durable data: `detections`,
//! `gsm_contacts`, and `alerts`. Detection and alert writes arrive through
//! an unbounded channel drained by a dedicated log-sink task, so the State
//! Store's hot path never waits on disk. Write failures are counted and
//! surfaced via `/api/status`; they never touch in-memory state.
//!
//! Opening the database is the one fatal persistence error: a coordinator
//! that cannot log safety events should not come up at all.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{Detection, GsmContact, GsmMode, HazardCategory};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One record bound for the durable log.
#[derive(Debug, Clone)]
pub enum LogRecord {
    Detection(Detection),
    Alert { state: String, reason: String },
    ContactAdded(GsmContact),
    ContactDeleted { number: String },
}

/// A detection row read back from the history table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
    pub bbox: Vec<f64>,
    pub frame_id: i64,
}

/// Shared handle to the database pool and write-failure counter.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    write_failures: Arc<AtomicU64>,
}

impl Storage {
    /// Open (or create) the database and run schema setup.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = Self {
            pool,
            write_failures: Arc::new(AtomicU64::new(0)),
        };
        storage.init_schema().await?;
        info!(path = %path.display(), "Storage opened");
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                class TEXT NOT NULL,
                confidence REAL NOT NULL,
                bbox TEXT NOT NULL,
                frame_id INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS gsm_contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mode TEXT NOT NULL,
                number TEXT NOT NULL,
                name TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'general'
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                state TEXT NOT NULL,
                reason TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Detection/alert log writes dropped or failed so far.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Log Sink
    // ========================================================================

    /// Create the log-sink channel and its drain task.
    ///
    /// The task applies records until cancelled, then drains whatever is
    /// still queued before exiting — a clean shutdown loses nothing.
    pub fn spawn_log_sink(
        &self,
        cancel: CancellationToken,
    ) -> (mpsc::UnboundedSender<LogRecord>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        let storage = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    record = rx.recv() => match record {
                        Some(record) => storage.apply(record).await,
                        None => return,
                    },
                }
            }
            // Drain remaining records on shutdown.
            rx.close();
            while let Ok(record) = rx.try_recv() {
                storage.apply(record).await;
            }
            debug!("Log sink drained and stopped");
        });

        (tx, handle)
    }

    async fn apply(&self, record: LogRecord) {
        let result = match record {
            LogRecord::Detection(d) => self.log_detection(&d).await,
            LogRecord::Alert { state, reason } => self.log_alert(&state, &reason).await,
            LogRecord::ContactAdded(c) => self.insert_contact(&c).await,
            LogRecord::ContactDeleted { number } => self.delete_contact(&number).await,
        };
        if let Err(e) = result {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Persistence write failed");
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    async fn log_detection(&self, detection: &Detection) -> Result<(), StorageError> {
        let bbox = serde_json::to_string(&detection.bbox)?;
        sqlx::query(
            "INSERT INTO detections (ts, class, confidence, bbox, frame_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&detection.class_name)
        .bind(detection.confidence)
        .bind(bbox)
        .bind(detection.frame_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_alert(&self, state: &str, reason: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO alerts (ts, state, reason) VALUES (?, ?, ?)")
            .bind(Utc::now().to_rfc3339())
            .bind(state)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_contact(&self, contact: &GsmContact) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO gsm_contacts (mode, number, name, message, category) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(contact.mode.as_str())
        .bind(&contact.number)
        .bind(&contact.name)
        .bind(&contact.message)
        .bind(contact.category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_contact(&self, number: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM gsm_contacts WHERE number = ?")
            .bind(number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Load all stored contacts, insertion order.
    pub async fn load_contacts(&self) -> Result<Vec<GsmContact>, StorageError> {
        let rows = sqlx::query(
            "SELECT mode, number, name, message, category FROM gsm_contacts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut contacts = Vec::with_capacity(rows.len());
        for row in rows {
            let mode: String = row.get("mode");
            let category: String = row.get("category");
            let Some(mode) = GsmMode::parse(&mode) else {
                warn!(mode = %mode, "Skipping contact row with unknown mode");
                continue;
            };
            contacts.push(GsmContact {
                mode,
                number: row.get("number"),
                name: row.get("name"),
                message: row.get("message"),
                category: HazardCategory::parse(&category).unwrap_or_default(),
            });
        }
        Ok(contacts)
    }

    /// Detection history, most recent first.
    pub async fn detection_history(&self, limit: i64) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, ts, class, confidence, bbox, frame_id FROM detections ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let bbox_json: String = row.get("bbox");
            entries.push(HistoryEntry {
                id: row.get("id"),
                timestamp: row.get("ts"),
                class_name: row.get("class"),
                confidence: row.get("confidence"),
                bbox: serde_json::from_str(&bbox_json).unwrap_or_default(),
                frame_id: row.get("frame_id"),
            });
        }
        Ok(entries)
    }

    /// Alert transition log, most recent first.
    pub async fn alert_log(&self, limit: i64) -> Result<Vec<serde_json::Value>, StorageError> {
        let rows = sqlx::query("SELECT id, ts, state, reason FROM alerts ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.get::<i64, _>("id"),
                    "timestamp": row.get::<String, _>("ts"),
                    "state": row.get::<String, _>("state"),
                    "reason": row.get::<String, _>("reason"),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("test.db")).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn detection_log_round_trip() {
        let (_dir, storage) = open_temp().await;
        let detection = Detection::new("Fire", 0.91, [10.0, 10.0, 50.0, 50.0], 1);
        storage.log_detection(&detection).await.unwrap();

        let history = storage.detection_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].class_name, "Fire");
        assert_eq!(history[0].bbox, vec![10.0, 10.0, 50.0, 50.0]);
        assert_eq!(history[0].frame_id, 1);
    }

    #[tokio::test]
    async fn contact_insert_delete() {
        let (_dir, storage) = open_temp().await;
        let contact = GsmContact {
            mode: GsmMode::Call,
            number: "+639170000001".to_string(),
            name: "BFP".to_string(),
            message: String::new(),
            category: HazardCategory::Fire,
        };
        storage.insert_contact(&contact).await.unwrap();
        assert_eq!(storage.load_contacts().await.unwrap(), vec![contact.clone()]);

        storage.delete_contact(&contact.number).await.unwrap();
        assert!(storage.load_contacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_sink_drains_on_shutdown() {
        let (_dir, storage) = open_temp().await;
        let cancel = CancellationToken::new();
        let (tx, handle) = storage.spawn_log_sink(cancel.clone());

        for i in 0..5 {
            tx.send(LogRecord::Alert {
                state: "DANGER".to_string(),
                reason: format!("r{i}"),
            })
            .unwrap();
        }
        cancel.cancel();
        handle.await.unwrap();

        let log = storage.alert_log(10).await.unwrap();
        assert_eq!(log.len(), 5);
    }
}
