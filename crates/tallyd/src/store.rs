//! Persistence of employees, embeddings and the attendance log.

use crate::model::{AttendanceEvent, EventType, NewAttendanceEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use tally_core::{PersonEmbedding, RecognitionStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt attendance row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
    #[error("failed to encode embedding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage consumed by the dispatcher and the attendance gate.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Every stored embedding of every active employee.
    async fn load_all_active_embeddings(&self) -> Result<Vec<PersonEmbedding>, StoreError>;

    /// Append one event atomically and return it with its assigned id.
    async fn append_attendance_event(
        &self,
        event: NewAttendanceEvent,
    ) -> Result<AttendanceEvent, StoreError>;

    async fn latest_event_for(&self, employee_id: i64)
        -> Result<Option<AttendanceEvent>, StoreError>;

    /// Most recent event of every employee that has one.
    async fn latest_event_per_employee(&self)
        -> Result<HashMap<i64, AttendanceEvent>, StoreError>;

    async fn active_employee_count(&self) -> Result<usize, StoreError>;

    async fn employee_name(&self, employee_id: i64) -> Result<Option<String>, StoreError>;

    async fn employee_names(&self) -> Result<HashMap<i64, String>, StoreError>;

    /// Events with `from <= timestamp < to`, newest first.
    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        employee_id: Option<i64>,
    ) -> Result<Vec<AttendanceEvent>, StoreError>;
}

/// Column tuple of an `attendance_log` row before validation.
type RawEvent = (i64, Option<i64>, String, i64, f64, String, String);

const EVENT_COLUMNS: &str =
    "id, employee_id, event_type, timestamp_ms, confidence, trace_id, status";

fn raw_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_event(raw: RawEvent) -> Result<AttendanceEvent, StoreError> {
    let (id, employee_id, event_type, timestamp_ms, confidence, trace_id, status) = raw;
    let corrupt = |reason: String| StoreError::CorruptRow { id, reason };

    Ok(AttendanceEvent {
        id,
        employee_id,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| corrupt(format!("event type {event_type:?}")))?,
        timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .ok_or_else(|| corrupt(format!("timestamp {timestamp_ms}")))?,
        confidence: confidence as f32,
        trace_id,
        status: RecognitionStatus::parse(&status)
            .ok_or_else(|| corrupt(format!("status {status:?}")))?,
    })
}

/// SQLite-backed store; all statements run on tokio-rusqlite's connection thread.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = tokio_rusqlite::Connection::open(db_path).await?;
        let store = Self { conn };
        store.ensure_schema().await?;
        tracing::info!(path = %db_path.display(), "attendance database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS employees (
                      id INTEGER PRIMARY KEY AUTOINCREMENT,
                      full_name TEXT NOT NULL,
                      is_active INTEGER NOT NULL DEFAULT 1
                    );

                    CREATE TABLE IF NOT EXISTS embeddings (
                      id INTEGER PRIMARY KEY AUTOINCREMENT,
                      employee_id INTEGER NOT NULL REFERENCES employees(id),
                      vector TEXT NOT NULL,
                      model_version TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS attendance_log (
                      id INTEGER PRIMARY KEY AUTOINCREMENT,
                      employee_id INTEGER REFERENCES employees(id),
                      timestamp_ms INTEGER NOT NULL,
                      event_type TEXT NOT NULL,
                      confidence REAL NOT NULL,
                      trace_id TEXT NOT NULL,
                      status TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_attendance_employee_time
                      ON attendance_log(employee_id, timestamp_ms);
                    CREATE INDEX IF NOT EXISTS idx_embeddings_employee
                      ON embeddings(employee_id);
                    "#,
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn insert_employee(&self, full_name: &str, is_active: bool) -> Result<i64, StoreError> {
        let full_name = full_name.to_string();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO employees(full_name, is_active) VALUES (?1, ?2)",
                    params![full_name, is_active],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Store one embedding, serialized as a JSON array.
    pub async fn insert_embedding(
        &self,
        employee_id: i64,
        vector: &[f32],
        model_version: &str,
    ) -> Result<i64, StoreError> {
        let vector = serde_json::to_string(vector)?;
        let model_version = model_version.to_string();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO embeddings(employee_id, vector, model_version) VALUES (?1, ?2, ?3)",
                    params![employee_id, vector, model_version],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn load_all_active_embeddings(&self) -> Result<Vec<PersonEmbedding>, StoreError> {
        let rows: Vec<(i64, i64, String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT m.id, e.id, e.full_name, m.vector
                    FROM embeddings m
                    JOIN employees e ON e.id = m.employee_id
                    WHERE e.is_active = 1
                    ORDER BY m.id
                    "#,
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (embedding_id, person_id, person_name, vector) in rows {
            match serde_json::from_str::<Vec<f32>>(&vector) {
                Ok(vector) => out.push(PersonEmbedding {
                    person_id,
                    person_name,
                    vector,
                }),
                Err(e) => {
                    tracing::warn!(embedding_id, person_id, error = %e, "skipping undecodable embedding")
                }
            }
        }
        Ok(out)
    }

    async fn append_attendance_event(
        &self,
        event: NewAttendanceEvent,
    ) -> Result<AttendanceEvent, StoreError> {
        let employee_id = event.employee_id;
        let event_type = event.event_type.as_str();
        let timestamp_ms = event.timestamp.timestamp_millis();
        let confidence = f64::from(event.confidence);
        let trace_id = event.trace_id.clone();
        let status = event.status.as_str();

        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO attendance_log(employee_id, timestamp_ms, event_type, confidence, trace_id, status)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    params![employee_id, timestamp_ms, event_type, confidence, trace_id, status],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;

        Ok(event.with_id(id))
    }

    async fn latest_event_for(
        &self,
        employee_id: i64,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let raw = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM attendance_log \
                             WHERE employee_id = ?1 ORDER BY timestamp_ms DESC, id DESC LIMIT 1"
                        ),
                        params![employee_id],
                        raw_event,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        raw.map(decode_event).transpose()
    }

    async fn latest_event_per_employee(
        &self,
    ) -> Result<HashMap<i64, AttendanceEvent>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"
                    SELECT {EVENT_COLUMNS} FROM attendance_log a
                    WHERE a.employee_id IS NOT NULL
                      AND a.id = (
                        SELECT b.id FROM attendance_log b
                        WHERE b.employee_id = a.employee_id
                        ORDER BY b.timestamp_ms DESC, b.id DESC LIMIT 1
                      )
                    "#
                ))?;
                let rows = stmt
                    .query_map([], raw_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut latest = HashMap::with_capacity(rows.len());
        for raw in rows {
            let event = decode_event(raw)?;
            if let Some(employee_id) = event.employee_id {
                latest.insert(employee_id, event);
            }
        }
        Ok(latest)
    }

    async fn active_employee_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .call(|conn| {
                let count =
                    conn.query_row("SELECT COUNT(*) FROM employees WHERE is_active = 1", [], |r| {
                        r.get(0)
                    })?;
                Ok(count)
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn employee_name(&self, employee_id: i64) -> Result<Option<String>, StoreError> {
        let name: Option<String> = self
            .conn
            .call(move |conn| {
                let name = conn
                    .query_row(
                        "SELECT full_name FROM employees WHERE id = ?1",
                        params![employee_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(name)
            })
            .await?;
        Ok(name)
    }

    async fn employee_names(&self) -> Result<HashMap<i64, String>, StoreError> {
        let names = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, full_name FROM employees")?;
                let names = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<HashMap<i64, String>>>()?;
                Ok(names)
            })
            .await?;
        Ok(names)
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        employee_id: Option<i64>,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let from_ms = from.timestamp_millis();
        let to_ms = to.timestamp_millis();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    r#"
                    SELECT {EVENT_COLUMNS} FROM attendance_log
                    WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2
                      AND (?3 IS NULL OR employee_id = ?3)
                    ORDER BY timestamp_ms DESC, id DESC
                    "#
                ))?;
                let rows = stmt
                    .query_map(params![from_ms, to_ms, employee_id], raw_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_event).collect()
    }
}
