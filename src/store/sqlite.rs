use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::instrument;
use uuid::Uuid;

use super::{PredictionRecord, PredictionStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    request_id TEXT NOT NULL UNIQUE,
    image_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    processing_time REAL NOT NULL,
    detections TEXT NOT NULL,
    user_rating INTEGER,
    user_transcription TEXT
)";

/// SQLite-backed store. Detections are kept as a JSON column.
#[derive(Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

struct Row {
    user_id: String,
    request_id: String,
    image_id: String,
    created_at: String,
    processing_time: f64,
    detections: String,
    user_rating: Option<u8>,
    user_transcription: Option<String>,
}

impl Row {
    fn into_record(self) -> Result<PredictionRecord, StoreError> {
        let image_id = Uuid::parse_str(&self.image_id)
            .map_err(|e| StoreError::Malformed(format!("image_id: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::Malformed(format!("created_at: {e}")))?
            .with_timezone(&Utc);
        Ok(PredictionRecord {
            user_id: self.user_id,
            request_id: self.request_id,
            image_id,
            created_at,
            processing_time: self.processing_time,
            detections: serde_json::from_str(&self.detections)?,
            user_rating: self.user_rating,
            user_transcription: self.user_transcription,
        })
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self, StoreError> {
        connection.execute(SCHEMA, [])?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || f(&connection.lock())).await?
    }
}

#[async_trait]
impl PredictionStore for SqliteStore {
    #[instrument(level = "debug", skip_all, fields(request_id = %record.request_id))]
    async fn insert(&self, record: PredictionRecord) -> Result<u64, StoreError> {
        let detections = serde_json::to_string(&record.detections)?;
        self.with(move |connection| {
            let inserted = connection.execute(
                "INSERT INTO predictions (user_id, request_id, image_id, created_at,
                    processing_time, detections, user_rating, user_transcription)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.user_id,
                    record.request_id,
                    record.image_id.to_string(),
                    record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    record.processing_time,
                    detections,
                    record.user_rating,
                    record.user_transcription,
                ],
            );
            match inserted {
                Ok(_) => Ok(connection.last_insert_rowid() as u64),
                Err(rusqlite::Error::SqliteFailure(error, _))
                    if error.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate(record.request_id))
                }
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<PredictionRecord>, StoreError> {
        let request_id = request_id.to_string();
        let row = self
            .with(move |connection| {
                Ok(connection
                    .query_row(
                        "SELECT user_id, request_id, image_id, created_at, processing_time,
                            detections, user_rating, user_transcription
                         FROM predictions WHERE request_id = ?1",
                        params![request_id],
                        |row| {
                            Ok(Row {
                                user_id: row.get(0)?,
                                request_id: row.get(1)?,
                                image_id: row.get(2)?,
                                created_at: row.get(3)?,
                                processing_time: row.get(4)?,
                                detections: row.get(5)?,
                                user_rating: row.get(6)?,
                                user_transcription: row.get(7)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        row.map(Row::into_record).transpose()
    }

    async fn update_rating(&self, request_id: &str, rating: u8) -> Result<bool, StoreError> {
        let request_id = request_id.to_string();
        self.with(move |connection| {
            let changed = connection.execute(
                "UPDATE predictions SET user_rating = ?1 WHERE request_id = ?2",
                params![rating, request_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn update_transcription(
        &self,
        request_id: &str,
        transcription: &str,
    ) -> Result<bool, StoreError> {
        let request_id = request_id.to_string();
        let transcription = transcription.to_string();
        self.with(move |connection| {
            let changed = connection.execute(
                "UPDATE predictions SET user_transcription = ?1 WHERE request_id = ?2",
                params![transcription, request_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}
