//! Prediction persistence.
//!
//! One [`PredictionRecord`] per recognition request, keyed by `request_id`.
//! Records are created once and later receive at most a rating and a
//! corrected transcription. Updates report whether a record matched instead
//! of failing on unknown ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::Detection;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a prediction with request_id {0} already exists")]
    Duplicate(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("could not encode detections: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stored record is malformed: {0}")]
    Malformed(String),
    #[error("storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub user_id: String,
    pub request_id: String,
    pub image_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Seconds spent on recognition.
    pub processing_time: f64,
    pub detections: Vec<Detection>,
    pub user_rating: Option<u8>,
    pub user_transcription: Option<String>,
}

impl PredictionRecord {
    /// A fresh record with a new image id, stamped now, with no feedback yet.
    pub fn new(
        user_id: impl Into<String>,
        request_id: impl Into<String>,
        processing_time: f64,
        detections: Vec<Detection>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            request_id: request_id.into(),
            image_id: Uuid::new_v4(),
            created_at: Utc::now(),
            processing_time,
            detections,
            user_rating: None,
            user_transcription: None,
        }
    }
}

#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Stores a new record and returns its row id.
    async fn insert(&self, record: PredictionRecord) -> Result<u64, StoreError>;

    async fn get_by_request_id(&self, request_id: &str)
        -> Result<Option<PredictionRecord>, StoreError>;

    /// `Ok(false)` when no record has this request id.
    async fn update_rating(&self, request_id: &str, rating: u8) -> Result<bool, StoreError>;

    /// `Ok(false)` when no record has this request id.
    async fn update_transcription(
        &self,
        request_id: &str,
        transcription: &str,
    ) -> Result<bool, StoreError>;
}
