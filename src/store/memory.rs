use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PredictionRecord, PredictionStore, StoreError};

/// Process-local store, lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<MemoryRecords>,
}

#[derive(Default)]
struct MemoryRecords {
    by_request_id: HashMap<String, (u64, PredictionRecord)>,
    next_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().by_request_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, request_id: &str, apply: impl FnOnce(&mut PredictionRecord)) -> bool {
        match self.records.write().by_request_id.get_mut(request_id) {
            Some((_, record)) => {
                apply(record);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn insert(&self, record: PredictionRecord) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        if records.by_request_id.contains_key(&record.request_id) {
            return Err(StoreError::Duplicate(record.request_id));
        }
        records.next_id += 1;
        let id = records.next_id;
        records
            .by_request_id
            .insert(record.request_id.clone(), (id, record));
        Ok(id)
    }

    async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<PredictionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .by_request_id
            .get(request_id)
            .map(|(_, record)| record.clone()))
    }

    async fn update_rating(&self, request_id: &str, rating: u8) -> Result<bool, StoreError> {
        Ok(self.update(request_id, |record| record.user_rating = Some(rating)))
    }

    async fn update_transcription(
        &self,
        request_id: &str,
        transcription: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.update(request_id, |record| {
            record.user_transcription = Some(transcription.to_string())
        }))
    }
}
