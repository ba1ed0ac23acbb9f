use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tgmart_core::{MartTables, MessageKey, RawDetectionBatch, RawMessageRecord, StagingTables};
use tokio::sync::Mutex;

use crate::{InsertOutcome, StorageError, Warehouse};

#[derive(Debug, Default)]
struct MemoryState {
    messages: BTreeMap<MessageKey, RawMessageRecord>,
    detection_batches: BTreeMap<String, RawDetectionBatch>,
    staging: StagingTables,
    marts: MartTables,
}

/// Process-local warehouse. A single mutex is the single-writer discipline.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_writes.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory warehouse marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_raw_messages(
        &self,
        records: &[RawMessageRecord],
    ) -> Result<InsertOutcome, StorageError> {
        let mut state = self.state.lock().await;
        self.check_available()?;
        let mut outcome = InsertOutcome::default();
        for record in records {
            let key = record.natural_key();
            if state.messages.contains_key(&key) {
                outcome.duplicates += 1;
                continue;
            }
            state.messages.insert(key, record.clone());
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn detection_batch_exists(&self, file_name: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().await.detection_batches.contains_key(file_name))
    }

    async fn insert_detection_batch(&self, batch: &RawDetectionBatch) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        self.check_available()?;
        if state.detection_batches.contains_key(&batch.file_name) {
            return Ok(false);
        }
        state
            .detection_batches
            .insert(batch.file_name.clone(), batch.clone());
        Ok(true)
    }

    async fn raw_messages(&self) -> Result<Vec<RawMessageRecord>, StorageError> {
        Ok(self.state.lock().await.messages.values().cloned().collect())
    }

    async fn raw_detection_batches(&self) -> Result<Vec<RawDetectionBatch>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .detection_batches
            .values()
            .cloned()
            .collect())
    }

    async fn replace_staging(&self, tables: &StagingTables) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        self.check_available()?;
        state.staging = tables.clone();
        Ok(())
    }

    async fn staging(&self) -> Result<StagingTables, StorageError> {
        Ok(self.state.lock().await.staging.clone())
    }

    async fn replace_marts(&self, marts: &MartTables) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        self.check_available()?;
        state.marts = marts.clone();
        Ok(())
    }

    async fn marts(&self) -> Result<MartTables, StorageError> {
        Ok(self.state.lock().await.marts.clone())
    }
}
