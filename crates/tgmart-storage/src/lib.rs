//! Raw lake layout + relational warehouse backends for tgmart.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tgmart_core::{MartTables, RawDetectionBatch, RawMessageRecord, StagingTables};
use thiserror::Error;

mod lake;
mod memory;
mod postgres;

pub use lake::{DetectionFile, MessagePartition, RawLake};
pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "tgmart-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported database url `{0}` (expected postgres://… or memory:)")]
    UnsupportedUrl(String),
}

/// Result of one atomic raw insert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

impl InsertOutcome {
    pub fn absorb(&mut self, other: InsertOutcome) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
    }
}

/// The relational store shared by loaders and transforms.
///
/// Raw tables are append-only: inserts skip existing natural keys and never
/// update. Staging and mart tables are replaced wholesale inside one
/// transaction, so a failed replace leaves the previous contents in place.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn migrate(&self) -> Result<(), StorageError>;

    /// Insert records whose (message id, channel) is not yet present. All or nothing.
    async fn insert_raw_messages(
        &self,
        records: &[RawMessageRecord],
    ) -> Result<InsertOutcome, StorageError>;

    async fn detection_batch_exists(&self, file_name: &str) -> Result<bool, StorageError>;

    /// Returns `false` when a batch with the same file name already exists.
    async fn insert_detection_batch(&self, batch: &RawDetectionBatch) -> Result<bool, StorageError>;

    async fn raw_messages(&self) -> Result<Vec<RawMessageRecord>, StorageError>;

    async fn raw_detection_batches(&self) -> Result<Vec<RawDetectionBatch>, StorageError>;

    async fn replace_staging(&self, tables: &StagingTables) -> Result<(), StorageError>;

    async fn staging(&self) -> Result<StagingTables, StorageError>;

    async fn replace_marts(&self, marts: &MartTables) -> Result<(), StorageError>;

    async fn marts(&self) -> Result<MartTables, StorageError>;
}

/// Open the backend named by `database_url`: `memory:` or a Postgres url.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
) -> Result<Arc<dyn Warehouse>, StorageError> {
    if database_url.starts_with("memory:") {
        return Ok(Arc::new(MemoryWarehouse::new()));
    }
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pg = PgWarehouse::connect(database_url, max_connections).await?;
        return Ok(Arc::new(pg));
    }
    Err(StorageError::UnsupportedUrl(database_url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_selects_backend_by_scheme() {
        let memory = connect("memory:", 1).await.expect("memory backend");
        assert_eq!(memory.backend_name(), "memory");

        let err = connect("mysql://localhost/db", 1).await.err().expect("unsupported");
        assert!(matches!(err, StorageError::UnsupportedUrl(_)));
    }
}
