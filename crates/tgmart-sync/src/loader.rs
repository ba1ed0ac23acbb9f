//! Incremental loaders from the raw lake into the raw warehouse tables.
//!
//! Message partitions of one channel load in date order inside a single task;
//! channels and detection files are processed concurrently. Each file is
//! parsed in full before any of it is written, so a malformed file contributes
//! nothing. Element-level problems reject only that element. Storage errors
//! abort the stage.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tgmart_core::{MessageDocument, PayloadError, RawDetectionBatch, RawMessageRecord};
use tgmart_storage::{
    DetectionFile, InsertOutcome, MessagePartition, RawLake, StorageError, Warehouse,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;

/// Failure details kept per summary; counts stay exact beyond this.
const MAX_FAILURE_SAMPLES: usize = 100;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("discovering lake files: {0:#}")]
    Discovery(anyhow::Error),
    #[error("{failed} of {total} {unit} failed, above the allowed ratio {max_ratio}")]
    BudgetExceeded {
        failed: usize,
        total: usize,
        unit: &'static str,
        max_ratio: f64,
    },
    #[error("load task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub file: String,
    pub element: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSummary {
    pub files_seen: usize,
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    /// Message records parsed, or detection events in newly loaded batches.
    pub records_seen: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failures: Vec<LoadFailure>,
}

impl LoadSummary {
    fn record_failure(&mut self, failure: LoadFailure) {
        if self.failures.len() < MAX_FAILURE_SAMPLES {
            self.failures.push(failure);
        }
    }

    fn absorb(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Loaded {
                records,
                written,
                rejects,
            } => {
                self.files_loaded += 1;
                self.records_seen += records;
                self.inserted += written.inserted;
                self.duplicates += written.duplicates;
                self.rejected += rejects.len();
                for reject in rejects {
                    self.record_failure(reject);
                }
            }
            FileOutcome::Skipped => self.files_skipped += 1,
            FileOutcome::AlreadyLoaded => {
                self.files_skipped += 1;
                self.duplicates += 1;
            }
            FileOutcome::Failed(failure) => {
                self.files_failed += 1;
                self.record_failure(failure);
            }
        }
    }

    /// Fails when failed files or rejected records exceed `max_ratio` of their totals.
    pub fn check_budget(&self, max_ratio: f64) -> Result<(), LoadError> {
        let over = |failed: usize, total: usize| {
            failed > 0 && total > 0 && failed as f64 / total as f64 > max_ratio
        };
        if over(self.files_failed, self.files_seen) {
            return Err(LoadError::BudgetExceeded {
                failed: self.files_failed,
                total: self.files_seen,
                unit: "files",
                max_ratio,
            });
        }
        // records_seen excludes rejects.
        let attempted = self.records_seen + self.rejected;
        if over(self.rejected, attempted) {
            return Err(LoadError::BudgetExceeded {
                failed: self.rejected,
                total: attempted,
                unit: "records",
                max_ratio,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
enum FileOutcome {
    Loaded {
        records: usize,
        written: InsertOutcome,
        rejects: Vec<LoadFailure>,
    },
    Skipped,
    /// A detection batch recorded by an earlier run.
    AlreadyLoaded,
    Failed(LoadFailure),
}

fn file_failure(file: &str, reason: impl Into<String>) -> FileOutcome {
    FileOutcome::Failed(LoadFailure {
        file: file.to_string(),
        element: None,
        reason: reason.into(),
    })
}

/// Parse a file as a JSON array; `Err` carries the file-level failure.
fn parse_array(file: &str, bytes: &[u8]) -> Result<Vec<Value>, FileOutcome> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(file_failure(file, "expected a JSON array")),
        Err(err) => Err(file_failure(file, format!("invalid JSON: {err}"))),
    }
}

/// Raw record for one scraped message. The channel falls back to the partition's.
pub fn raw_record_from_value(
    value: &Value,
    partition_channel: &str,
    partition_date: NaiveDate,
    ingested_at: DateTime<Utc>,
) -> Result<RawMessageRecord, PayloadError> {
    let doc = MessageDocument::new(value)?;
    let message_id = doc.message_id()?;
    let channel_username = doc
        .channel_username()?
        .unwrap_or_else(|| partition_channel.to_string());
    Ok(RawMessageRecord {
        message_id,
        channel_username,
        partition_date,
        payload: value.clone(),
        ingested_at,
    })
}

pub struct MessageLoader {
    warehouse: Arc<dyn Warehouse>,
    lake: RawLake,
    config: PipelineConfig,
}

impl MessageLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, config: &PipelineConfig) -> Self {
        Self {
            warehouse,
            lake: RawLake::new(config.lake_dir.clone()),
            config: config.clone(),
        }
    }

    pub async fn run(&self) -> Result<LoadSummary, LoadError> {
        let partitions = self
            .lake
            .message_partitions()
            .await
            .map_err(LoadError::Discovery)?;
        let ingested_at = Utc::now();
        let limit = Arc::new(Semaphore::new(self.config.load_concurrency.max(1)));
        let mut summary = LoadSummary {
            files_seen: partitions.len(),
            ..LoadSummary::default()
        };
        info!(files = partitions.len(), "loading message partitions");

        let mut by_channel: BTreeMap<String, Vec<MessagePartition>> = BTreeMap::new();
        for partition in partitions {
            if !self.config.channel_enabled(&partition.channel) {
                debug!(channel = %partition.channel, path = %partition.path.display(), "channel not targeted; skipping");
                summary.absorb(FileOutcome::Skipped);
                continue;
            }
            by_channel
                .entry(partition.channel.clone())
                .or_default()
                .push(partition);
        }

        let mut tasks = JoinSet::new();
        for (channel, mut partitions) in by_channel {
            // Earliest date first, so a message repeated across days keeps its first partition.
            partitions.sort_by(|a, b| a.date_label.cmp(&b.date_label));
            let warehouse = Arc::clone(&self.warehouse);
            let limit = Arc::clone(&limit);
            let batch_size = self.config.batch_size.max(1);
            let span = info_span!("load_channel", channel = %channel, files = partitions.len());
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    let mut outcomes = Vec::with_capacity(partitions.len());
                    for partition in &partitions {
                        let span = info_span!("load_partition", date = %partition.date_label);
                        outcomes.push(
                            load_partition(warehouse.as_ref(), partition, batch_size, ingested_at)
                                .instrument(span)
                                .await?,
                        );
                    }
                    Ok::<_, StorageError>(outcomes)
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcomes)) => {
                    for outcome in outcomes {
                        summary.absorb(outcome);
                    }
                }
                Ok(Err(err)) => {
                    tasks.abort_all();
                    error!(error = %err, "storage failure; aborting message load");
                    return Err(err.into());
                }
                Err(err) => {
                    tasks.abort_all();
                    return Err(err.into());
                }
            }
        }

        info!(
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            failed_files = summary.files_failed,
            "message load finished"
        );
        Ok(summary)
    }
}

async fn load_partition(
    warehouse: &dyn Warehouse,
    partition: &MessagePartition,
    batch_size: usize,
    ingested_at: DateTime<Utc>,
) -> Result<FileOutcome, StorageError> {
    let file = partition.path.display().to_string();
    let Some(partition_date) = partition.partition_date() else {
        error!(file = %file, "partition directory is not a YYYY-MM-DD date");
        return Ok(file_failure(
            &file,
            format!("partition directory `{}` is not a YYYY-MM-DD date", partition.date_label),
        ));
    };

    let bytes = match tokio::fs::read(&partition.path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(file = %file, error = %err, "reading partition failed");
            return Ok(file_failure(&file, format!("read failed: {err}")));
        }
    };
    let items = match parse_array(&file, &bytes) {
        Ok(items) => items,
        Err(outcome) => {
            error!(file = %file, "partition is not a JSON array of messages");
            return Ok(outcome);
        }
    };
    if items.is_empty() {
        warn!(file = %file, "partition contains no messages; skipping");
        return Ok(FileOutcome::Skipped);
    }

    let mut records = Vec::with_capacity(items.len());
    let mut rejects = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match raw_record_from_value(item, &partition.channel, partition_date, ingested_at) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(file = %file, element = idx, error = %err, "skipping malformed message");
                rejects.push(LoadFailure {
                    file: file.clone(),
                    element: Some(idx),
                    reason: err.to_string(),
                });
            }
        }
    }

    let mut written = InsertOutcome::default();
    for chunk in records.chunks(batch_size) {
        written.absorb(warehouse.insert_raw_messages(chunk).await?);
    }
    info!(
        file = %file,
        inserted = written.inserted,
        duplicates = written.duplicates,
        rejected = rejects.len(),
        "partition loaded"
    );
    Ok(FileOutcome::Loaded {
        records: records.len(),
        written,
        rejects,
    })
}

pub struct DetectionLoader {
    warehouse: Arc<dyn Warehouse>,
    lake: RawLake,
    concurrency: usize,
}

impl DetectionLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, config: &PipelineConfig) -> Self {
        Self {
            warehouse,
            lake: RawLake::new(config.lake_dir.clone()),
            concurrency: config.load_concurrency.max(1),
        }
    }

    pub async fn run(&self) -> Result<LoadSummary, LoadError> {
        let files = self
            .lake
            .detection_files()
            .await
            .map_err(LoadError::Discovery)?;
        let inserted_at = Utc::now();
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut summary = LoadSummary {
            files_seen: files.len(),
            ..LoadSummary::default()
        };
        info!(files = files.len(), "loading detection batches");

        let mut tasks = JoinSet::new();
        for file in files {
            let warehouse = Arc::clone(&self.warehouse);
            let limit = Arc::clone(&limit);
            let span = info_span!("load_detections", file = %file.file_name);
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    load_detection_file(warehouse.as_ref(), &file, inserted_at).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => summary.absorb(outcome),
                Ok(Err(err)) => {
                    tasks.abort_all();
                    error!(error = %err, "storage failure; aborting detection load");
                    return Err(err.into());
                }
                Err(err) => {
                    tasks.abort_all();
                    return Err(err.into());
                }
            }
        }

        info!(
            batches = summary.inserted,
            events = summary.records_seen,
            already_loaded = summary.duplicates,
            failed_files = summary.files_failed,
            "detection load finished"
        );
        Ok(summary)
    }
}

async fn load_detection_file(
    warehouse: &dyn Warehouse,
    file: &DetectionFile,
    inserted_at: DateTime<Utc>,
) -> Result<FileOutcome, StorageError> {
    if warehouse.detection_batch_exists(&file.file_name).await? {
        debug!(file = %file.file_name, "already loaded; skipping");
        return Ok(FileOutcome::AlreadyLoaded);
    }

    let bytes = match tokio::fs::read(&file.path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(file = %file.file_name, error = %err, "reading detection file failed");
            return Ok(file_failure(&file.file_name, format!("read failed: {err}")));
        }
    };
    let items = match parse_array(&file.file_name, &bytes) {
        Ok(items) => items,
        Err(outcome) => {
            error!(file = %file.file_name, "detection file is not a JSON array");
            return Ok(outcome);
        }
    };
    if items.is_empty() {
        warn!(file = %file.file_name, "detection file contains no detections; skipping");
        return Ok(FileOutcome::Skipped);
    }

    let events = items.len();
    let batch = RawDetectionBatch {
        file_name: file.file_name.clone(),
        payload: Value::Array(items),
        content_sha256: RawLake::sha256_hex(&bytes),
        inserted_at,
    };
    let inserted = warehouse.insert_detection_batch(&batch).await?;
    info!(file = %file.file_name, events, inserted, "detection batch loaded");
    Ok(FileOutcome::Loaded {
        records: if inserted { events } else { 0 },
        written: InsertOutcome {
            inserted: usize::from(inserted),
            duplicates: usize::from(!inserted),
        },
        rejects: Vec::new(),
    })
}
