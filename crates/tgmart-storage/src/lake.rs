//! Partitioned raw file layout written by the upstream collaborators.
//!
//! ```text
//! <root>/telegram_messages/<YYYY-MM-DD>/<channel>.json   JSON array of messages
//! <root>/yolo_detections/<name>.json                     JSON array of detections
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const MESSAGES_DIR: &str = "telegram_messages";
const DETECTIONS_DIR: &str = "yolo_detections";

/// One message partition file: a single channel on a single date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePartition {
    pub path: PathBuf,
    pub date_label: String,
    pub channel: String,
}

impl MessagePartition {
    /// `None` when the directory name is not a calendar date.
    pub fn partition_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date_label, "%Y-%m-%d").ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionFile {
    pub path: PathBuf,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct RawLake {
    root: PathBuf,
}

impl RawLake {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join(MESSAGES_DIR)
    }

    pub fn detections_dir(&self) -> PathBuf {
        self.root.join(DETECTIONS_DIR)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// All message partition files, sorted by path. A missing lake yields none.
    pub async fn message_partitions(&self) -> anyhow::Result<Vec<MessagePartition>> {
        let mut out = Vec::new();
        for date_dir in list_dir(&self.messages_dir(), EntryKind::Dir).await? {
            let date_label = file_name_of(&date_dir);
            for path in list_dir(&date_dir, EntryKind::JsonFile).await? {
                let channel = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                out.push(MessagePartition {
                    path,
                    date_label: date_label.clone(),
                    channel,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    pub async fn detection_files(&self) -> anyhow::Result<Vec<DetectionFile>> {
        let mut out = list_dir(&self.detections_dir(), EntryKind::JsonFile)
            .await?
            .into_iter()
            .map(|path| DetectionFile {
                file_name: file_name_of(&path),
                path,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(out)
    }

    pub fn message_partition_path(&self, date: NaiveDate, channel: &str) -> PathBuf {
        self.messages_dir()
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{channel}.json"))
    }

    /// Write a message partition the way the scraper does. Replaces an existing file.
    pub async fn write_message_partition(
        &self,
        date: NaiveDate,
        channel: &str,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self.message_partition_path(date, channel);
        write_atomically(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_detection_file(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.detections_dir().join(file_name);
        write_atomically(&path, bytes).await?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    JsonFile,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

async fn list_dir(dir: &Path, kind: EntryKind) -> anyhow::Result<Vec<PathBuf>> {
    if !fs::try_exists(dir)
        .await
        .with_context(|| format!("checking {}", dir.display()))?
    {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let file_type = entry.file_type().await?;
        let path = entry.path();
        let keep = match kind {
            EntryKind::Dir => file_type.is_dir(),
            EntryKind::JsonFile => {
                file_type.is_file() && path.extension().is_some_and(|ext| ext == "json")
            }
        };
        if keep {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Temp-file + rename so readers never observe a half-written partition.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
