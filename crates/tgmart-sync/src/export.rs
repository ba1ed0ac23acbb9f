//! Parquet snapshots of the mart tables plus a hashed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tgmart_core::{canonical_timestamp, ChannelDim, DateDim, ImageDetectionFact, MartTables, MessageFact};
use tracing::info;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write the four marts under `<out_dir>/snapshots/` and return the manifest path.
pub fn export_mart_snapshots(out_dir: &Path, marts: &MartTables) -> Result<PathBuf> {
    let snapshot_dir = out_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let tables: [(&str, usize, RecordBatch); 4] = [
        ("dim_channels", marts.channels.len(), channels_batch(&marts.channels)?),
        ("dim_dates", marts.dates.len(), dates_batch(&marts.dates)?),
        ("fct_messages", marts.messages.len(), messages_batch(&marts.messages)?),
        (
            "fct_image_detections",
            marts.detections.len(),
            detections_batch(&marts.detections)?,
        ),
    ];

    let mut files = Vec::with_capacity(tables.len());
    for (name, rows, batch) in tables {
        let path = snapshot_dir.join(format!("{name}.parquet"));
        write_parquet(&path, batch)?;
        files.push(manifest_entry(name, rows, out_dir, &path)?);
    }

    let manifest = ParquetManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(path = %manifest_path.display(), "mart snapshots exported");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, rows: usize, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn timestamps(values: impl Iterator<Item = Option<DateTime<Utc>>>) -> ArrayRef {
    Arc::new(values.map(|ts| ts.map(canonical_timestamp)).collect::<StringArray>())
}

fn channels_batch(rows: &[ChannelDim]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("channel_pk", DataType::Utf8, false),
        ArrowField::new("channel_username", DataType::Utf8, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(rows.iter().map(|r| Some(r.channel_pk.as_str())).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| Some(r.channel_username.as_str())).collect::<StringArray>()),
    ];
    RecordBatch::try_new(schema, columns).context("building dim_channels record batch")
}

fn dates_batch(rows: &[DateDim]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date_pk", DataType::Utf8, false),
        ArrowField::new("day", DataType::Int32, false),
        ArrowField::new("month", DataType::Int32, false),
        ArrowField::new("month_name", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("quarter", DataType::Int32, false),
        ArrowField::new("day_of_week", DataType::Int32, false),
        ArrowField::new("day_of_year", DataType::Int32, false),
        ArrowField::new("iso_week", DataType::Int32, false),
        ArrowField::new("is_weekend", DataType::Boolean, false),
    ]));
    let ints = |f: fn(&DateDim) -> i32| -> ArrayRef {
        Arc::new(Int32Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let columns: Vec<ArrayRef> = vec![
        Arc::new(rows.iter().map(|r| Some(date_text(r.date_pk))).collect::<StringArray>()),
        ints(|r| r.day),
        ints(|r| r.month),
        Arc::new(rows.iter().map(|r| Some(r.month_name.as_str())).collect::<StringArray>()),
        ints(|r| r.year),
        ints(|r| r.quarter),
        ints(|r| r.day_of_week),
        ints(|r| r.day_of_year),
        ints(|r| r.iso_week),
        Arc::new(BooleanArray::from(rows.iter().map(|r| r.is_weekend).collect::<Vec<_>>())),
    ];
    RecordBatch::try_new(schema, columns).context("building dim_dates record batch")
}

fn messages_batch(rows: &[MessageFact]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("message_id", DataType::Int64, false),
        ArrowField::new("channel_pk", DataType::Utf8, true),
        ArrowField::new("date_pk", DataType::Utf8, true),
        ArrowField::new("message_text", DataType::Utf8, true),
        ArrowField::new("message_timestamp_utc", DataType::Utf8, true),
        ArrowField::new("has_media", DataType::Boolean, false),
        ArrowField::new("views_count", DataType::Int64, false),
        ArrowField::new("forwards_count", DataType::Int64, false),
        ArrowField::new("replies_count", DataType::Int64, false),
        ArrowField::new("media_type", DataType::Utf8, true),
        ArrowField::new("media_file_name", DataType::Utf8, true),
        ArrowField::new("media_mime_type", DataType::Utf8, true),
        ArrowField::new("media_file_size", DataType::Int64, true),
        ArrowField::new("is_photo", DataType::Boolean, false),
        ArrowField::new("is_document", DataType::Boolean, false),
    ]));
    let text = |f: fn(&MessageFact) -> Option<&str>| -> ArrayRef {
        Arc::new(rows.iter().map(f).collect::<StringArray>())
    };
    let counts = |f: fn(&MessageFact) -> i64| -> ArrayRef {
        Arc::new(Int64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let flags = |f: fn(&MessageFact) -> bool| -> ArrayRef {
        Arc::new(BooleanArray::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let columns: Vec<ArrayRef> = vec![
        counts(|r| r.message_id),
        text(|r| r.channel_pk.as_deref()),
        Arc::new(rows.iter().map(|r| r.date_pk.map(date_text)).collect::<StringArray>()),
        text(|r| r.message_text.as_deref()),
        timestamps(rows.iter().map(|r| r.message_timestamp_utc)),
        flags(|r| r.has_media),
        counts(|r| r.views_count),
        counts(|r| r.forwards_count),
        counts(|r| r.replies_count),
        text(|r| r.media_type.as_deref()),
        text(|r| r.media_file_name.as_deref()),
        text(|r| r.media_mime_type.as_deref()),
        Arc::new(rows.iter().map(|r| r.media_file_size).collect::<Int64Array>()),
        flags(|r| r.is_photo),
        flags(|r| r.is_document),
    ];
    RecordBatch::try_new(schema, columns).context("building fct_messages record batch")
}

fn detections_batch(rows: &[ImageDetectionFact]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("detection_key", DataType::Utf8, false),
        ArrowField::new("message_id", DataType::Int64, true),
        ArrowField::new("detected_object_class", DataType::Utf8, true),
        ArrowField::new("confidence_score", DataType::Float64, true),
        ArrowField::new("box_top_left_x", DataType::Float64, true),
        ArrowField::new("box_top_left_y", DataType::Float64, true),
        ArrowField::new("box_width", DataType::Float64, true),
        ArrowField::new("box_height", DataType::Float64, true),
        ArrowField::new("detection_timestamp", DataType::Utf8, true),
        ArrowField::new("loaded_at", DataType::Utf8, false),
    ]));
    let floats = |f: fn(&ImageDetectionFact) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let columns: Vec<ArrayRef> = vec![
        Arc::new(rows.iter().map(|r| Some(r.detection_key.as_str())).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| r.message_id).collect::<Int64Array>()),
        Arc::new(rows.iter().map(|r| r.detected_object_class.as_deref()).collect::<StringArray>()),
        floats(|r| r.confidence_score),
        floats(|r| r.box_top_left_x),
        floats(|r| r.box_top_left_y),
        floats(|r| r.box_width),
        floats(|r| r.box_height),
        timestamps(rows.iter().map(|r| r.detection_timestamp)),
        timestamps(rows.iter().map(|r| Some(r.loaded_at))),
    ];
    RecordBatch::try_new(schema, columns).context("building fct_image_detections record batch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::tempdir;
    use tgmart_core::channel_key;

    fn marts() -> MartTables {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        MartTables {
            channels: vec![ChannelDim {
                channel_pk: channel_key("chan1"),
                channel_username: "chan1".into(),
            }],
            dates: vec![DateDim::from_date(date)],
            messages: vec![MessageFact {
                message_id: 100,
                channel_pk: Some(channel_key("chan1")),
                date_pk: Some(date),
                message_text: None,
                message_timestamp_utc: None,
                has_media: false,
                views_count: 150,
                forwards_count: 0,
                replies_count: 0,
                media_type: None,
                media_file_name: None,
                media_mime_type: None,
                media_file_size: None,
                is_photo: false,
                is_document: false,
            }],
            detections: Vec::new(),
        }
    }

    #[test]
    fn writes_every_mart_and_a_manifest() {
        let dir = tempdir().expect("tempdir");
        let manifest_path = export_mart_snapshots(dir.path(), &marts()).expect("export");

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read manifest"))
                .expect("parse manifest");
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
        assert_eq!(
            manifest.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["dim_channels", "dim_dates", "fct_messages", "fct_image_detections"]
        );

        let messages = &manifest.files[2];
        assert_eq!(messages.path, "snapshots/fct_messages.parquet");
        assert_eq!(messages.rows, 1);
        assert_eq!(messages.sha256.len(), 64);

        let file = File::open(dir.path().join(&messages.path)).expect("open parquet");
        let reader = SerializedFileReader::new(file).expect("parquet reader");
        assert_eq!(reader.metadata().file_metadata().num_rows(), 1);
    }
}
