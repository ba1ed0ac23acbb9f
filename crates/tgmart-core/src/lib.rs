//! Core domain model for the tgmart channel warehouse.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod calendar;
mod keys;
mod payload;

pub use keys::{canonical_timestamp, channel_key, detection_key, surrogate_key, SURROGATE_KEY_LEN};
pub use payload::{parse_timestamp, BoundingBox, DetectionDocument, MessageDocument, PayloadError};

pub const CRATE_NAME: &str = "tgmart-core";

/// Natural key of a raw message: one real-world message per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel_username: String,
    pub message_id: i64,
}

/// One ingested message as held by the append-only raw layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageRecord {
    pub message_id: i64,
    pub channel_username: String,
    pub partition_date: NaiveDate,
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

impl RawMessageRecord {
    pub fn natural_key(&self) -> MessageKey {
        MessageKey {
            channel_username: self.channel_username.clone(),
            message_id: self.message_id,
        }
    }
}

/// One detection output file, stored whole. The payload is a JSON array of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetectionBatch {
    pub file_name: String,
    pub payload: serde_json::Value,
    pub content_sha256: String,
    pub inserted_at: DateTime<Utc>,
}

/// Typed staging row for a message. Counters are never null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedMessage {
    pub message_id: i64,
    pub channel_username: String,
    pub partition_date: NaiveDate,
    pub message_text: Option<String>,
    pub message_timestamp_utc: Option<DateTime<Utc>>,
    pub views_count: i64,
    pub forwards_count: i64,
    pub replies_count: i64,
    pub has_media: bool,
    pub media_type: Option<String>,
    pub media_file_name: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_file_size: Option<i64>,
    pub is_photo: bool,
    pub is_document: bool,
}

/// One exploded detection event, keyed by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedDetection {
    pub detection_key: String,
    pub source_file: String,
    /// Position of the event in its source file's array.
    pub source_index: i64,
    pub message_id: Option<i64>,
    pub detected_object_class: Option<String>,
    pub confidence_score: Option<f64>,
    pub detection_timestamp: Option<DateTime<Utc>>,
    pub box_top_left_x: Option<f64>,
    pub box_top_left_y: Option<f64>,
    pub box_width: Option<f64>,
    pub box_height: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDim {
    pub channel_pk: String,
    pub channel_username: String,
}

/// Calendar row keyed by the date itself. `day_of_week` is ISO 8601 (Monday = 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateDim {
    pub date_pk: NaiveDate,
    pub day: i32,
    pub month: i32,
    pub month_name: String,
    pub year: i32,
    pub quarter: i32,
    pub day_of_week: i32,
    pub day_of_year: i32,
    pub iso_week: i32,
    pub is_weekend: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFact {
    pub message_id: i64,
    pub channel_pk: Option<String>,
    pub date_pk: Option<NaiveDate>,
    pub message_text: Option<String>,
    pub message_timestamp_utc: Option<DateTime<Utc>>,
    pub has_media: bool,
    pub views_count: i64,
    pub forwards_count: i64,
    pub replies_count: i64,
    pub media_type: Option<String>,
    pub media_file_name: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_file_size: Option<i64>,
    pub is_photo: bool,
    pub is_document: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetectionFact {
    pub detection_key: String,
    pub message_id: Option<i64>,
    pub detected_object_class: Option<String>,
    pub confidence_score: Option<f64>,
    pub box_top_left_x: Option<f64>,
    pub box_top_left_y: Option<f64>,
    pub box_width: Option<f64>,
    pub box_height: Option<f64>,
    pub detection_timestamp: Option<DateTime<Utc>>,
    pub loaded_at: DateTime<Utc>,
}

/// Output of the staging transform, replaced as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagingTables {
    pub messages: Vec<StagedMessage>,
    pub detections: Vec<StagedDetection>,
}

/// Output of the dimensional transform, replaced as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MartTables {
    pub channels: Vec<ChannelDim>,
    pub dates: Vec<DateDim>,
    pub messages: Vec<MessageFact>,
    pub detections: Vec<ImageDetectionFact>,
}

impl MartTables {
    pub fn row_counts(&self) -> [(&'static str, usize); 4] {
        [
            ("dim_channels", self.channels.len()),
            ("dim_dates", self.dates.len()),
            ("fct_messages", self.messages.len()),
            ("fct_image_detections", self.detections.len()),
        ]
    }
}
