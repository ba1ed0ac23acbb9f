//! Raw layer to typed staging rows.

use serde::Serialize;
use tgmart_core::{
    detection_key, DetectionDocument, MessageDocument, PayloadError, RawDetectionBatch,
    RawMessageRecord, StagedDetection, StagedMessage, StagingTables,
};
use tracing::{debug, warn};

const MAX_REJECT_SAMPLES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingReject {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagingReport {
    pub messages_in: usize,
    pub messages_staged: usize,
    pub messages_rejected: usize,
    pub batches_in: usize,
    pub detections_staged: usize,
    pub detections_rejected: usize,
    pub rejects: Vec<StagingReject>,
}

impl StagingReport {
    fn reject(&mut self, source: String, err: &PayloadError) {
        if self.rejects.len() < MAX_REJECT_SAMPLES {
            self.rejects.push(StagingReject {
                source,
                reason: err.to_string(),
            });
        }
    }
}

/// Flatten one raw message. Counters default to 0 and flags to false.
pub fn stage_message(record: &RawMessageRecord) -> Result<StagedMessage, PayloadError> {
    let doc = MessageDocument::new(&record.payload)?;
    let media_type = doc.media_type()?;
    let has_media = doc.has_media()?.unwrap_or(false) || media_type.is_some();
    Ok(StagedMessage {
        message_id: record.message_id,
        channel_username: record.channel_username.clone(),
        partition_date: record.partition_date,
        message_text: doc.text()?,
        message_timestamp_utc: doc.date()?,
        views_count: doc.views()?.unwrap_or(0),
        forwards_count: doc.forwards()?.unwrap_or(0),
        replies_count: doc.replies_count()?.unwrap_or(0),
        has_media,
        media_type,
        media_file_name: doc.file_name()?,
        media_mime_type: doc.mime_type()?,
        media_file_size: doc.file_size()?,
        is_photo: doc.is_photo()?.unwrap_or(false),
        is_document: doc.is_document()?.unwrap_or(false),
    })
}

fn stage_detection(
    source_file: &str,
    source_index: usize,
    value: &serde_json::Value,
) -> Result<StagedDetection, PayloadError> {
    let doc = DetectionDocument::new(value)?;
    let message_id = doc.message_id()?;
    let detected_object_class = doc.object_class()?;
    let confidence_score = doc.confidence()?;
    let detection_timestamp = doc.timestamp()?;
    let bbox = doc.bounding_box()?;
    Ok(StagedDetection {
        detection_key: detection_key(
            message_id,
            detected_object_class.as_deref(),
            confidence_score,
            detection_timestamp,
        ),
        source_file: source_file.to_string(),
        source_index: i64::try_from(source_index).unwrap_or(i64::MAX),
        message_id,
        detected_object_class,
        confidence_score,
        detection_timestamp,
        box_top_left_x: bbox.top_left_x,
        box_top_left_y: bbox.top_left_y,
        box_width: bbox.width,
        box_height: bbox.height,
    })
}

/// One result per element of the batch payload, in payload order.
pub fn explode_detections(
    batch: &RawDetectionBatch,
) -> impl Iterator<Item = (usize, Result<StagedDetection, PayloadError>)> + '_ {
    batch
        .payload
        .as_array()
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(idx, value)| (idx, stage_detection(&batch.file_name, idx, value)))
}

/// Stage the whole raw layer. Rows that fail to parse are counted and left out.
pub fn stage_all(
    messages: &[RawMessageRecord],
    batches: &[RawDetectionBatch],
) -> (StagingTables, StagingReport) {
    let mut tables = StagingTables::default();
    let mut report = StagingReport {
        messages_in: messages.len(),
        batches_in: batches.len(),
        ..StagingReport::default()
    };

    for record in messages {
        match stage_message(record) {
            Ok(row) => tables.messages.push(row),
            Err(err) => {
                warn!(
                    channel = %record.channel_username,
                    message_id = record.message_id,
                    error = %err,
                    "rejecting message from staging"
                );
                report.messages_rejected += 1;
                report.reject(
                    format!("{}/{}", record.channel_username, record.message_id),
                    &err,
                );
            }
        }
    }

    for batch in batches {
        if !batch.payload.is_array() {
            warn!(file = %batch.file_name, "detection batch payload is not an array; nothing to stage");
            continue;
        }
        for (idx, result) in explode_detections(batch) {
            match result {
                Ok(row) => tables.detections.push(row),
                Err(err) => {
                    warn!(file = %batch.file_name, element = idx, error = %err, "rejecting detection from staging");
                    report.detections_rejected += 1;
                    report.reject(format!("{}[{idx}]", batch.file_name), &err);
                }
            }
        }
    }

    tables
        .messages
        .sort_by(|a, b| (&a.channel_username, a.message_id).cmp(&(&b.channel_username, b.message_id)));
    report.messages_staged = tables.messages.len();
    report.detections_staged = tables.detections.len();
    debug!(
        messages = report.messages_staged,
        detections = report.detections_staged,
        "staging rows built"
    );
    (tables, report)
}
