//! Staging rows to the star schema: two dimensions and two facts.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tgmart_core::{
    channel_key, ChannelDim, DateDim, ImageDetectionFact, MartTables, MessageFact,
    StagedDetection, StagedMessage, StagingTables,
};
use tracing::debug;

pub fn build_channel_dim(messages: &[StagedMessage]) -> Vec<ChannelDim> {
    messages
        .iter()
        .map(|m| m.channel_username.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|username| ChannelDim {
            channel_pk: channel_key(username),
            channel_username: username.to_string(),
        })
        .collect()
}

pub fn build_date_dim(messages: &[StagedMessage]) -> Vec<DateDim> {
    messages
        .iter()
        .map(|m| m.partition_date)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(DateDim::from_date)
        .collect()
}

/// Left join of staged messages to both dimensions. Unmatched rows keep a null key.
pub fn build_message_facts(
    messages: &[StagedMessage],
    channels: &[ChannelDim],
    dates: &[DateDim],
) -> Vec<MessageFact> {
    let channel_pks = channels
        .iter()
        .map(|c| (c.channel_username.as_str(), c.channel_pk.as_str()))
        .collect::<BTreeMap<_, _>>();
    let date_pks = dates.iter().map(|d| d.date_pk).collect::<BTreeSet<NaiveDate>>();

    messages
        .iter()
        .map(|m| MessageFact {
            message_id: m.message_id,
            channel_pk: channel_pks
                .get(m.channel_username.as_str())
                .map(|pk| pk.to_string()),
            date_pk: date_pks.contains(&m.partition_date).then_some(m.partition_date),
            message_text: m.message_text.clone(),
            message_timestamp_utc: m.message_timestamp_utc,
            has_media: m.has_media,
            views_count: m.views_count,
            forwards_count: m.forwards_count,
            replies_count: m.replies_count,
            media_type: m.media_type.clone(),
            media_file_name: m.media_file_name.clone(),
            media_mime_type: m.media_mime_type.clone(),
            media_file_size: m.media_file_size,
            is_photo: m.is_photo,
            is_document: m.is_document,
        })
        .collect()
}

/// One fact per distinct detection key. The first occurrence by source file and
/// payload position wins, whatever order the staging rows arrive in.
pub fn build_detection_facts(
    detections: &[StagedDetection],
    loaded_at: DateTime<Utc>,
) -> Vec<ImageDetectionFact> {
    let mut ordered = detections.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| (&a.source_file, a.source_index).cmp(&(&b.source_file, b.source_index)));
    let mut seen = HashSet::new();
    ordered
        .into_iter()
        .filter(|d| seen.insert(d.detection_key.as_str()))
        .map(|d| ImageDetectionFact {
            detection_key: d.detection_key.clone(),
            message_id: d.message_id,
            detected_object_class: d.detected_object_class.clone(),
            confidence_score: d.confidence_score,
            box_top_left_x: d.box_top_left_x,
            box_top_left_y: d.box_top_left_y,
            box_width: d.box_width,
            box_height: d.box_height,
            detection_timestamp: d.detection_timestamp,
            loaded_at,
        })
        .collect()
}

pub fn build_marts(staging: &StagingTables, loaded_at: DateTime<Utc>) -> MartTables {
    let channels = build_channel_dim(&staging.messages);
    let dates = build_date_dim(&staging.messages);
    let messages = build_message_facts(&staging.messages, &channels, &dates);
    let detections = build_detection_facts(&staging.detections, loaded_at);
    debug!(
        channels = channels.len(),
        dates = dates.len(),
        messages = messages.len(),
        detections = detections.len(),
        collapsed = staging.detections.len() - detections.len(),
        "mart rows built"
    );
    MartTables {
        channels,
        dates,
        messages,
        detections,
    }
}
