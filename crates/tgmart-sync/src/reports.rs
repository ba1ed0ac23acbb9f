//! Read-only analytical queries over the marts.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::Serialize;
use tgmart_core::{MartTables, MessageFact};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectCount {
    pub detected_object_class: Option<String>,
    pub detection_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelActivity {
    pub activity_date: NaiveDate,
    pub message_count: usize,
    pub detection_count: usize,
    pub total_views: i64,
    pub total_forwards: i64,
    pub total_replies: i64,
    pub messages_with_media: usize,
}

/// Detection counts per object class, most frequent first.
pub fn top_objects(marts: &MartTables, limit: usize) -> Vec<ObjectCount> {
    let mut counts: HashMap<Option<&str>, usize> = HashMap::new();
    for detection in &marts.detections {
        *counts
            .entry(detection.detected_object_class.as_deref())
            .or_default() += 1;
    }
    let mut rows = counts
        .into_iter()
        .map(|(class, detection_count)| ObjectCount {
            detected_object_class: class.map(str::to_string),
            detection_count,
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.detection_count
            .cmp(&a.detection_count)
            .then_with(|| a.detected_object_class.cmp(&b.detected_object_class))
    });
    rows.truncate(limit);
    rows
}

/// Per-day activity of one channel, oldest first. `None` for an unknown channel.
///
/// Days come from the message timestamp, or the partition date when it is missing.
pub fn channel_activity(marts: &MartTables, channel_username: &str) -> Option<Vec<ChannelActivity>> {
    let channel = marts
        .channels
        .iter()
        .find(|c| c.channel_username == channel_username)?;

    let mut detections_per_message: HashMap<i64, usize> = HashMap::new();
    for detection in &marts.detections {
        if let Some(message_id) = detection.message_id {
            *detections_per_message.entry(message_id).or_default() += 1;
        }
    }

    let mut days: BTreeMap<NaiveDate, ChannelActivity> = BTreeMap::new();
    for message in marts
        .messages
        .iter()
        .filter(|m| m.channel_pk.as_deref() == Some(channel.channel_pk.as_str()))
    {
        let Some(day) = activity_date(message) else {
            continue;
        };
        let row = days.entry(day).or_insert_with(|| ChannelActivity {
            activity_date: day,
            message_count: 0,
            detection_count: 0,
            total_views: 0,
            total_forwards: 0,
            total_replies: 0,
            messages_with_media: 0,
        });
        row.message_count += 1;
        row.detection_count += detections_per_message
            .get(&message.message_id)
            .copied()
            .unwrap_or(0);
        row.total_views += message.views_count;
        row.total_forwards += message.forwards_count;
        row.total_replies += message.replies_count;
        row.messages_with_media += usize::from(message.has_media);
    }
    Some(days.into_values().collect())
}

fn activity_date(message: &MessageFact) -> Option<NaiveDate> {
    message
        .message_timestamp_utc
        .map(|ts| ts.date_naive())
        .or(message.date_pk)
}

/// Messages whose text contains `query`, ignoring case.
pub fn search_messages<'a>(marts: &'a MartTables, query: &str, limit: usize) -> Vec<&'a MessageFact> {
    let needle = query.to_lowercase();
    marts
        .messages
        .iter()
        .filter(|m| {
            m.message_text
                .as_deref()
                .is_some_and(|text| text.to_lowercase().contains(&needle))
        })
        .take(limit)
        .collect()
}
