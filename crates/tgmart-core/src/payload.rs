//! Typed access to semi-structured raw payloads.
//!
//! Every accessor returns `Ok(None)` for an absent or `null` field and an error
//! when the field is present with a value that cannot be cast. Default policies
//! (zero counters, false flags) are applied by the staging transform, not here.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` is not {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{field}` holds a malformed timestamp `{value}`")]
    Timestamp { field: &'static str, value: String },
}

/// Parse an ISO-8601-like timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn present<'a>(fields: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    fields.get(field).filter(|v| !v.is_null())
}

fn int_value(field: &'static str, value: Option<&Value>) -> Result<Option<i64>, PayloadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let wrong = PayloadError::WrongType {
        field,
        expected: "an integer",
    };
    match value {
        Value::Number(n) => n.as_i64().map(Some).ok_or(wrong),
        Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| wrong),
        _ => Err(wrong),
    }
}

fn float_value(field: &'static str, value: Option<&Value>) -> Result<Option<f64>, PayloadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let wrong = PayloadError::WrongType {
        field,
        expected: "a number",
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(wrong),
    }
}

fn bool_value(field: &'static str, value: Option<&Value>) -> Result<Option<bool>, PayloadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let wrong = PayloadError::WrongType {
        field,
        expected: "a boolean",
    };
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(wrong),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok(Some(true)),
            "false" | "f" | "no" | "0" => Ok(Some(false)),
            _ => Err(wrong),
        },
        _ => Err(wrong),
    }
}

fn text_value(field: &'static str, value: Option<&Value>) -> Result<Option<String>, PayloadError> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(PayloadError::WrongType {
            field,
            expected: "text",
        }),
    }
}

fn timestamp_value(
    field: &'static str,
    value: Option<&Value>,
) -> Result<Option<DateTime<Utc>>, PayloadError> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) => parse_timestamp(s)
            .map(Some)
            .ok_or_else(|| PayloadError::Timestamp {
                field,
                value: s.clone(),
            }),
        Some(other) => Err(PayloadError::Timestamp {
            field,
            value: other.to_string(),
        }),
    }
}

/// Read view over one scraped message object.
#[derive(Debug, Clone, Copy)]
pub struct MessageDocument<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> MessageDocument<'a> {
    pub fn new(value: &'a Value) -> Result<Self, PayloadError> {
        value
            .as_object()
            .map(|fields| Self { fields })
            .ok_or(PayloadError::NotAnObject)
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        present(self.fields, field)
    }

    /// Media descriptor fields sit at the top level or inside a `media` object.
    fn media(&self, field: &str) -> Option<&'a Value> {
        self.get(field).or_else(|| {
            self.get("media")
                .and_then(Value::as_object)
                .and_then(|media| present(media, field))
        })
    }

    pub fn message_id(&self) -> Result<i64, PayloadError> {
        int_value("message_id", self.get("message_id"))?.ok_or(PayloadError::Missing("message_id"))
    }

    pub fn channel_username(&self) -> Result<Option<String>, PayloadError> {
        Ok(text_value("channel_username", self.get("channel_username"))?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    pub fn text(&self) -> Result<Option<String>, PayloadError> {
        text_value("text", self.get("text"))
    }

    pub fn date(&self) -> Result<Option<DateTime<Utc>>, PayloadError> {
        timestamp_value("date", self.get("date"))
    }

    pub fn views(&self) -> Result<Option<i64>, PayloadError> {
        int_value("views", self.get("views"))
    }

    pub fn forwards(&self) -> Result<Option<i64>, PayloadError> {
        int_value("forwards", self.get("forwards"))
    }

    pub fn replies_count(&self) -> Result<Option<i64>, PayloadError> {
        int_value("replies_count", self.get("replies_count"))
    }

    pub fn has_media(&self) -> Result<Option<bool>, PayloadError> {
        bool_value("has_media", self.get("has_media"))
    }

    pub fn media_type(&self) -> Result<Option<String>, PayloadError> {
        text_value("media_type", self.media("media_type"))
    }

    pub fn file_name(&self) -> Result<Option<String>, PayloadError> {
        text_value("file_name", self.media("file_name"))
    }

    pub fn mime_type(&self) -> Result<Option<String>, PayloadError> {
        text_value("mime_type", self.media("mime_type"))
    }

    pub fn file_size(&self) -> Result<Option<i64>, PayloadError> {
        int_value("file_size", self.media("file_size"))
    }

    pub fn is_photo(&self) -> Result<Option<bool>, PayloadError> {
        bool_value("is_photo", self.media("is_photo"))
    }

    pub fn is_document(&self) -> Result<Option<bool>, PayloadError> {
        bool_value("is_document", self.media("is_document"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub top_left_x: Option<f64>,
    pub top_left_y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

/// Read view over one element of a detection batch payload.
#[derive(Debug, Clone, Copy)]
pub struct DetectionDocument<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> DetectionDocument<'a> {
    pub fn new(value: &'a Value) -> Result<Self, PayloadError> {
        value
            .as_object()
            .map(|fields| Self { fields })
            .ok_or(PayloadError::NotAnObject)
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        present(self.fields, field)
    }

    pub fn message_id(&self) -> Result<Option<i64>, PayloadError> {
        int_value("message_id", self.get("message_id"))
    }

    pub fn object_class(&self) -> Result<Option<String>, PayloadError> {
        let value = self
            .get("detected_object_class")
            .or_else(|| self.get("object_class"));
        text_value("detected_object_class", value)
    }

    pub fn confidence(&self) -> Result<Option<f64>, PayloadError> {
        let value = self
            .get("confidence_score")
            .or_else(|| self.get("confidence"));
        float_value("confidence_score", value)
    }

    pub fn timestamp(&self) -> Result<Option<DateTime<Utc>>, PayloadError> {
        timestamp_value("detection_timestamp", self.get("detection_timestamp"))
    }

    /// Flat `box_*` fields, or a four-element `bbox` array `[x, y, width, height]`.
    pub fn bounding_box(&self) -> Result<BoundingBox, PayloadError> {
        if let Some(bbox) = self.get("bbox") {
            let items = bbox
                .as_array()
                .filter(|items| items.len() == 4)
                .ok_or(PayloadError::WrongType {
                    field: "bbox",
                    expected: "an array of four numbers",
                })?;
            return Ok(BoundingBox {
                top_left_x: float_value("bbox", Some(&items[0]))?,
                top_left_y: float_value("bbox", Some(&items[1]))?,
                width: float_value("bbox", Some(&items[2]))?,
                height: float_value("bbox", Some(&items[3]))?,
            });
        }
        Ok(BoundingBox {
            top_left_x: float_value("box_top_left_x", self.get("box_top_left_x"))?,
            top_left_y: float_value("box_top_left_y", self.get("box_top_left_y"))?,
            width: float_value("box_width", self.get("box_width"))?,
            height: float_value("box_height", self.get("box_height"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).single().unwrap();
        assert_eq!(parse_timestamp("2024-01-15T10:30:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T13:30:00+03:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15 10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T10:30:00Z"), Some(expected));
        assert!(parse_timestamp("2024-01-15T10:30:00.250").is_some());
        assert_eq!(parse_timestamp("15/01/2024"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn absent_and_null_fields_are_none() {
        let value = json!({"message_id": 7, "views": null});
        let doc = MessageDocument::new(&value).unwrap();
        assert_eq!(doc.message_id(), Ok(7));
        assert_eq!(doc.views(), Ok(None));
        assert_eq!(doc.forwards(), Ok(None));
        assert_eq!(doc.is_photo(), Ok(None));
    }

    #[test]
    fn casts_follow_relational_rules() {
        let value = json!({
            "message_id": "42",
            "views": "150",
            "is_photo": "t",
            "forwards": 1.5,
        });
        let doc = MessageDocument::new(&value).unwrap();
        assert_eq!(doc.message_id(), Ok(42));
        assert_eq!(doc.views(), Ok(Some(150)));
        assert_eq!(doc.is_photo(), Ok(Some(true)));
        assert!(matches!(
            doc.forwards(),
            Err(PayloadError::WrongType { field: "forwards", .. })
        ));
    }

    #[test]
    fn missing_message_id_is_an_error() {
        let value = json!({"text": "hi"});
        let doc = MessageDocument::new(&value).unwrap();
        assert_eq!(doc.message_id(), Err(PayloadError::Missing("message_id")));
        assert!(MessageDocument::new(&json!([1, 2])).is_err());
    }

    #[test]
    fn media_fields_can_be_nested() {
        let value = json!({
            "message_id": 1,
            "media": {"media_type": "MessageMediaDocument", "file_size": 2048, "is_document": true}
        });
        let doc = MessageDocument::new(&value).unwrap();
        assert_eq!(doc.media_type(), Ok(Some("MessageMediaDocument".to_string())));
        assert_eq!(doc.file_size(), Ok(Some(2048)));
        assert_eq!(doc.is_document(), Ok(Some(true)));
    }

    #[test]
    fn malformed_date_is_reported_with_value() {
        let value = json!({"message_id": 1, "date": "yesterday"});
        let doc = MessageDocument::new(&value).unwrap();
        assert_eq!(
            doc.date(),
            Err(PayloadError::Timestamp {
                field: "date",
                value: "yesterday".to_string()
            })
        );
    }

    #[test]
    fn detection_bounding_box_forms() {
        let flat = json!({
            "message_id": 100,
            "detected_object_class": "bottle",
            "confidence_score": 0.85,
            "box_top_left_x": 0.1,
            "box_top_left_y": 0.2,
            "box_width": 0.3,
            "box_height": 0.4,
        });
        let doc = DetectionDocument::new(&flat).unwrap();
        assert_eq!(doc.object_class(), Ok(Some("bottle".to_string())));
        assert_eq!(doc.confidence(), Ok(Some(0.85)));
        assert_eq!(doc.bounding_box().unwrap().height, Some(0.4));

        let array = json!({"bbox": [0.1, 0.2, 0.3, 0.4]});
        let doc = DetectionDocument::new(&array).unwrap();
        assert_eq!(doc.bounding_box().unwrap().top_left_x, Some(0.1));

        let short = json!({"bbox": [0.1, 0.2]});
        assert!(DetectionDocument::new(&short).unwrap().bounding_box().is_err());
    }
}
