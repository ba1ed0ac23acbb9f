//! Declarative data-quality constraints evaluated over the materialised marts.
//!
//! The check is read-only. Rules come from `rules/quality.yaml` when present:
//!
//! ```yaml
//! constraints:
//!   - kind: unique
//!     table: dim_channels
//!     column: channel_pk
//!   - kind: accepted_range
//!     table: fct_messages
//!     column: views_count
//!     min: 0
//!   - kind: relationship
//!     table: fct_image_detections
//!     column: message_id
//!     to_table: fct_messages
//!     to_column: message_id
//!     severity: warn
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tgmart_core::{ChannelDim, DateDim, ImageDetectionFact, MartTables, MessageFact};
use thiserror::Error;
use tracing::{error, info, warn};

/// Offending keys listed per constraint; the violation count stays exact.
const MAX_OFFENDING_KEYS: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QualityError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("unknown column `{table}.{column}`")]
    UnknownColumn { table: String, column: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    Unique {
        table: String,
        column: String,
        #[serde(default)]
        severity: Severity,
    },
    NotNull {
        table: String,
        column: String,
        #[serde(default)]
        severity: Severity,
    },
    /// Non-null values must exist in the target column.
    Relationship {
        table: String,
        column: String,
        to_table: String,
        to_column: String,
        #[serde(default)]
        severity: Severity,
    },
    /// Inclusive bounds; null values pass.
    AcceptedRange {
        table: String,
        column: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        severity: Severity,
    },
}

impl Constraint {
    pub fn unique(table: &str, column: &str) -> Self {
        Self::Unique {
            table: table.into(),
            column: column.into(),
            severity: Severity::Error,
        }
    }

    pub fn not_null(table: &str, column: &str) -> Self {
        Self::NotNull {
            table: table.into(),
            column: column.into(),
            severity: Severity::Error,
        }
    }

    pub fn relationship(table: &str, column: &str, to_table: &str, to_column: &str) -> Self {
        Self::Relationship {
            table: table.into(),
            column: column.into(),
            to_table: to_table.into(),
            to_column: to_column.into(),
            severity: Severity::Error,
        }
    }

    pub fn accepted_range(table: &str, column: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self::AcceptedRange {
            table: table.into(),
            column: column.into(),
            min,
            max,
            severity: Severity::Error,
        }
    }

    pub fn with_severity(mut self, level: Severity) -> Self {
        match &mut self {
            Self::Unique { severity, .. }
            | Self::NotNull { severity, .. }
            | Self::Relationship { severity, .. }
            | Self::AcceptedRange { severity, .. } => *severity = level,
        }
        self
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Unique { severity, .. }
            | Self::NotNull { severity, .. }
            | Self::Relationship { severity, .. }
            | Self::AcceptedRange { severity, .. } => *severity,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Unique { table, column, .. } => format!("unique({table}.{column})"),
            Self::NotNull { table, column, .. } => format!("not_null({table}.{column})"),
            Self::Relationship {
                table,
                column,
                to_table,
                to_column,
                ..
            } => format!("relationship({table}.{column} -> {to_table}.{to_column})"),
            Self::AcceptedRange {
                table,
                column,
                min,
                max,
                ..
            } => {
                let bound = |b: &Option<f64>| b.map_or_else(|| "-".to_string(), |v| v.to_string());
                format!("accepted_range({table}.{column}, {}..={})", bound(min), bound(max))
            }
        }
    }

    /// Reject references to tables or columns the marts do not have.
    pub fn validate(&self) -> Result<(), QualityError> {
        match self {
            Self::Unique { table, column, .. }
            | Self::NotNull { table, column, .. }
            | Self::AcceptedRange { table, column, .. } => check_column(table, column),
            Self::Relationship {
                table,
                column,
                to_table,
                to_column,
                ..
            } => {
                check_column(table, column)?;
                check_column(to_table, to_column)
            }
        }
    }
}

/// The constraint set applied when no rule file overrides it.
pub fn default_constraints() -> Vec<Constraint> {
    vec![
        Constraint::unique("dim_channels", "channel_pk"),
        Constraint::not_null("dim_channels", "channel_pk"),
        Constraint::unique("dim_channels", "channel_username"),
        Constraint::not_null("dim_channels", "channel_username"),
        Constraint::unique("dim_dates", "date_pk"),
        Constraint::not_null("dim_dates", "date_pk"),
        Constraint::unique("fct_image_detections", "detection_key"),
        Constraint::relationship("fct_messages", "channel_pk", "dim_channels", "channel_pk"),
        Constraint::relationship("fct_messages", "date_pk", "dim_dates", "date_pk"),
        Constraint::accepted_range("fct_messages", "views_count", Some(0.0), None),
        Constraint::accepted_range("fct_messages", "forwards_count", Some(0.0), None),
        Constraint::accepted_range("fct_messages", "replies_count", Some(0.0), None),
        Constraint::accepted_range("fct_image_detections", "confidence_score", Some(0.0), Some(1.0)),
        Constraint::relationship("fct_image_detections", "message_id", "fct_messages", "message_id")
            .with_severity(Severity::Warn),
    ]
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    constraints: Vec<Constraint>,
}

/// Constraints from `path`, or the defaults when the file does not exist.
pub fn load_rules(path: &Path) -> anyhow::Result<Vec<Constraint>> {
    if !path.exists() {
        return Ok(default_constraints());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rules: RuleFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for constraint in &rules.constraints {
        constraint
            .validate()
            .with_context(|| format!("invalid rule {} in {}", constraint.name(), path.display()))?;
    }
    info!(path = %path.display(), rules = rules.constraints.len(), "loaded quality rules");
    Ok(rules.constraints)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintResult {
    pub constraint: String,
    pub severity: Severity,
    pub rows_checked: usize,
    pub violations: usize,
    pub offending_keys: Vec<String>,
}

impl ConstraintResult {
    pub fn passed(&self) -> bool {
        self.violations == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub results: Vec<ConstraintResult>,
}

impl QualityReport {
    /// False when any error-severity constraint has violations.
    pub fn passed(&self) -> bool {
        self.failed_errors().next().is_none()
    }

    pub fn failed_errors(&self) -> impl Iterator<Item = &ConstraintResult> {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Error && !r.passed())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ConstraintResult> {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Warn && !r.passed())
    }
}

pub fn evaluate(marts: &MartTables, constraints: &[Constraint]) -> Result<QualityReport, QualityError> {
    let mut report = QualityReport::default();
    for constraint in constraints {
        constraint.validate()?;
        let (rows_checked, offending) = match constraint {
            Constraint::Unique { table, column, .. } => {
                let cells = column_cells(marts, table, column)?;
                let mut counts: BTreeMap<String, usize> = BTreeMap::new();
                for (_, cell) in &cells {
                    if let Some(key) = cell.key() {
                        *counts.entry(key).or_default() += 1;
                    }
                }
                let offending = cells
                    .iter()
                    .filter(|(_, cell)| cell.key().is_some_and(|k| counts[&k] > 1))
                    .map(|(row, _)| row.clone())
                    .collect::<Vec<_>>();
                (cells.len(), offending)
            }
            Constraint::NotNull { table, column, .. } => {
                let cells = column_cells(marts, table, column)?;
                let offending = cells
                    .iter()
                    .filter(|(_, cell)| matches!(cell, Cell::Null))
                    .map(|(row, _)| row.clone())
                    .collect::<Vec<_>>();
                (cells.len(), offending)
            }
            Constraint::Relationship {
                table,
                column,
                to_table,
                to_column,
                ..
            } => {
                let targets = column_cells(marts, to_table, to_column)?
                    .into_iter()
                    .filter_map(|(_, cell)| cell.key())
                    .collect::<HashSet<_>>();
                let cells = column_cells(marts, table, column)?;
                let offending = cells
                    .iter()
                    .filter(|(_, cell)| cell.key().is_some_and(|k| !targets.contains(&k)))
                    .map(|(row, _)| row.clone())
                    .collect::<Vec<_>>();
                (cells.len(), offending)
            }
            Constraint::AcceptedRange {
                table,
                column,
                min,
                max,
                ..
            } => {
                let cells = column_cells(marts, table, column)?;
                let offending = cells
                    .iter()
                    .filter(|(_, cell)| match cell {
                        Cell::Null => false,
                        other => match other.as_f64() {
                            Some(v) => min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m),
                            None => true,
                        },
                    })
                    .map(|(row, _)| row.clone())
                    .collect::<Vec<_>>();
                (cells.len(), offending)
            }
        };

        let result = ConstraintResult {
            constraint: constraint.name(),
            severity: constraint.severity(),
            rows_checked,
            violations: offending.len(),
            offending_keys: offending.into_iter().take(MAX_OFFENDING_KEYS).collect(),
        };
        match (result.passed(), result.severity) {
            (true, _) => {}
            (false, Severity::Error) => error!(
                constraint = %result.constraint,
                violations = result.violations,
                sample = ?result.offending_keys.first(),
                "quality constraint failed"
            ),
            (false, Severity::Warn) => warn!(
                constraint = %result.constraint,
                violations = result.violations,
                "quality constraint has warnings"
            ),
        }
        report.results.push(result);
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    /// Comparable text form; `None` for null.
    fn key(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Int(v) => Some(v.to_string()),
            Cell::Float(v) => Some(v.to_string()),
            Cell::Bool(v) => Some(v.to_string()),
            Cell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Cell::Timestamp(ts) => Some(tgmart_core::canonical_timestamp(*ts)),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cell::Null, Into::into)
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<&String> for Cell {
    fn from(value: &String) -> Self {
        Cell::Text(value.clone())
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<i32> for Cell {
    fn from(value: i32) -> Self {
        Cell::Int(i64::from(value))
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<NaiveDate> for Cell {
    fn from(value: NaiveDate) -> Self {
        Cell::Date(value)
    }
}

impl From<DateTime<Utc>> for Cell {
    fn from(value: DateTime<Utc>) -> Self {
        Cell::Timestamp(value)
    }
}

/// Column access by name for one mart row type.
trait MartRow {
    const COLUMNS: &'static [&'static str];

    fn row_key(&self) -> String;

    fn cell(&self, column: &str) -> Cell;
}

impl MartRow for ChannelDim {
    const COLUMNS: &'static [&'static str] = &["channel_pk", "channel_username"];

    fn row_key(&self) -> String {
        self.channel_username.clone()
    }

    fn cell(&self, column: &str) -> Cell {
        match column {
            "channel_pk" => (&self.channel_pk).into(),
            "channel_username" => (&self.channel_username).into(),
            _ => Cell::Null,
        }
    }
}

impl MartRow for DateDim {
    const COLUMNS: &'static [&'static str] = &[
        "date_pk",
        "day",
        "month",
        "month_name",
        "year",
        "quarter",
        "day_of_week",
        "day_of_year",
        "iso_week",
        "is_weekend",
    ];

    fn row_key(&self) -> String {
        self.date_pk.format("%Y-%m-%d").to_string()
    }

    fn cell(&self, column: &str) -> Cell {
        match column {
            "date_pk" => self.date_pk.into(),
            "day" => self.day.into(),
            "month" => self.month.into(),
            "month_name" => (&self.month_name).into(),
            "year" => self.year.into(),
            "quarter" => self.quarter.into(),
            "day_of_week" => self.day_of_week.into(),
            "day_of_year" => self.day_of_year.into(),
            "iso_week" => self.iso_week.into(),
            "is_weekend" => self.is_weekend.into(),
            _ => Cell::Null,
        }
    }
}

impl MartRow for MessageFact {
    const COLUMNS: &'static [&'static str] = &[
        "message_id",
        "channel_pk",
        "date_pk",
        "message_text",
        "message_timestamp_utc",
        "has_media",
        "views_count",
        "forwards_count",
        "replies_count",
        "media_type",
        "media_file_name",
        "media_mime_type",
        "media_file_size",
        "is_photo",
        "is_document",
    ];

    fn row_key(&self) -> String {
        format!(
            "{}/{}",
            self.channel_pk.as_deref().unwrap_or("-"),
            self.message_id
        )
    }

    fn cell(&self, column: &str) -> Cell {
        match column {
            "message_id" => self.message_id.into(),
            "channel_pk" => self.channel_pk.clone().into(),
            "date_pk" => self.date_pk.into(),
            "message_text" => self.message_text.clone().into(),
            "message_timestamp_utc" => self.message_timestamp_utc.into(),
            "has_media" => self.has_media.into(),
            "views_count" => self.views_count.into(),
            "forwards_count" => self.forwards_count.into(),
            "replies_count" => self.replies_count.into(),
            "media_type" => self.media_type.clone().into(),
            "media_file_name" => self.media_file_name.clone().into(),
            "media_mime_type" => self.media_mime_type.clone().into(),
            "media_file_size" => self.media_file_size.into(),
            "is_photo" => self.is_photo.into(),
            "is_document" => self.is_document.into(),
            _ => Cell::Null,
        }
    }
}

impl MartRow for ImageDetectionFact {
    const COLUMNS: &'static [&'static str] = &[
        "detection_key",
        "message_id",
        "detected_object_class",
        "confidence_score",
        "box_top_left_x",
        "box_top_left_y",
        "box_width",
        "box_height",
        "detection_timestamp",
        "loaded_at",
    ];

    fn row_key(&self) -> String {
        self.detection_key.clone()
    }

    fn cell(&self, column: &str) -> Cell {
        match column {
            "detection_key" => (&self.detection_key).into(),
            "message_id" => self.message_id.into(),
            "detected_object_class" => self.detected_object_class.clone().into(),
            "confidence_score" => self.confidence_score.into(),
            "box_top_left_x" => self.box_top_left_x.into(),
            "box_top_left_y" => self.box_top_left_y.into(),
            "box_width" => self.box_width.into(),
            "box_height" => self.box_height.into(),
            "detection_timestamp" => self.detection_timestamp.into(),
            "loaded_at" => self.loaded_at.into(),
            _ => Cell::Null,
        }
    }
}

fn table_columns(table: &str) -> Result<&'static [&'static str], QualityError> {
    match table {
        "dim_channels" => Ok(ChannelDim::COLUMNS),
        "dim_dates" => Ok(DateDim::COLUMNS),
        "fct_messages" => Ok(MessageFact::COLUMNS),
        "fct_image_detections" => Ok(ImageDetectionFact::COLUMNS),
        other => Err(QualityError::UnknownTable(other.to_string())),
    }
}

fn check_column(table: &str, column: &str) -> Result<(), QualityError> {
    if table_columns(table)?.contains(&column) {
        Ok(())
    } else {
        Err(QualityError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

fn cells_of<R: MartRow>(rows: &[R], column: &str) -> Vec<(String, Cell)> {
    rows.iter().map(|r| (r.row_key(), r.cell(column))).collect()
}

fn column_cells(
    marts: &MartTables,
    table: &str,
    column: &str,
) -> Result<Vec<(String, Cell)>, QualityError> {
    check_column(table, column)?;
    Ok(match table {
        "dim_channels" => cells_of(&marts.channels, column),
        "dim_dates" => cells_of(&marts.dates, column),
        "fct_messages" => cells_of(&marts.messages, column),
        _ => cells_of(&marts.detections, column),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tgmart_core::channel_key;

    fn message(message_id: i64, channel: Option<&str>, views: i64) -> MessageFact {
        MessageFact {
            message_id,
            channel_pk: channel.map(channel_key),
            date_pk: None,
            message_text: None,
            message_timestamp_utc: None,
            has_media: false,
            views_count: views,
            forwards_count: 0,
            replies_count: 0,
            media_type: None,
            media_file_name: None,
            media_mime_type: None,
            media_file_size: None,
            is_photo: false,
            is_document: false,
        }
    }

    fn detection(key: &str, message_id: i64, confidence: f64) -> ImageDetectionFact {
        ImageDetectionFact {
            detection_key: key.into(),
            message_id: Some(message_id),
            detected_object_class: Some("bottle".into()),
            confidence_score: Some(confidence),
            box_top_left_x: None,
            box_top_left_y: None,
            box_width: None,
            box_height: None,
            detection_timestamp: None,
            loaded_at: Utc::now(),
        }
    }

    fn marts() -> MartTables {
        MartTables {
            channels: vec![ChannelDim {
                channel_pk: channel_key("chan1"),
                channel_username: "chan1".into(),
            }],
            dates: vec![DateDim::from_date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())],
            messages: vec![message(100, Some("chan1"), 150), message(101, None, 3)],
            detections: vec![detection("k1", 100, 0.85)],
        }
    }

    #[test]
    fn clean_marts_pass_defaults() {
        let report = evaluate(&marts(), &default_constraints()).expect("evaluate");
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.warnings().count(), 0);
    }

    #[test]
    fn negative_views_and_bad_confidence_are_flagged() {
        let mut tables = marts();
        tables.messages.push(message(102, Some("chan1"), -5));
        tables.detections.push(detection("k2", 100, 1.2));
        let before = tables.clone();

        let report = evaluate(&tables, &default_constraints()).expect("evaluate");
        assert!(!report.passed());
        let failed = report.failed_errors().collect::<Vec<_>>();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].constraint, "accepted_range(fct_messages.views_count, 0..=-)");
        assert_eq!(failed[0].offending_keys, vec![format!("{}/102", channel_key("chan1"))]);
        assert_eq!(failed[1].offending_keys, vec!["k2".to_string()]);
        assert_eq!(tables, before);
    }

    #[test]
    fn dangling_keys_and_orphan_detections() {
        let mut tables = marts();
        tables.messages.push(message(103, Some("ghost"), 0));
        tables.detections.push(detection("k3", 999, 0.5));
        let report = evaluate(&tables, &default_constraints()).expect("evaluate");

        let failed = report.failed_errors().map(|r| r.constraint.as_str()).collect::<Vec<_>>();
        assert_eq!(failed, vec!["relationship(fct_messages.channel_pk -> dim_channels.channel_pk)"]);
        let warnings = report.warnings().collect::<Vec<_>>();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].offending_keys, vec!["k3".to_string()]);
    }

    #[test]
    fn duplicate_keys_list_every_offender() {
        let mut tables = marts();
        tables.detections.push(detection("k1", 100, 0.9));
        let report = evaluate(&tables, &[Constraint::unique("fct_image_detections", "detection_key")])
            .expect("evaluate");
        assert_eq!(report.results[0].violations, 2);
    }

    #[test]
    fn rule_file_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("quality.yaml");
        assert_eq!(load_rules(&path).expect("defaults"), default_constraints());

        std::fs::write(
            &path,
            "constraints:\n  - kind: accepted_range\n    table: fct_messages\n    column: views_count\n    min: 0\n    max: 100\n    severity: warn\n",
        )
        .unwrap();
        let rules = load_rules(&path).expect("rules");
        assert_eq!(
            rules,
            vec![Constraint::accepted_range("fct_messages", "views_count", Some(0.0), Some(100.0))
                .with_severity(Severity::Warn)]
        );
        let report = evaluate(&marts(), &rules).expect("evaluate");
        assert!(report.passed());
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("quality.yaml");
        std::fs::write(
            &path,
            "constraints:\n  - kind: unique\n    table: fct_messages\n    column: nope\n",
        )
        .unwrap();
        assert!(load_rules(&path).is_err());
        assert_eq!(
            Constraint::not_null("dim_nothing", "x").validate(),
            Err(QualityError::UnknownTable("dim_nothing".into()))
        );
    }
}
