use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tgmart_core::{channel_key, MartTables};
use tgmart_storage::{MemoryWarehouse, RawLake, Warehouse};
use tgmart_sync::{Pipeline, PipelineConfig, PipelineError, RunStatus, Stage};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

fn config(dir: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig::in_memory(dir.path().join("lake"), dir.path().join("reports"));
    config.workspace_root = dir.path().to_path_buf();
    config
}

async fn write_messages(lake_dir: &Path, date: NaiveDate, channel: &str, body: serde_json::Value) {
    RawLake::new(lake_dir)
        .write_message_partition(date, channel, &serde_json::to_vec(&body).unwrap())
        .await
        .expect("write partition");
}

async fn write_detections(lake_dir: &Path, file_name: &str, body: serde_json::Value) {
    RawLake::new(lake_dir)
        .write_detection_file(file_name, &serde_json::to_vec(&body).unwrap())
        .await
        .expect("write detections");
}

fn bottle() -> serde_json::Value {
    json!({
        "message_id": 100,
        "detected_object_class": "bottle",
        "confidence_score": 0.85,
        "detection_timestamp": "2024-01-15T10:00:00Z",
        "box_top_left_x": 12.0,
        "box_top_left_y": 40.5,
        "box_width": 100.0,
        "box_height": 220.0
    })
}

async fn seed_lake(dir: &TempDir) {
    let lake = dir.path().join("lake");
    write_messages(
        &lake,
        day(),
        "chan1",
        json!([
            {"message_id": 100, "channel_username": "chan1", "date": "2024-01-15T10:00:00Z",
             "text": "Amoxicillin 500mg in stock", "views": 150, "forwards": 3,
             "has_media": true, "media_type": "MessageMediaPhoto", "is_photo": true},
            {"message_id": 101, "channel_username": "chan1", "date": "2024-01-15T11:30:00+03:00",
             "text": "no counters here"}
        ]),
    )
    .await;
    write_messages(
        &lake,
        NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
        "chan2",
        json!([{"message_id": 100, "text": "same id, other channel", "views": 7}]),
    )
    .await;
    write_detections(&lake, "yolo_detections_20240115.json", json!([bottle(), bottle()])).await;
}

fn pipeline(config: PipelineConfig) -> (Pipeline, Arc<MemoryWarehouse>) {
    let warehouse = Arc::new(MemoryWarehouse::new());
    (Pipeline::new(config, warehouse.clone()), warehouse)
}

fn assert_same_content(a: &MartTables, b: &MartTables) {
    assert_eq!(a.channels, b.channels);
    assert_eq!(a.dates, b.dates);
    assert_eq!(a.messages, b.messages);
    let keys = |m: &MartTables| m.detections.iter().map(|d| d.detection_key.clone()).collect::<Vec<_>>();
    assert_eq!(keys(a), keys(b));
}

#[tokio::test]
async fn single_message_lands_in_the_star_schema() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (pipeline, warehouse) = pipeline(config(&dir));

    let summary = pipeline.run().await.expect("run");
    assert_eq!(summary.status, RunStatus::Succeeded);

    let marts = warehouse.marts().await.expect("marts");
    let fact = marts
        .messages
        .iter()
        .find(|m| m.message_id == 100 && m.channel_pk.as_deref() == Some(channel_key("chan1").as_str()))
        .expect("fact for chan1/100");
    assert_eq!(fact.channel_pk.as_deref(), Some("797e5887b3e390bc65acb5a81c47d1fe"));
    assert_eq!(fact.date_pk, Some(day()));
    assert_eq!(fact.views_count, 150);
    assert!(fact.has_media);

    let date = marts.dates.iter().find(|d| d.date_pk == day()).expect("date row");
    assert_eq!(date.day_of_week, 1);
    assert!(!date.is_weekend);
    let saturday = marts
        .dates
        .iter()
        .find(|d| d.date_pk == NaiveDate::from_ymd_opt(2024, 1, 20).unwrap())
        .expect("date row");
    assert!(saturday.is_weekend);
}

#[tokio::test]
async fn missing_counters_default_to_zero() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (pipeline, warehouse) = pipeline(config(&dir));
    pipeline.run().await.expect("run");

    let marts = warehouse.marts().await.expect("marts");
    let fact = marts.messages.iter().find(|m| m.message_id == 101).expect("fact 101");
    assert_eq!(fact.views_count, 0);
    assert_eq!(fact.forwards_count, 0);
    assert_eq!(fact.replies_count, 0);
    assert!(!fact.has_media);
    assert_eq!(
        fact.message_timestamp_utc.map(|ts| ts.to_rfc3339()),
        Some("2024-01-15T08:30:00+00:00".to_string())
    );
}

#[tokio::test]
async fn identical_detections_collapse_to_one_fact() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (pipeline, warehouse) = pipeline(config(&dir));
    pipeline.run().await.expect("run");

    let staging = warehouse.staging().await.expect("staging");
    assert_eq!(staging.detections.len(), 2);
    let marts = warehouse.marts().await.expect("marts");
    assert_eq!(marts.detections.len(), 1);
    assert_eq!(marts.detections[0].detection_key, "85ec1524d09017715a898824cf1aed9e");
    assert_eq!(marts.detections[0].box_height, Some(220.0));
}

#[tokio::test]
async fn rerunning_inserts_nothing_and_rebuilds_the_same_marts() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (pipeline, warehouse) = pipeline(config(&dir));

    let first = pipeline.run().await.expect("first run");
    let first_marts = warehouse.marts().await.expect("marts");
    assert_eq!(first.messages.as_ref().map(|l| l.inserted), Some(3));

    let second = pipeline.run().await.expect("second run");
    let messages = second.messages.expect("message load");
    assert_eq!(messages.inserted, 0);
    assert_eq!(messages.duplicates, 3);
    let detections = second.detections.expect("detection load");
    assert_eq!(detections.inserted, 0);
    assert_eq!(detections.duplicates, 1);
    assert_eq!((detections.files_loaded, detections.files_skipped), (0, 1));

    assert_eq!(warehouse.raw_messages().await.expect("raw").len(), 3);
    assert_same_content(&first_marts, &warehouse.marts().await.expect("marts"));
}

#[tokio::test]
async fn redelivered_partition_leaves_one_row() {
    let dir = tempdir().expect("tempdir");
    let lake = dir.path().join("lake");
    let body = json!([{"message_id": 100, "channel_username": "chan1", "views": 150}]);
    let (pipeline, warehouse) = pipeline(config(&dir));

    write_messages(&lake, day(), "chan1", body.clone()).await;
    pipeline.load_messages().await.expect("first load");
    write_messages(&lake, day(), "chan1", body).await;
    let second = pipeline.load_messages().await.expect("second load");
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 1);

    let raw = warehouse.raw_messages().await.expect("raw");
    assert_eq!(raw.len(), 1);
    assert_eq!((raw[0].message_id, raw[0].channel_username.as_str()), (100, "chan1"));

    pipeline.run().await.expect("run");
    let marts = warehouse.marts().await.expect("marts");
    assert_eq!(marts.messages.len(), 1);
    assert_eq!(marts.messages[0].views_count, 150);
    assert_eq!(marts.messages[0].channel_pk, Some(channel_key("chan1")));
}

#[tokio::test]
async fn independent_runs_derive_identical_keys() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (a, wa) = pipeline(config(&dir));
    let (b, wb) = pipeline(config(&dir));
    a.run().await.expect("run a");
    b.run().await.expect("run b");
    assert_same_content(
        &wa.marts().await.expect("marts a"),
        &wb.marts().await.expect("marts b"),
    );
}

#[tokio::test]
async fn every_fact_key_resolves_to_a_dimension_row() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (pipeline, warehouse) = pipeline(config(&dir));
    pipeline.run().await.expect("run");

    let marts = warehouse.marts().await.expect("marts");
    assert_eq!(marts.messages.len(), 3);
    for fact in &marts.messages {
        let channel_pk = fact.channel_pk.as_deref().expect("channel key");
        assert_eq!(marts.channels.iter().filter(|c| c.channel_pk == channel_pk).count(), 1);
        let date_pk = fact.date_pk.expect("date key");
        assert_eq!(marts.dates.iter().filter(|d| d.date_pk == date_pk).count(), 1);
    }
}

#[tokio::test]
async fn malformed_partition_fails_alone_and_trips_the_budget() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let bad = RawLake::new(dir.path().join("lake")).message_partition_path(day(), "broken");
    std::fs::write(&bad, b"[{\"message_id\": 1},").unwrap();
    let (pipeline, warehouse) = pipeline(config(&dir));

    let loaded = pipeline.load_messages().await.expect("load");
    assert_eq!(loaded.files_seen, 3);
    assert_eq!(loaded.files_failed, 1);
    assert_eq!(loaded.inserted, 3);

    let raw = warehouse.raw_messages().await.expect("raw");
    assert!(raw.iter().all(|r| r.channel_username != "broken"));

    let err = pipeline.run().await.unwrap_err();
    assert_eq!(err.stage(), Stage::LoadMessages);
}

#[tokio::test]
async fn unavailable_store_aborts_without_writing() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    let (pipeline, warehouse) = pipeline(config(&dir));
    warehouse.set_unavailable(true);

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Stage { stage: Stage::LoadMessages, .. }));

    warehouse.set_unavailable(false);
    assert!(warehouse.raw_messages().await.expect("raw").is_empty());
    assert!(warehouse.marts().await.expect("marts").messages.is_empty());
}

#[tokio::test]
async fn quality_gate_flags_bad_rows_and_keeps_the_data() {
    let dir = tempdir().expect("tempdir");
    let lake = dir.path().join("lake");
    write_messages(
        &lake,
        day(),
        "chan1",
        json!([{"message_id": 100, "views": -5}]),
    )
    .await;
    write_detections(
        &lake,
        "yolo_detections_bad.json",
        json!([{"message_id": 100, "detected_object_class": "bottle", "confidence_score": 1.2}]),
    )
    .await;
    let (pipeline, warehouse) = pipeline(config(&dir));

    let (failed, report) = match pipeline.run().await {
        Err(PipelineError::QualityGate { failed, report }) => (failed, report),
        other => panic!("expected a quality gate failure, got {other:?}"),
    };
    assert_eq!(failed, 2);
    let failures = report.failed_errors().map(|r| r.constraint.clone()).collect::<Vec<_>>();
    assert!(failures.iter().any(|c| c.contains("views_count")));
    assert!(failures.iter().any(|c| c.contains("confidence_score")));

    let marts = warehouse.marts().await.expect("marts");
    assert_eq!(marts.messages[0].views_count, -5);
    assert_eq!(marts.detections[0].confidence_score, Some(1.2));

    let run_dirs = std::fs::read_dir(dir.path().join("reports"))
        .expect("reports dir")
        .filter_map(Result::ok)
        .collect::<Vec<_>>();
    assert_eq!(run_dirs.len(), 1);
    let run_json: serde_json::Value = serde_json::from_slice(
        &std::fs::read(run_dirs[0].path().join("run.json")).expect("run.json"),
    )
    .expect("parse run.json");
    assert_eq!(run_json["status"], "quality_failed");
}

#[tokio::test]
async fn untargeted_channels_and_empty_detection_files_are_skipped() {
    let dir = tempdir().expect("tempdir");
    seed_lake(&dir).await;
    write_detections(&dir.path().join("lake"), "yolo_detections_empty.json", json!([])).await;
    let mut config = config(&dir);
    config.target_channels = Some(vec!["chan1".to_string()]);
    let (pipeline, warehouse) = pipeline(config);

    let summary = pipeline.run().await.expect("run");
    let messages = summary.messages.expect("message load");
    assert_eq!(messages.files_skipped, 1);
    assert_eq!(messages.inserted, 2);
    let detections = summary.detections.expect("detection load");
    assert_eq!(detections.files_skipped, 1);
    assert_eq!(detections.inserted, 1);

    assert!(!warehouse
        .detection_batch_exists("yolo_detections_empty.json")
        .await
        .expect("exists"));
    let marts = warehouse.marts().await.expect("marts");
    assert_eq!(marts.channels.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_partitions_keep_the_earliest_date_at_any_concurrency() {
    let dir = tempdir().expect("tempdir");
    let lake = dir.path().join("lake");
    let first_day = day();
    let next_day = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
    let last_day = NaiveDate::from_ymd_opt(2024, 1, 17).unwrap();

    let backlog = (100..2100)
        .map(|id| json!({"message_id": id, "channel_username": "chan1", "views": 1}))
        .collect::<Vec<_>>();
    write_messages(&lake, first_day, "chan1", json!(backlog)).await;
    // The scraper re-emits recent messages into the following days.
    write_messages(
        &lake,
        next_day,
        "chan1",
        json!([{"message_id": 100, "channel_username": "chan1", "views": 2},
               {"message_id": 2100, "channel_username": "chan1"}]),
    )
    .await;
    write_messages(
        &lake,
        last_day,
        "chan1",
        json!([{"message_id": 2100, "channel_username": "chan1"}]),
    )
    .await;
    write_messages(&lake, next_day, "chan2", json!([{"message_id": 100}])).await;

    for concurrency in [1, 4, 8] {
        let mut config = config(&dir);
        config.load_concurrency = concurrency;
        config.batch_size = 50;
        let (pipeline, warehouse) = pipeline(config);

        let summary = pipeline.load_messages().await.expect("load");
        assert_eq!(summary.inserted, 2002, "concurrency {concurrency}");
        assert_eq!(summary.duplicates, 2, "concurrency {concurrency}");

        let raw = warehouse.raw_messages().await.expect("raw");
        assert_eq!(raw.len(), 2002, "concurrency {concurrency}");
        let date_of = |channel: &str, id: i64| {
            let matching = raw
                .iter()
                .filter(|r| r.channel_username == channel && r.message_id == id)
                .map(|r| r.partition_date)
                .collect::<Vec<_>>();
            assert_eq!(matching.len(), 1, "{channel}/{id} at concurrency {concurrency}");
            matching[0]
        };
        assert_eq!(date_of("chan1", 100), first_day);
        assert_eq!(date_of("chan1", 2100), next_day);
        assert_eq!(date_of("chan2", 100), next_day);

        pipeline.run().await.expect("run");
        let marts = warehouse.marts().await.expect("marts");
        let fact = marts
            .messages
            .iter()
            .find(|m| m.message_id == 100 && m.channel_pk == Some(channel_key("chan1")))
            .expect("chan1/100 fact");
        assert_eq!(fact.date_pk, Some(first_day));
        assert_eq!(fact.views_count, 1);
    }
}
