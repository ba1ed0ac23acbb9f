//! Stage orchestration: load messages, load detections, staging, dimensional,
//! quality, then run reports and snapshots under `reports/<run_id>/`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tgmart_core::MartTables;
use tgmart_storage::Warehouse;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dimensional::build_marts;
use crate::export::export_mart_snapshots;
use crate::loader::{DetectionLoader, LoadSummary, MessageLoader};
use crate::quality::{evaluate, load_rules, QualityReport};
use crate::staging::{stage_all, StagingReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Migrate,
    LoadMessages,
    LoadDetections,
    Staging,
    Dimensional,
    Quality,
    Export,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Migrate => "migrate",
            Stage::LoadMessages => "load_messages",
            Stage::LoadDetections => "load_detections",
            Stage::Staging => "staging",
            Stage::Dimensional => "dimensional",
            Stage::Quality => "quality",
            Stage::Export => "export",
            Stage::Report => "report",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source:#}")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error("data-quality gate failed: {failed} error-severity constraint(s) violated")]
    QualityGate { failed: usize, report: QualityReport },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Stage { stage, .. } => *stage,
            PipelineError::QualityGate { .. } => Stage::Quality,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    QualityFailed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub backend: String,
    pub status: RunStatus,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub messages: Option<LoadSummary>,
    pub detections: Option<LoadSummary>,
    pub staging: Option<StagingReport>,
    pub mart_rows: BTreeMap<String, usize>,
    pub quality: Option<QualityReport>,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

async fn run_stage<T, F>(stage: Stage, work: F) -> Result<T, PipelineError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let outcome = work.instrument(info_span!("stage", %stage)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(value) => {
            info!(%stage, elapsed_ms, "stage finished");
            Ok(value)
        }
        Err(source) => {
            error!(%stage, elapsed_ms, error = %format!("{source:#}"), "stage failed");
            Err(PipelineError::Stage { stage, source })
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { config, warehouse }
    }

    /// Open the warehouse named by `config.database_url`.
    pub async fn connect(config: PipelineConfig) -> anyhow::Result<Self> {
        let warehouse = tgmart_storage::connect(&config.database_url, config.max_connections)
            .await
            .context("connecting to the warehouse")?;
        Ok(Self::new(config, warehouse))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub async fn migrate(&self) -> Result<(), PipelineError> {
        run_stage(Stage::Migrate, async {
            self.warehouse.migrate().await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }

    pub async fn load_messages(&self) -> Result<LoadSummary, PipelineError> {
        run_stage(Stage::LoadMessages, async {
            Ok::<_, anyhow::Error>(MessageLoader::new(Arc::clone(&self.warehouse), &self.config)
                .run()
                .await?)
        })
        .await
    }

    pub async fn load_detections(&self) -> Result<LoadSummary, PipelineError> {
        run_stage(Stage::LoadDetections, async {
            Ok::<_, anyhow::Error>(DetectionLoader::new(Arc::clone(&self.warehouse), &self.config)
                .run()
                .await?)
        })
        .await
    }

    /// Fail `stage` when the summary is over the configured reject ratio.
    pub fn enforce_budget(&self, stage: Stage, summary: &LoadSummary) -> Result<(), PipelineError> {
        summary
            .check_budget(self.config.max_reject_ratio)
            .map_err(|err| {
                error!(%stage, error = %err, "failure budget exceeded");
                PipelineError::Stage {
                    stage,
                    source: err.into(),
                }
            })
    }

    pub async fn run_staging(&self) -> Result<StagingReport, PipelineError> {
        run_stage(Stage::Staging, async {
            let messages = self.warehouse.raw_messages().await?;
            let batches = self.warehouse.raw_detection_batches().await?;
            let (tables, report) = stage_all(&messages, &batches);
            self.warehouse.replace_staging(&tables).await?;
            info!(
                messages = report.messages_staged,
                detections = report.detections_staged,
                rejected = report.messages_rejected + report.detections_rejected,
                "staging tables replaced"
            );
            Ok::<_, anyhow::Error>(report)
        })
        .await
    }

    pub async fn run_dimensional(&self) -> Result<MartTables, PipelineError> {
        run_stage(Stage::Dimensional, async {
            let staging = self.warehouse.staging().await?;
            let marts = build_marts(&staging, Utc::now());
            self.warehouse.replace_marts(&marts).await?;
            for (table, rows) in marts.row_counts() {
                info!(table, rows, "mart table replaced");
            }
            Ok::<_, anyhow::Error>(marts)
        })
        .await
    }

    /// Evaluate the quality rules. Violations are reported, not raised.
    pub async fn run_quality(&self) -> Result<QualityReport, PipelineError> {
        run_stage(Stage::Quality, async {
            let rules = load_rules(&self.config.quality_rules_path())?;
            let marts = self.warehouse.marts().await?;
            Ok::<_, anyhow::Error>(evaluate(&marts, &rules)?)
        })
        .await
    }

    pub async fn export_snapshots(&self, out_dir: &Path) -> Result<PathBuf, PipelineError> {
        run_stage(Stage::Export, async {
            let marts = self.warehouse.marts().await?;
            export_mart_snapshots(out_dir, &marts)
        })
        .await
    }

    /// All stages in order. Writes `run_summary.md` and `run.json` whatever the outcome.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let run_dir = self.config.reports_dir.join(run_id.to_string());
        let mut summary = RunSummary {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            backend: self.warehouse.backend_name().to_string(),
            status: RunStatus::Running,
            failed_stage: None,
            error: None,
            messages: None,
            detections: None,
            staging: None,
            mart_rows: BTreeMap::new(),
            quality: None,
            reports_dir: run_dir.display().to_string(),
            parquet_manifest: None,
        };
        info!(%run_id, backend = %summary.backend, "pipeline run started");

        let outcome = self.run_stages(&run_dir, &mut summary).await;
        summary.finished_at = Some(Utc::now());
        match &outcome {
            Ok(()) => summary.status = RunStatus::Succeeded,
            Err(PipelineError::QualityGate { .. }) => {
                summary.status = RunStatus::QualityFailed;
                summary.failed_stage = Some(Stage::Quality);
            }
            Err(err) => {
                summary.status = RunStatus::Failed;
                summary.failed_stage = Some(err.stage());
                summary.error = Some(err.to_string());
            }
        }

        let written = run_stage(Stage::Report, write_run_reports(&run_dir, &summary)).await;
        info!(%run_id, status = ?summary.status, "pipeline run finished");
        match (outcome, written) {
            (Ok(()), Ok(())) => Ok(summary),
            (Ok(()), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(report_err)) => {
                warn!(error = %report_err, "run report could not be written");
                Err(err)
            }
        }
    }

    async fn run_stages(&self, run_dir: &Path, summary: &mut RunSummary) -> Result<(), PipelineError> {
        self.migrate().await?;

        let messages = self.load_messages().await?;
        summary.messages = Some(messages.clone());
        self.enforce_budget(Stage::LoadMessages, &messages)?;

        let detections = self.load_detections().await?;
        summary.detections = Some(detections.clone());
        self.enforce_budget(Stage::LoadDetections, &detections)?;

        summary.staging = Some(self.run_staging().await?);

        let marts = self.run_dimensional().await?;
        summary.mart_rows = marts
            .row_counts()
            .into_iter()
            .map(|(table, rows)| (table.to_string(), rows))
            .collect();

        let quality = self.run_quality().await?;
        summary.quality = Some(quality.clone());

        let manifest = self.export_snapshots(run_dir).await?;
        summary.parquet_manifest = Some(manifest.display().to_string());

        if !quality.passed() {
            return Err(PipelineError::QualityGate {
                failed: quality.failed_errors().count(),
                report: quality,
            });
        }
        Ok(())
    }
}

async fn write_run_reports(run_dir: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join("run_summary.md"), render_run_summary(summary))
        .await
        .context("writing run_summary.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run.json"), json)
        .await
        .context("writing run.json")?;
    Ok(())
}

pub fn render_run_summary(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# tgmart run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!(
            "- Finished: {}",
            summary
                .finished_at
                .map_or_else(|| "-".to_string(), |t| t.to_string())
        ),
        format!("- Backend: {}", summary.backend),
        format!("- Status: {:?}", summary.status),
    ];
    if let Some(stage) = summary.failed_stage {
        lines.push(format!("- Failed stage: {stage}"));
    }
    if let Some(error) = &summary.error {
        lines.push(format!("- Error: {error}"));
    }

    lines.push(String::new());
    lines.push("## Loads".to_string());
    lines.push(String::new());
    lines.push("| loader | files | loaded | skipped | failed | records | inserted | duplicates | rejected |".to_string());
    lines.push("|---|---|---|---|---|---|---|---|---|".to_string());
    for (name, load) in [("messages", &summary.messages), ("detections", &summary.detections)] {
        if let Some(l) = load {
            lines.push(format!(
                "| {name} | {} | {} | {} | {} | {} | {} | {} | {} |",
                l.files_seen,
                l.files_loaded,
                l.files_skipped,
                l.files_failed,
                l.records_seen,
                l.inserted,
                l.duplicates,
                l.rejected
            ));
        }
    }

    if let Some(staging) = &summary.staging {
        lines.push(String::new());
        lines.push("## Staging".to_string());
        lines.push(format!(
            "- messages staged: {} (rejected {})",
            staging.messages_staged, staging.messages_rejected
        ));
        lines.push(format!(
            "- detections staged: {} (rejected {})",
            staging.detections_staged, staging.detections_rejected
        ));
    }

    if !summary.mart_rows.is_empty() {
        lines.push(String::new());
        lines.push("## Marts".to_string());
        for (table, rows) in &summary.mart_rows {
            lines.push(format!("- {table}: {rows}"));
        }
    }

    if let Some(quality) = &summary.quality {
        lines.push(String::new());
        lines.push("## Quality".to_string());
        for result in &quality.results {
            let verdict = if result.passed() { "PASS" } else { "FAIL" };
            let mut line = format!(
                "- {verdict} [{:?}] {}",
                result.severity, result.constraint
            );
            if !result.passed() {
                line.push_str(&format!(
                    ": {} violation(s), e.g. `{}`",
                    result.violations,
                    result.offending_keys.first().map(String::as_str).unwrap_or("-")
                ));
            }
            lines.push(line);
        }
    }

    if let Some(manifest) = &summary.parquet_manifest {
        lines.push(String::new());
        lines.push(format!("- parquet manifest: `{manifest}`"));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tgmart_storage::MemoryWarehouse;

    #[tokio::test]
    async fn empty_lake_runs_clean() {
        let dir = tempdir().expect("tempdir");
        let config = PipelineConfig::in_memory(dir.path().join("lake"), dir.path().join("reports"));
        let pipeline = Pipeline::new(config, Arc::new(MemoryWarehouse::new()));

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.mart_rows.get("fct_messages"), Some(&0));

        let run_dir = PathBuf::from(&summary.reports_dir);
        let markdown = std::fs::read_to_string(run_dir.join("run_summary.md")).expect("markdown");
        assert!(markdown.contains("- Status: Succeeded"));
        assert!(run_dir.join("run.json").exists());
        assert!(run_dir.join("snapshots").join("manifest.json").exists());
    }

    #[tokio::test]
    async fn storage_outage_fails_the_first_write_stage() {
        let dir = tempdir().expect("tempdir");
        let config = PipelineConfig::in_memory(dir.path().join("lake"), dir.path().join("reports"));
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.set_unavailable(true);
        let pipeline = Pipeline::new(config, warehouse);

        let err = pipeline.run().await.unwrap_err();
        assert_eq!(err.stage(), Stage::Staging);
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::LoadMessages.to_string(), "load_messages");
        assert_eq!(
            serde_json::to_string(&Stage::LoadDetections).unwrap(),
            "\"load_detections\""
        );
    }
}
