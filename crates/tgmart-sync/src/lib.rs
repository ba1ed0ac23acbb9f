//! Raw-to-mart pipeline for scraped channel messages and image detections.

pub mod config;
pub mod dimensional;
pub mod export;
pub mod loader;
pub mod pipeline;
pub mod quality;
pub mod reports;
pub mod staging;

pub use config::{ChannelConfig, ChannelRegistry, PipelineConfig};
pub use export::{export_mart_snapshots, ParquetManifest, ParquetManifestFile};
pub use loader::{DetectionLoader, LoadError, LoadFailure, LoadSummary, MessageLoader};
pub use pipeline::{Pipeline, PipelineError, RunStatus, RunSummary, Stage};
pub use quality::{default_constraints, Constraint, QualityReport, Severity};
pub use staging::{StagingReject, StagingReport};

pub const CRATE_NAME: &str = "tgmart-sync";

/// Full run against the warehouse configured by the environment.
pub async fn run_once_from_env() -> anyhow::Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::connect(config).await?;
    Ok(pipeline.run().await?)
}
