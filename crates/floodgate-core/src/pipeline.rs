//! Pipeline orchestrator: the fixed five-stage migration state machine.
//!
//! INIT -> PRE_VALIDATE -> BACKUP -> EXECUTE -> POST_VALIDATE -> VERIFY ->
//! DONE, with any stage able to transition to HALTED on hard failure.
//! There is no rollback state: migrations are forward-only, so a halt
//! produces an advisory pointing at the verified backup artifacts instead
//! of an automatic reversal.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{BackupArtifact, BackupCoordinator};
use crate::client::{CloudProvisioner, ContainerRuntime, DatabaseClient};
use crate::clock::{current_timestamp, generate_run_id};
use crate::config::PipelineConfig;
use crate::error::{ClientError, ExecutorError, PipelineError};
use crate::executor::{ExecutionResult, MigrationExecutor};
use crate::registry::MigrationRegistry;
use crate::retry::{retry, RetryError};
use crate::source::MigrationSource;
use crate::validate::Validator;

/// Pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Init,
    PreValidate,
    Backup,
    Execute,
    PostValidate,
    Verify,
    Done,
    Halted,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Init => write!(f, "INIT"),
            Stage::PreValidate => write!(f, "PRE_VALIDATE"),
            Stage::Backup => write!(f, "BACKUP"),
            Stage::Execute => write!(f, "EXECUTE"),
            Stage::PostValidate => write!(f, "POST_VALIDATE"),
            Stage::Verify => write!(f, "VERIFY"),
            Stage::Done => write!(f, "DONE"),
            Stage::Halted => write!(f, "HALTED"),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
    Halted,
}

/// The report for one pipeline invocation. Never reused across runs; the
/// registry persists, the run does not.
#[derive(Debug, Serialize)]
pub struct PipelineRun {
    /// Unique run identifier (hex).
    pub id: String,
    /// Target environment name.
    pub environment: String,
    /// Current (or terminal) stage.
    pub stage: Stage,
    /// Overall status.
    pub status: RunStatus,
    /// Stage at which the run halted, if it did.
    pub failed_stage: Option<Stage>,
    /// Terminal error, if the run halted.
    pub error: Option<String>,
    /// Validation reports in stage order.
    pub reports: Vec<crate::validate::ValidationReport>,
    /// Backup artifacts produced by this run.
    pub artifacts: Vec<BackupArtifact>,
    /// Path of the backup manifest, once written.
    pub manifest: Option<PathBuf>,
    /// Per-migration execution outcomes.
    pub executions: Vec<ExecutionResult>,
    /// Soft check failures surfaced to the operator.
    pub soft_warnings: Vec<String>,
    /// Remediation advisory, present when halted.
    pub advisory: Option<String>,
    /// Start of the run (microseconds since epoch).
    pub started_at: u64,
    /// End of the run (microseconds since epoch).
    pub finished_at: Option<u64>,
}

impl PipelineRun {
    fn new(environment: &str) -> Self {
        Self {
            id: hex::encode(generate_run_id()),
            environment: environment.to_string(),
            stage: Stage::Init,
            status: RunStatus::Running,
            failed_stage: None,
            error: None,
            reports: Vec::new(),
            artifacts: Vec::new(),
            manifest: None,
            executions: Vec::new(),
            soft_warnings: Vec::new(),
            advisory: None,
            started_at: current_timestamp(),
            finished_at: None,
        }
    }

    fn record_report(&mut self, report: crate::validate::ValidationReport) {
        for soft in report.soft_failures() {
            self.soft_warnings
                .push(format!("{}: {}", soft.name, soft.detail));
        }
        self.reports.push(report);
    }

    fn finish(&mut self) {
        self.stage = Stage::Done;
        self.status = RunStatus::Done;
        self.finished_at = Some(current_timestamp());
    }

    fn halt(&mut self, err: PipelineError) {
        self.failed_stage = Some(self.stage);
        self.advisory = Some(self.build_advisory(&err));
        self.error = Some(err.to_string());
        self.stage = Stage::Halted;
        self.status = RunStatus::Halted;
        self.finished_at = Some(current_timestamp());
    }

    fn build_advisory(&self, err: &PipelineError) -> String {
        let mut advisory = format!(
            "Pipeline halted during {}: {}.\n\
             Migrations are forward-only; no automatic rollback is performed.\n",
            self.stage, err
        );
        let verified: Vec<&BackupArtifact> =
            self.artifacts.iter().filter(|a| a.verified).collect();
        if verified.is_empty() {
            advisory.push_str(
                "No verified backup artifacts exist for this run. Inspect the \
                 migration registry and use the most recent prior backup before \
                 remediating.\n",
            );
        } else {
            advisory.push_str("Verified backup artifacts for manual recovery:\n");
            for artifact in verified {
                advisory.push_str(&format!(
                    "  - {} ({}, {} bytes)\n",
                    artifact.path.display(),
                    artifact.kind,
                    artifact.size_bytes
                ));
            }
            if let Some(manifest) = &self.manifest {
                advisory.push_str(&format!("Manifest: {}\n", manifest.display()));
            }
        }
        advisory
    }

    /// Process exit code: 0 full success, 1 halted, 2 success with soft
    /// warnings.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Halted | RunStatus::Running => 1,
            RunStatus::Done if self.soft_warnings.is_empty() => 0,
            RunStatus::Done => 2,
        }
    }

    /// Serialize the run report as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Sequences validator, backup coordinator, and executor into the fixed
/// stage machine and decides continue/halt.
pub struct Pipeline {
    config: PipelineConfig,
    registry: MigrationRegistry,
    db: Arc<dyn DatabaseClient>,
    runtime: Arc<dyn ContainerRuntime>,
    cloud: Arc<dyn CloudProvisioner>,
}

impl Pipeline {
    /// Assemble a pipeline from an immutable configuration, an open
    /// registry, and the external collaborators.
    pub fn new(
        config: PipelineConfig,
        registry: MigrationRegistry,
        db: Arc<dyn DatabaseClient>,
        runtime: Arc<dyn ContainerRuntime>,
        cloud: Arc<dyn CloudProvisioner>,
    ) -> Self {
        Self {
            config,
            registry,
            db,
            runtime,
            cloud,
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The migration registry.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Execute one full pipeline run. Always returns a terminal
    /// `PipelineRun`; failures are captured on the report, not propagated.
    pub async fn run(&self, cancel: &CancellationToken) -> PipelineRun {
        let mut run = PipelineRun::new(&self.config.environment);
        info!(run = %run.id, environment = %self.config.environment, "pipeline run started");
        match self.drive(&mut run, cancel).await {
            Ok(()) => {
                run.finish();
                info!(
                    run = %run.id,
                    soft_warnings = run.soft_warnings.len(),
                    "pipeline run complete"
                );
            }
            Err(e) => {
                error!(run = %run.id, stage = %run.stage, error = %e, "pipeline run halted");
                run.halt(e);
            }
        }
        run
    }

    fn check_cancel(cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let validator = Validator::new(&self.config, &*self.db, &*self.runtime, &*self.cloud);

        Self::check_cancel(cancel)?;
        run.stage = Stage::PreValidate;
        info!(stage = %run.stage, "stage started");
        // Source problems are pre-validation findings, not setup failures.
        let migrations = MigrationSource::new(&self.config.migrations_dir)
            .load_ordered(&self.config.order_file)?;
        info!(count = migrations.len(), "migration set loaded");
        let report = validator.run_pre(&migrations, cancel).await?;
        let passed = report.passed();
        let failed = report.failed_names();
        run.record_report(report);
        if !passed {
            return Err(PipelineError::Validation {
                check_set: "pre".to_string(),
                failed,
            });
        }

        Self::check_cancel(cancel)?;
        run.stage = Stage::Backup;
        info!(stage = %run.stage, "stage started");
        let coordinator = BackupCoordinator::new(&self.config, &*self.db, &*self.runtime);
        let (artifacts, manifest) = coordinator.run(&run.id).await?;
        run.artifacts = artifacts;
        run.manifest = Some(manifest);

        Self::check_cancel(cancel)?;
        run.stage = Stage::Execute;
        info!(stage = %run.stage, "stage started");
        let executor = MigrationExecutor::new(&self.registry, &*self.db);
        let mut first_failure: Option<ExecutorError> = None;
        for migration in &migrations {
            // Cancellation is honored between migrations, never inside one.
            Self::check_cancel(cancel)?;
            match executor.execute(migration).await {
                Ok(result) => run.executions.push(result),
                Err(e) => {
                    if self.config.continue_on_error
                        && matches!(e, ExecutorError::Execution { .. })
                    {
                        warn!(name = %migration.name, error = %e, "continuing past failed migration");
                        if first_failure.is_none() {
                            first_failure = Some(e);
                        }
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }
        if let Some(e) = first_failure {
            // A partially failed set is never certified by post-validation.
            return Err(e.into());
        }

        Self::check_cancel(cancel)?;
        run.stage = Stage::PostValidate;
        info!(stage = %run.stage, "stage started");
        let report = validator.run_post().await;
        let passed = report.passed();
        let failed = report.failed_names();
        run.record_report(report);
        if !passed {
            return Err(PipelineError::Validation {
                check_set: "post".to_string(),
                failed,
            });
        }

        Self::check_cancel(cancel)?;
        run.stage = Stage::Verify;
        info!(stage = %run.stage, "stage started");
        let db = &*self.db;
        let timeout = self.config.connect_timeout;
        let outcome = retry(&self.config.retry, cancel, "final verification", || {
            async move {
                match tokio::time::timeout(timeout, db.ping()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::Connectivity(format!(
                            "no response within {timeout:?}"
                        )))
                    }
                }
                db.probe_read_write().await
            }
        })
        .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(RetryError::Cancelled) => Err(PipelineError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(PipelineError::Verification {
                attempts,
                detail: last.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn halted_run(artifacts: Vec<BackupArtifact>) -> PipelineRun {
        let mut run = PipelineRun::new("test");
        run.stage = Stage::Execute;
        run.artifacts = artifacts;
        run.halt(PipelineError::Verification {
            attempts: 1,
            detail: "boom".to_string(),
        });
        run
    }

    fn verified_artifact(path: &str) -> BackupArtifact {
        BackupArtifact {
            kind: crate::backup::ArtifactKind::FullDump,
            path: path.into(),
            size_bytes: 42,
            verified: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_exit_codes() {
        let mut run = PipelineRun::new("test");
        run.finish();
        assert_eq!(run.exit_code(), 0);

        run.soft_warnings.push("query_latency: slow".to_string());
        assert_eq!(run.exit_code(), 2);

        let halted = halted_run(Vec::new());
        assert_eq!(halted.exit_code(), 1);
    }

    #[test]
    fn test_halt_records_failed_stage() {
        let run = halted_run(Vec::new());
        assert_eq!(run.status, RunStatus::Halted);
        assert_eq!(run.stage, Stage::Halted);
        assert_eq!(run.failed_stage, Some(Stage::Execute));
        assert!(run.error.is_some());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_advisory_references_verified_backup() {
        let run = halted_run(vec![verified_artifact("/backups/run1/full.sql")]);
        let advisory = run.advisory.as_deref().unwrap();
        assert!(advisory.contains("EXECUTE"));
        assert!(advisory.contains("/backups/run1/full.sql"));
        assert!(advisory.contains("forward-only"));
    }

    #[test]
    fn test_advisory_without_backups_points_at_registry() {
        let run = halted_run(Vec::new());
        let advisory = run.advisory.as_deref().unwrap();
        assert!(advisory.contains("No verified backup artifacts"));
    }

    #[test]
    fn test_stage_display_matches_operator_vocabulary() {
        assert_eq!(Stage::PreValidate.to_string(), "PRE_VALIDATE");
        assert_eq!(Stage::PostValidate.to_string(), "POST_VALIDATE");
        assert_eq!(Stage::Halted.to_string(), "HALTED");
    }

    #[test]
    fn test_run_report_serializes() {
        let run = halted_run(vec![verified_artifact("/b/full.sql")]);
        let json = run.to_json().unwrap();
        assert!(json.contains("\"failed_stage\""));
        assert!(json.contains("full.sql"));
    }
}
