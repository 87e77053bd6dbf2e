//! Floodgate core - forward-only schema migration pipeline.
//!
//! Applies an ordered set of irreversible schema migrations to a live
//! database with auditable state, integrity verification, and staged
//! gating: pre-validate, backup, execute, post-validate, verify.
//!
//! The migration registry is the single source of truth for idempotency
//! and drift detection. External systems (the target database, the
//! container runtime, the cloud provisioner) are reached only through the
//! narrow traits in [`client`], so every stage can be tested with fakes.

pub mod backup;
pub mod checksum;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod source;
pub mod validate;

pub use backup::{prune_backups, verify_artifact, ArtifactKind, BackupArtifact, BackupCoordinator};
pub use client::{
    CloudProvisioner, ContainerRuntime, DatabaseClient, DumpKind, HealthStatus, ResourceHeadroom,
};
pub use config::{PipelineConfig, ResourceThreshold};
pub use error::{
    BackupError, ClientError, ExecutorError, PipelineError, RegistryError, SourceError,
};
pub use executor::{ExecutionResult, MigrationExecutor};
pub use pipeline::{Pipeline, PipelineRun, RunStatus, Stage};
pub use registry::{ApplyToken, MigrationRecord, MigrationRegistry, MigrationStatus};
pub use retry::{retry, RetryError, RetryPolicy};
pub use source::{Migration, MigrationSource};
pub use validate::{CheckResult, Severity, ValidationReport, Validator};
