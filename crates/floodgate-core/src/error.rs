//! Error taxonomy for the migration pipeline.
//!
//! Errors are classified by how the orchestrator must react to them:
//! connectivity problems are retried within bounds, resource shortfalls and
//! integrity drift fail fast, and execution failures halt the run with the
//! transaction already rolled back by the target engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by external collaborators (database, container runtime,
/// cloud provisioner). Only `Connectivity` is considered transient.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The target could not be reached. Retryable within bounds.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// A statement inside a migration body failed. The transaction has been
    /// rolled back by the engine; never retried automatically.
    #[error("statement failed: {0}")]
    Statement(String),

    /// A probe or capability query failed for a non-connectivity reason.
    #[error("probe failed: {0}")]
    Probe(String),
}

/// Errors from the migration registry ledger.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A running row for this migration already exists. This is the
    /// mutual-exclusion primitive across concurrent pipeline invocations;
    /// the second caller fails fast instead of blocking.
    #[error("migration `{name}` is already running")]
    AlreadyRunning { name: String },

    /// A terminal transition was requested for a row that is not running.
    #[error("migration `{name}` has no running row to transition")]
    NotRunning { name: String },
}

/// Errors loading migration sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The order file could not be read.
    #[error("cannot read order file {}: {source}", path.display())]
    OrderFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration named in the order list has no readable source file.
    #[error("migration `{name}` missing at {}: {source}", path.display())]
    Missing {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration source file exists but is empty.
    #[error("migration `{name}` at {} is empty", path.display())]
    Empty { name: String, path: PathBuf },

    /// The order list names the same migration twice.
    #[error("duplicate migration name `{name}` in order list")]
    Duplicate { name: String },

    /// The order list is empty.
    #[error("order file {} declares no migrations", path.display())]
    NoMigrations { path: PathBuf },
}

/// Errors from the backup coordinator.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Filesystem error while producing or inspecting an artifact.
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The collaborator producing the artifact failed.
    #[error("{kind} backup failed: {source}")]
    Client {
        kind: String,
        #[source]
        source: ClientError,
    },

    /// An artifact failed structural verification. A pipeline run never
    /// proceeds past BACKUP with an unverified artifact.
    #[error("artifact {} failed verification: {reason}", path.display())]
    VerificationFailed { path: PathBuf, reason: String },

    /// Manifest serialization error.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Errors from executing a single migration.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A completed migration's source no longer matches its recorded
    /// checksum. Never auto-corrected; this is an operator escalation.
    #[error(
        "integrity drift for migration `{name}`: recorded checksum {recorded} \
         does not match current source {actual}"
    )]
    IntegrityDrift {
        name: String,
        recorded: String,
        actual: String,
    },

    /// A statement in the migration body failed; the transaction was rolled
    /// back and no partial DDL persists.
    #[error("migration `{name}` failed: {message}")]
    Execution { name: String, message: String },

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Terminal error for a pipeline run, recorded on the run report.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// One or more hard checks failed in a validation stage.
    #[error("{check_set} validation failed: {failed}")]
    Validation { check_set: String, failed: String },

    /// Backup stage failure.
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    /// Migration execution failure.
    #[error(transparent)]
    Execution(#[from] ExecutorError),

    /// Registry failure outside of execution.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Migration sources could not be loaded.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Final verification failed after bounded retries.
    #[error("verification failed after {attempts} attempts: {detail}")]
    Verification { attempts: u32, detail: String },

    /// The run was cancelled between stages or between migrations.
    #[error("run cancelled")]
    Cancelled,
}
