//! Migration executor: applies exactly one migration body.
//!
//! The executor owns the idempotence and drift contracts. An unchanged,
//! already-completed migration is a safe no-op; a changed one is an error,
//! never a silent re-run. Each invocation mutates exactly one registry row
//! and applies at most one migration body to the target.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::client::DatabaseClient;
use crate::error::ExecutorError;
use crate::registry::{MigrationRegistry, MigrationStatus};
use crate::source::Migration;

/// Outcome of one executor invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Migration name.
    pub name: String,
    /// Whether the body was applied in this invocation.
    pub applied: bool,
    /// Whether the migration was skipped as an already-completed no-op.
    pub skipped: bool,
    /// Wall time of the apply, zero when skipped.
    pub duration_ms: u64,
}

/// Applies single migrations against the target, consulting the registry.
pub struct MigrationExecutor<'a> {
    registry: &'a MigrationRegistry,
    db: &'a dyn DatabaseClient,
}

impl<'a> MigrationExecutor<'a> {
    /// Create an executor over the given registry and database client.
    pub fn new(registry: &'a MigrationRegistry, db: &'a dyn DatabaseClient) -> Self {
        Self { registry, db }
    }

    /// Apply one migration.
    ///
    /// Completed with matching checksum: skip. Completed with a different
    /// checksum: `IntegrityDrift`, before any execution attempt. Otherwise
    /// insert a running row (failing fast if one exists), apply the body as
    /// one transaction, and record the terminal outcome.
    pub async fn execute(&self, migration: &Migration) -> Result<ExecutionResult, ExecutorError> {
        if let Some(record) = self.registry.lookup(&migration.name)? {
            if record.status == MigrationStatus::Completed {
                if record.checksum == migration.checksum {
                    debug!(name = %migration.name, "already applied, skipping");
                    return Ok(ExecutionResult {
                        name: migration.name.clone(),
                        applied: false,
                        skipped: true,
                        duration_ms: 0,
                    });
                }
                return Err(ExecutorError::IntegrityDrift {
                    name: migration.name.clone(),
                    recorded: record.checksum,
                    actual: migration.checksum.clone(),
                });
            }
        }

        let token = self.registry.begin_apply(
            &migration.name,
            &migration.file.to_string_lossy(),
            &migration.checksum,
        )?;

        info!(name = %migration.name, "applying migration");
        let started = Instant::now();
        match self.db.apply_transactional(&migration.body).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.registry.complete_apply(&token, duration_ms)?;
                info!(name = %migration.name, duration_ms, "migration applied");
                Ok(ExecutionResult {
                    name: migration.name.clone(),
                    applied: true,
                    skipped: false,
                    duration_ms,
                })
            }
            Err(e) => {
                // The client contract guarantees the transaction rolled back.
                let duration_ms = started.elapsed().as_millis() as u64;
                let message = e.to_string();
                error!(name = %migration.name, error = %message, "migration failed");
                self.registry.fail_apply(&token, duration_ms, &message)?;
                Err(ExecutorError::Execution {
                    name: migration.name.clone(),
                    message,
                })
            }
        }
    }
}
