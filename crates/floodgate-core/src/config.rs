//! Pipeline configuration.
//!
//! A `PipelineConfig` is constructed once at process start and passed by
//! parameter through the orchestrator to the validator, backup coordinator,
//! and executor. Nothing reads ambient environment state mid-run.

use std::path::PathBuf;
use std::time::Duration;

use crate::backup::ArtifactKind;
use crate::retry::RetryPolicy;
use crate::validate::Severity;

/// A declared resource floor, checked during pre-validation.
#[derive(Debug, Clone, Copy)]
pub struct ResourceThreshold {
    /// Minimum acceptable headroom in bytes.
    pub min_bytes: u64,
    /// Whether falling below the floor halts the run or only warns.
    pub severity: Severity,
}

impl ResourceThreshold {
    /// A hard floor; falling below it halts the run.
    pub fn hard(min_bytes: u64) -> Self {
        Self {
            min_bytes,
            severity: Severity::Hard,
        }
    }

    /// A soft floor; falling below it is recorded but does not halt.
    pub fn soft(min_bytes: u64) -> Self {
        Self {
            min_bytes,
            severity: Severity::Soft,
        }
    }
}

/// Immutable configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target environment name (informational; appears in reports).
    pub environment: String,

    /// Directory containing migration source files (`<name>.sql`).
    pub migrations_dir: PathBuf,

    /// Explicit ordered list of migration names, one per line. Order is a
    /// configuration input, never inferred from directory listing.
    pub order_file: PathBuf,

    /// Directory holding per-run backup subdirectories.
    pub backup_dir: PathBuf,

    /// Which artifact kinds to produce before EXECUTE.
    pub backup_kinds: Vec<ArtifactKind>,

    /// Volume name snapshotted for `ArtifactKind::VolumeSnapshot`.
    pub database_volume: String,

    /// Prune backup run directories older than this.
    pub backup_retention: Duration,

    /// Container service that must be running and healthy.
    pub database_service: String,

    /// Database capability that must be present (e.g. a hypertable
    /// extension). None skips the check.
    pub required_capability: Option<String>,

    /// Schema objects expected to exist after EXECUTE.
    pub expected_objects: Vec<String>,

    /// Minimum free disk.
    pub disk_threshold: ResourceThreshold,

    /// Minimum free memory.
    pub memory_threshold: ResourceThreshold,

    /// Soft ceiling for the post-validation latency probe.
    pub latency_soft_threshold: Duration,

    /// Per-attempt timeout for connectivity checks.
    pub connect_timeout: Duration,

    /// Bounded retry policy for transient connectivity failures.
    pub retry: RetryPolicy,

    /// Attempt remaining migrations after a failure instead of halting
    /// immediately. The run still halts before POST_VALIDATE if anything
    /// failed.
    pub continue_on_error: bool,
}

impl PipelineConfig {
    /// Create a configuration with defaults for the given environment and
    /// migration layout.
    pub fn new(
        environment: impl Into<String>,
        migrations_dir: impl Into<PathBuf>,
        order_file: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            environment: environment.into(),
            migrations_dir: migrations_dir.into(),
            order_file: order_file.into(),
            backup_dir: backup_dir.into(),
            backup_kinds: vec![ArtifactKind::FullDump],
            database_volume: "db-data".to_string(),
            backup_retention: Duration::from_secs(14 * 24 * 3600),
            database_service: "database".to_string(),
            required_capability: None,
            expected_objects: Vec::new(),
            disk_threshold: ResourceThreshold::hard(1024 * 1024 * 1024),
            memory_threshold: ResourceThreshold::soft(512 * 1024 * 1024),
            latency_soft_threshold: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            continue_on_error: false,
        }
    }

    /// Set the artifact kinds produced during BACKUP.
    pub fn with_backup_kinds(mut self, kinds: Vec<ArtifactKind>) -> Self {
        self.backup_kinds = kinds;
        self
    }

    /// Set the required database capability.
    pub fn with_required_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    /// Set the schema objects expected after EXECUTE.
    pub fn with_expected_objects(mut self, objects: Vec<String>) -> Self {
        self.expected_objects = objects;
        self
    }

    /// Set the container service name.
    pub fn with_database_service(mut self, service: impl Into<String>) -> Self {
        self.database_service = service.into();
        self
    }

    /// Set the snapshotted volume name.
    pub fn with_database_volume(mut self, volume: impl Into<String>) -> Self {
        self.database_volume = volume.into();
        self
    }

    /// Set the disk headroom floor.
    pub fn with_disk_threshold(mut self, threshold: ResourceThreshold) -> Self {
        self.disk_threshold = threshold;
        self
    }

    /// Set the memory headroom floor.
    pub fn with_memory_threshold(mut self, threshold: ResourceThreshold) -> Self {
        self.memory_threshold = threshold;
        self
    }

    /// Set the soft latency ceiling.
    pub fn with_latency_soft_threshold(mut self, threshold: Duration) -> Self {
        self.latency_soft_threshold = threshold;
        self
    }

    /// Set the backup retention age.
    pub fn with_backup_retention(mut self, retention: Duration) -> Self {
        self.backup_retention = retention;
        self
    }

    /// Set the connectivity retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt connectivity timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Continue attempting remaining migrations after a failure.
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fail_fast() {
        let config = PipelineConfig::new("staging", "./migrations", "./order.txt", "./backups");
        assert!(!config.continue_on_error);
        assert_eq!(config.backup_kinds, vec![ArtifactKind::FullDump]);
        assert_eq!(config.disk_threshold.severity, Severity::Hard);
    }

    #[test]
    fn test_builder_chain() {
        let config = PipelineConfig::new("prod", "./m", "./o", "./b")
            .with_required_capability("timescaledb")
            .with_expected_objects(vec!["metrics".to_string()])
            .with_continue_on_error(true);
        assert_eq!(config.required_capability.as_deref(), Some("timescaledb"));
        assert_eq!(config.expected_objects.len(), 1);
        assert!(config.continue_on_error);
    }
}
