//! Pre- and post-condition validation.
//!
//! The validator produces an ordered `ValidationReport` for a named check
//! set. Hard failures halt the stage; soft failures are recorded and
//! surfaced but do not halt.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{CloudProvisioner, ContainerRuntime, DatabaseClient, HealthStatus};
use crate::config::PipelineConfig;
use crate::error::{ClientError, PipelineError};
use crate::retry::{retry, RetryError};
use crate::source::Migration;

/// How a failed check affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Failure halts the stage.
    Hard,
    /// Failure is recorded and surfaced but does not halt.
    Soft,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Hard => write!(f, "hard"),
            Severity::Soft => write!(f, "soft"),
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub severity: Severity,
    pub passed: bool,
    pub detail: String,
}

/// Ordered results for one check set (`pre` or `post`).
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub check_set: String,
    pub results: Vec<CheckResult>,
}

impl ValidationReport {
    /// Create an empty report for the named check set.
    pub fn new(check_set: impl Into<String>) -> Self {
        Self {
            check_set: check_set.into(),
            results: Vec::new(),
        }
    }

    fn record(
        &mut self,
        name: impl Into<String>,
        severity: Severity,
        passed: bool,
        detail: impl Into<String>,
    ) {
        let name = name.into();
        let detail = detail.into();
        if passed {
            debug!(check_set = %self.check_set, check = %name, %detail, "check passed");
        } else {
            warn!(
                check_set = %self.check_set,
                check = %name,
                %severity,
                %detail,
                "check failed"
            );
        }
        self.results.push(CheckResult {
            name,
            severity,
            passed,
            detail,
        });
    }

    /// True when no hard check failed.
    pub fn passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.passed || r.severity == Severity::Soft)
    }

    /// Failed hard checks.
    pub fn hard_failures(&self) -> Vec<&CheckResult> {
        self.results
            .iter()
            .filter(|r| !r.passed && r.severity == Severity::Hard)
            .collect()
    }

    /// Failed soft checks.
    pub fn soft_failures(&self) -> Vec<&CheckResult> {
        self.results
            .iter()
            .filter(|r| !r.passed && r.severity == Severity::Soft)
            .collect()
    }

    /// Names of failed hard checks, joined for error messages.
    pub fn failed_names(&self) -> String {
        self.hard_failures()
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Runs the pre and post check sets against the external collaborators.
pub struct Validator<'a> {
    config: &'a PipelineConfig,
    db: &'a dyn DatabaseClient,
    runtime: &'a dyn ContainerRuntime,
    cloud: &'a dyn CloudProvisioner,
}

impl<'a> Validator<'a> {
    /// Create a validator over the given collaborators.
    pub fn new(
        config: &'a PipelineConfig,
        db: &'a dyn DatabaseClient,
        runtime: &'a dyn ContainerRuntime,
        cloud: &'a dyn CloudProvisioner,
    ) -> Self {
        Self {
            config,
            db,
            runtime,
            cloud,
        }
    }

    /// Run the pre-condition check set.
    ///
    /// Connectivity is retried within the configured policy; resource
    /// shortfalls are never retried. Returns `Err` only on cancellation.
    pub async fn run_pre(
        &self,
        migrations: &[Migration],
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, PipelineError> {
        let mut report = ValidationReport::new("pre");

        // Connectivity failures against any collaborator are retried within
        // the policy; everything else surfaces on the first attempt.
        let cloud = self.cloud;
        let availability = retry(&self.config.retry, cancel, "provisioner target", || {
            async move {
                match cloud.target_available().await {
                    Err(e @ ClientError::Connectivity(_)) => Err(e),
                    other => Ok(other),
                }
            }
        })
        .await;
        match availability {
            Ok(Ok(true)) => {
                report.record("provisioner_target", Severity::Hard, true, "target available")
            }
            Ok(Ok(false)) => report.record(
                "provisioner_target",
                Severity::Hard,
                false,
                "provisioner reports target unavailable",
            ),
            Ok(Err(e)) => report.record("provisioner_target", Severity::Hard, false, e.to_string()),
            Err(RetryError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => report.record(
                "provisioner_target",
                Severity::Hard,
                false,
                format!("{last} ({attempts} attempts)"),
            ),
        }

        let db = self.db;
        let timeout = self.config.connect_timeout;
        let reachable = retry(&self.config.retry, cancel, "database ping", || async move {
            match tokio::time::timeout(timeout, db.ping()).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Connectivity(format!(
                    "no response within {timeout:?}"
                ))),
            }
        })
        .await;
        match reachable {
            Ok(()) => report.record("target_reachable", Severity::Hard, true, "ping ok"),
            Err(RetryError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => report.record(
                "target_reachable",
                Severity::Hard,
                false,
                format!("{last} ({attempts} attempts)"),
            ),
        }

        let runtime = self.runtime;
        let service = self.config.database_service.as_str();
        let health = retry(&self.config.retry, cancel, "service health", || {
            async move {
                let running = match runtime.is_running(service).await {
                    Ok(running) => running,
                    Err(e @ ClientError::Connectivity(_)) => return Err(e),
                    Err(e) => return Ok(Err(e)),
                };
                match runtime.health_status(service).await {
                    Ok(status) => Ok(Ok((running, status))),
                    Err(e @ ClientError::Connectivity(_)) => Err(e),
                    Err(e) => Ok(Err(e)),
                }
            }
        })
        .await;
        match health {
            Ok(Ok((running, status))) => report.record(
                "service_health",
                Severity::Hard,
                running && status == HealthStatus::Healthy,
                format!("{service}: running={running}, health={status}"),
            ),
            Ok(Err(e)) => report.record("service_health", Severity::Hard, false, e.to_string()),
            Err(RetryError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => report.record(
                "service_health",
                Severity::Hard,
                false,
                format!("{last} ({attempts} attempts)"),
            ),
        }

        if let Some(capability) = &self.config.required_capability {
            match self.db.has_capability(capability).await {
                Ok(true) => report.record(
                    "capability_present",
                    Severity::Hard,
                    true,
                    format!("{capability} present"),
                ),
                Ok(false) => report.record(
                    "capability_present",
                    Severity::Hard,
                    false,
                    format!("{capability} missing"),
                ),
                Err(e) => report.record("capability_present", Severity::Hard, false, e.to_string()),
            }
        }

        // The loader already rejected missing and empty bodies; assert the
        // invariant here so the report carries it.
        let sources_ok = !migrations.is_empty()
            && migrations
                .iter()
                .all(|m| !m.body.trim().is_empty() && !m.checksum.is_empty());
        report.record(
            "migration_sources",
            Severity::Hard,
            sources_ok,
            if sources_ok {
                format!("{} sources present and checksummed", migrations.len())
            } else {
                "migration set is empty or contains blank bodies".to_string()
            },
        );

        match self.db.resource_headroom().await {
            Ok(headroom) => {
                let disk = self.config.disk_threshold;
                report.record(
                    "disk_headroom",
                    disk.severity,
                    headroom.disk_bytes >= disk.min_bytes,
                    format!(
                        "{} bytes free, {} required",
                        headroom.disk_bytes, disk.min_bytes
                    ),
                );
                let memory = self.config.memory_threshold;
                report.record(
                    "memory_headroom",
                    memory.severity,
                    headroom.memory_bytes >= memory.min_bytes,
                    format!(
                        "{} bytes free, {} required",
                        headroom.memory_bytes, memory.min_bytes
                    ),
                );
            }
            Err(e) => {
                report.record(
                    "disk_headroom",
                    self.config.disk_threshold.severity,
                    false,
                    e.to_string(),
                );
                report.record(
                    "memory_headroom",
                    self.config.memory_threshold.severity,
                    false,
                    e.to_string(),
                );
            }
        }

        Ok(report)
    }

    /// Run the post-condition check set against the migrated schema.
    pub async fn run_post(&self) -> ValidationReport {
        let mut report = ValidationReport::new("post");

        for object in &self.config.expected_objects {
            match self.db.object_exists(object).await {
                Ok(exists) => report.record(
                    format!("object_exists:{object}"),
                    Severity::Hard,
                    exists,
                    if exists { "present" } else { "missing" },
                ),
                Err(e) => report.record(
                    format!("object_exists:{object}"),
                    Severity::Hard,
                    false,
                    e.to_string(),
                ),
            }
        }

        match self.db.orphaned_reference_count().await {
            Ok(orphans) => report.record(
                "referential_integrity",
                Severity::Hard,
                orphans == 0,
                format!("{orphans} orphaned references"),
            ),
            Err(e) => report.record("referential_integrity", Severity::Hard, false, e.to_string()),
        }

        match self.db.probe_latency().await {
            Ok(latency) => report.record(
                "query_latency",
                Severity::Soft,
                latency <= self.config.latency_soft_threshold,
                format!(
                    "{}ms observed, {}ms threshold",
                    latency.as_millis(),
                    self.config.latency_soft_threshold.as_millis()
                ),
            ),
            Err(e) => report.record("query_latency", Severity::Soft, false, e.to_string()),
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DumpKind, ResourceHeadroom};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubDatabase;

    #[async_trait]
    impl DatabaseClient for StubDatabase {
        async fn ping(&self) -> Result<(), ClientError> {
            Ok(())
        }
        async fn has_capability(&self, _name: &str) -> Result<bool, ClientError> {
            Ok(true)
        }
        async fn apply_transactional(&self, _sql: &str) -> Result<(), ClientError> {
            Ok(())
        }
        async fn object_exists(&self, _name: &str) -> Result<bool, ClientError> {
            Ok(true)
        }
        async fn orphaned_reference_count(&self) -> Result<u64, ClientError> {
            Ok(0)
        }
        async fn probe_latency(&self) -> Result<Duration, ClientError> {
            Ok(Duration::from_millis(1))
        }
        async fn probe_read_write(&self) -> Result<(), ClientError> {
            Ok(())
        }
        async fn resource_headroom(&self) -> Result<ResourceHeadroom, ClientError> {
            Ok(ResourceHeadroom {
                disk_bytes: u64::MAX,
                memory_bytes: u64::MAX,
            })
        }
        async fn create_dump(&self, _kind: DumpKind) -> Result<Vec<u8>, ClientError> {
            Ok(b"--\n-- dump complete\n".to_vec())
        }
    }

    struct SteadyRuntime;

    #[async_trait]
    impl ContainerRuntime for SteadyRuntime {
        async fn is_running(&self, _service: &str) -> Result<bool, ClientError> {
            Ok(true)
        }
        async fn health_status(&self, _service: &str) -> Result<HealthStatus, ClientError> {
            Ok(HealthStatus::Healthy)
        }
        async fn snapshot_volume(&self, _volume: &str) -> Result<Vec<u8>, ClientError> {
            Ok(Vec::new())
        }
    }

    struct SteadyCloud;

    #[async_trait]
    impl CloudProvisioner for SteadyCloud {
        async fn target_available(&self) -> Result<bool, ClientError> {
            Ok(true)
        }
    }

    /// Counts down a number of connectivity failures before succeeding.
    struct FailureBudget {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FailureBudget {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn refused(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    struct FlakyCloud(FailureBudget);

    #[async_trait]
    impl CloudProvisioner for FlakyCloud {
        async fn target_available(&self) -> Result<bool, ClientError> {
            if self.0.refused() {
                return Err(ClientError::Connectivity("connection refused".to_string()));
            }
            Ok(true)
        }
    }

    struct FlakyRuntime(FailureBudget);

    #[async_trait]
    impl ContainerRuntime for FlakyRuntime {
        async fn is_running(&self, _service: &str) -> Result<bool, ClientError> {
            if self.0.refused() {
                return Err(ClientError::Connectivity("connection refused".to_string()));
            }
            Ok(true)
        }
        async fn health_status(&self, _service: &str) -> Result<HealthStatus, ClientError> {
            Ok(HealthStatus::Healthy)
        }
        async fn snapshot_volume(&self, _volume: &str) -> Result<Vec<u8>, ClientError> {
            Ok(Vec::new())
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig::new("test", "./migrations", "./order.txt", "./backups")
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    fn migration() -> Migration {
        Migration {
            name: "001_init".to_string(),
            file: "001_init.sql".into(),
            body: "SELECT 1;".to_string(),
            checksum: "abcd".to_string(),
        }
    }

    #[tokio::test]
    async fn test_transient_provisioner_failure_is_retried() {
        let config = test_config();
        let db = StubDatabase;
        let runtime = SteadyRuntime;
        let cloud = FlakyCloud(FailureBudget::new(1));
        let validator = Validator::new(&config, &db, &runtime, &cloud);

        let report = validator
            .run_pre(&[migration()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.passed());
        // One refusal, one successful retry.
        assert_eq!(cloud.0.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_runtime_failure_is_retried() {
        let config = test_config();
        let db = StubDatabase;
        let runtime = FlakyRuntime(FailureBudget::new(1));
        let cloud = SteadyCloud;
        let validator = Validator::new(&config, &db, &runtime, &cloud);

        let report = validator
            .run_pre(&[migration()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.passed());
        assert_eq!(runtime.0.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_provisioner_connectivity_is_hard() {
        let config = test_config();
        let db = StubDatabase;
        let runtime = SteadyRuntime;
        let cloud = FlakyCloud(FailureBudget::new(u32::MAX));
        let validator = Validator::new(&config, &db, &runtime, &cloud);

        let report = validator
            .run_pre(&[migration()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.passed());
        let failed = report.hard_failures();
        let target = failed
            .iter()
            .find(|r| r.name == "provisioner_target")
            .unwrap();
        assert!(target.detail.contains("3 attempts"));
        assert_eq!(cloud.0.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_migration_set_fails_sources_check() {
        let config = test_config();
        let db = StubDatabase;
        let runtime = SteadyRuntime;
        let cloud = SteadyCloud;
        let validator = Validator::new(&config, &db, &runtime, &cloud);

        let report = validator
            .run_pre(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.passed());
        let sources = report
            .results
            .iter()
            .find(|r| r.name == "migration_sources")
            .unwrap();
        assert!(!sources.passed);
        assert!(sources.detail.contains("empty"));
        assert!(!sources.detail.contains("present and checksummed"));
    }

    fn result(name: &str, severity: Severity, passed: bool) -> CheckResult {
        CheckResult {
            name: name.to_string(),
            severity,
            passed,
            detail: String::new(),
        }
    }

    #[test]
    fn test_soft_failure_does_not_fail_report() {
        let report = ValidationReport {
            check_set: "post".to_string(),
            results: vec![
                result("a", Severity::Hard, true),
                result("b", Severity::Soft, false),
            ],
        };
        assert!(report.passed());
        assert_eq!(report.soft_failures().len(), 1);
        assert!(report.hard_failures().is_empty());
    }

    #[test]
    fn test_hard_failure_fails_report() {
        let report = ValidationReport {
            check_set: "pre".to_string(),
            results: vec![
                result("a", Severity::Hard, false),
                result("b", Severity::Hard, true),
            ],
        };
        assert!(!report.passed());
        assert_eq!(report.failed_names(), "a");
    }

    #[test]
    fn test_failed_names_joins_hard_failures() {
        let report = ValidationReport {
            check_set: "pre".to_string(),
            results: vec![
                result("a", Severity::Hard, false),
                result("b", Severity::Soft, false),
                result("c", Severity::Hard, false),
            ],
        };
        assert_eq!(report.failed_names(), "a, c");
    }

    #[test]
    fn test_empty_report_passes() {
        let report = ValidationReport::new("post");
        assert!(report.passed());
    }
}
