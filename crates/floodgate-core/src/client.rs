//! Narrow interfaces over external collaborators.
//!
//! The pipeline never spawns processes or opens sockets itself; everything
//! it needs from the target database, the container runtime, and the cloud
//! provisioner goes through these traits so the orchestrator, validator,
//! and executor can be tested with in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;

/// Health of a managed service as reported by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Logical dump flavors a database client can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Full,
    SchemaOnly,
    DataOnly,
}

/// Free disk and memory available to the target, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct ResourceHeadroom {
    pub disk_bytes: u64,
    pub memory_bytes: u64,
}

/// Access to the target database.
///
/// `apply_transactional` is the executor's single transactional scope: the
/// implementation must run the whole body as one unit and roll back on any
/// statement failure, so no partial DDL ever persists.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Whether a named capability (e.g. a hypertable extension) is present.
    async fn has_capability(&self, name: &str) -> Result<bool, ClientError>;

    /// Apply a migration body as a single transaction. All-or-nothing.
    async fn apply_transactional(&self, sql: &str) -> Result<(), ClientError>;

    /// Whether a named schema object exists.
    async fn object_exists(&self, name: &str) -> Result<bool, ClientError>;

    /// Count of orphaned foreign-key references across the schema.
    async fn orphaned_reference_count(&self) -> Result<u64, ClientError>;

    /// Round-trip time of a trivial query.
    async fn probe_latency(&self) -> Result<Duration, ClientError>;

    /// Minimal write-then-read smoke probe; must clean up after itself.
    async fn probe_read_write(&self) -> Result<(), ClientError>;

    /// Disk and memory headroom available to the target.
    async fn resource_headroom(&self) -> Result<ResourceHeadroom, ClientError>;

    /// Produce a logical dump. Dumps are SQL text framed by a `--` comment
    /// header and a trailing `dump complete` marker; verification relies on
    /// both.
    async fn create_dump(&self, kind: DumpKind) -> Result<Vec<u8>, ClientError>;
}

/// Access to the container or process runtime hosting the database.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the named service is running.
    async fn is_running(&self, service: &str) -> Result<bool, ClientError>;

    /// Health of the named service.
    async fn health_status(&self, service: &str) -> Result<HealthStatus, ClientError>;

    /// Snapshot a storage volume as a gzip archive.
    async fn snapshot_volume(&self, volume: &str) -> Result<Vec<u8>, ClientError>;
}

/// Access to the cloud/infrastructure provisioner. Consumed only as a
/// precondition; provisioning itself happens elsewhere.
#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    /// Whether the provisioned target exists and is available.
    async fn target_available(&self) -> Result<bool, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Unknown.to_string(), "unknown");
    }
}
