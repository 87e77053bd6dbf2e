//! Shell-backed implementations of the collaborator traits.
//!
//! The core never spawns processes; the psql, pg_dump, docker, and cloud
//! CLI invocations all live here, behind the narrow interfaces, so the
//! pipeline itself stays testable with fakes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use floodgate_core::{
    ClientError, CloudProvisioner, ContainerRuntime, DatabaseClient, DumpKind, HealthStatus,
    ResourceHeadroom,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Run a command, optionally feeding stdin, capturing stdout. Returns the
/// stderr text on non-zero exit.
async fn run_capture(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<Vec<u8>, String> {
    debug!(program, ?args, "spawning");
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command
        .spawn()
        .map_err(|e| format!("cannot spawn {program}: {e}"))?;
    if let Some(input) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            handle
                .write_all(input.as_bytes())
                .await
                .map_err(|e| format!("cannot write to {program} stdin: {e}"))?;
        }
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{program} did not exit cleanly: {e}"))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(output.stdout)
}

/// Whether a failure message looks like a connectivity problem rather than
/// a statement or probe failure.
fn looks_transient(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("could not connect")
        || lowered.contains("connection refused")
        || lowered.contains("timeout")
        || lowered.contains("cannot spawn")
        || lowered.contains("no route to host")
}

fn classify(message: String) -> ClientError {
    if looks_transient(&message) {
        ClientError::Connectivity(message)
    } else {
        ClientError::Probe(message)
    }
}

/// Single-value count output from psql must parse cleanly; anything else
/// is a probe failure, never silently treated as zero.
fn parse_count(label: &str, text: &str) -> Result<u64, ClientError> {
    text.parse::<u64>()
        .map_err(|e| ClientError::Probe(format!("{label} query returned `{text}`: {e}")))
}

/// Identifiers interpolated into catalog queries must be plain names.
fn check_ident(name: &str) -> Result<(), ClientError> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        Ok(())
    } else {
        Err(ClientError::Probe(format!("unsafe identifier: {name}")))
    }
}

/// psql/pg_dump-backed database client.
pub struct ShellDatabaseClient {
    psql: String,
    pg_dump: String,
    url: String,
    data_dir: PathBuf,
    integrity_query: Option<String>,
}

impl ShellDatabaseClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            psql: "psql".to_string(),
            pg_dump: "pg_dump".to_string(),
            url: url.into(),
            data_dir: PathBuf::from("/"),
            integrity_query: None,
        }
    }

    pub fn with_psql_bin(mut self, bin: impl Into<String>) -> Self {
        self.psql = bin.into();
        self
    }

    pub fn with_pg_dump_bin(mut self, bin: impl Into<String>) -> Self {
        self.pg_dump = bin.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// A query returning a single count of orphaned references. Without
    /// one, the referential-integrity sweep reports zero orphans.
    pub fn with_integrity_query(mut self, query: impl Into<String>) -> Self {
        self.integrity_query = Some(query.into());
        self
    }

    async fn query_one(&self, sql: &str) -> Result<String, String> {
        let out = run_capture(
            &self.psql,
            &[self.url.as_str(), "-X", "-A", "-t", "-c", sql],
            None,
        )
        .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

#[async_trait]
impl DatabaseClient for ShellDatabaseClient {
    async fn ping(&self) -> Result<(), ClientError> {
        self.query_one("SELECT 1")
            .await
            .map(|_| ())
            .map_err(ClientError::Connectivity)
    }

    async fn has_capability(&self, name: &str) -> Result<bool, ClientError> {
        check_ident(name)?;
        let count = self
            .query_one(&format!(
                "SELECT count(*) FROM pg_extension WHERE extname = '{name}'"
            ))
            .await
            .map_err(classify)?;
        Ok(parse_count("capability", &count)? > 0)
    }

    async fn apply_transactional(&self, sql: &str) -> Result<(), ClientError> {
        let result = run_capture(
            &self.psql,
            &[
                self.url.as_str(),
                "-X",
                "-v",
                "ON_ERROR_STOP=1",
                "--single-transaction",
                "-f",
                "-",
            ],
            Some(sql),
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(message) if looks_transient(&message) => Err(ClientError::Connectivity(message)),
            Err(message) => Err(ClientError::Statement(message)),
        }
    }

    async fn object_exists(&self, name: &str) -> Result<bool, ClientError> {
        check_ident(name)?;
        let answer = self
            .query_one(&format!("SELECT to_regclass('{name}') IS NOT NULL"))
            .await
            .map_err(classify)?;
        Ok(answer == "t")
    }

    async fn orphaned_reference_count(&self) -> Result<u64, ClientError> {
        match &self.integrity_query {
            Some(query) => {
                let count = self.query_one(query).await.map_err(classify)?;
                parse_count("integrity", &count)
            }
            None => Ok(0),
        }
    }

    async fn probe_latency(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.query_one("SELECT 1").await.map_err(classify)?;
        Ok(started.elapsed())
    }

    async fn probe_read_write(&self) -> Result<(), ClientError> {
        // Temp table lives only for this session; nothing to clean up.
        let probe = "CREATE TEMP TABLE floodgate_probe (v INT); \
                     INSERT INTO floodgate_probe VALUES (1); \
                     SELECT v FROM floodgate_probe;";
        self.query_one(probe).await.map(|_| ()).map_err(classify)
    }

    async fn resource_headroom(&self) -> Result<ResourceHeadroom, ClientError> {
        let df_out = run_capture(
            "df",
            &["-Pk", &self.data_dir.to_string_lossy()],
            None,
        )
        .await
        .map_err(ClientError::Probe)?;
        let df_text = String::from_utf8_lossy(&df_out);
        let disk_kb = df_text
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(3))
            .and_then(|field| field.parse::<u64>().ok())
            .ok_or_else(|| ClientError::Probe(format!("unparseable df output: {df_text}")))?;

        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .map_err(|e| ClientError::Probe(format!("cannot read meminfo: {e}")))?;
        let memory_kb = meminfo
            .lines()
            .find(|line| line.starts_with("MemAvailable:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|field| field.parse::<u64>().ok())
            .ok_or_else(|| ClientError::Probe("MemAvailable not found in meminfo".to_string()))?;

        Ok(ResourceHeadroom {
            disk_bytes: disk_kb * 1024,
            memory_bytes: memory_kb * 1024,
        })
    }

    async fn create_dump(&self, kind: DumpKind) -> Result<Vec<u8>, ClientError> {
        let mut args = vec![self.url.as_str()];
        match kind {
            DumpKind::Full => {}
            DumpKind::SchemaOnly => args.push("--schema-only"),
            DumpKind::DataOnly => args.push("--data-only"),
        }
        run_capture(&self.pg_dump, &args, None).await.map_err(classify)
    }
}

/// docker-backed container runtime.
pub struct ShellContainerRuntime {
    docker: String,
}

impl ShellContainerRuntime {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ShellContainerRuntime {
    async fn is_running(&self, service: &str) -> Result<bool, ClientError> {
        let out = run_capture(
            &self.docker,
            &["inspect", "-f", "{{.State.Running}}", service],
            None,
        )
        .await
        .map_err(classify)?;
        Ok(String::from_utf8_lossy(&out).trim() == "true")
    }

    async fn health_status(&self, service: &str) -> Result<HealthStatus, ClientError> {
        let out = run_capture(
            &self.docker,
            &[
                "inspect",
                "-f",
                "{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
                service,
            ],
            None,
        )
        .await
        .map_err(classify)?;
        Ok(match String::from_utf8_lossy(&out).trim() {
            "healthy" => HealthStatus::Healthy,
            "starting" => HealthStatus::Starting,
            "unhealthy" => HealthStatus::Unhealthy,
            // Containers without a healthcheck report "none".
            "none" => HealthStatus::Healthy,
            _ => HealthStatus::Unknown,
        })
    }

    async fn snapshot_volume(&self, volume: &str) -> Result<Vec<u8>, ClientError> {
        run_capture(
            &self.docker,
            &[
                "run",
                "--rm",
                "-v",
                &format!("{volume}:/data:ro"),
                "alpine",
                "tar",
                "czf",
                "-",
                "-C",
                "/data",
                ".",
            ],
            None,
        )
        .await
        .map_err(classify)
    }
}

/// Cloud provisioner probe: any configured command whose exit status
/// answers "does the target exist".
pub struct ShellCloudProvisioner {
    argv: Vec<String>,
}

impl ShellCloudProvisioner {
    /// With an empty argv no provisioner is configured and the target is
    /// assumed available.
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl CloudProvisioner for ShellCloudProvisioner {
    async fn target_available(&self) -> Result<bool, ClientError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Ok(true);
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match run_capture(program, &args, None).await {
            Ok(_) => Ok(true),
            Err(message) if looks_transient(&message) => Err(ClientError::Connectivity(message)),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ident_rejects_injection() {
        assert!(check_ident("timescaledb").is_ok());
        assert!(check_ident("public.metrics").is_ok());
        assert!(check_ident("x'; DROP TABLE t; --").is_err());
        assert!(check_ident("").is_err());
    }

    #[test]
    fn test_malformed_count_is_a_probe_error() {
        assert_eq!(parse_count("capability", "2").unwrap(), 2);
        assert_eq!(parse_count("integrity", "0").unwrap(), 0);
        let err = parse_count("capability", "ERROR: relation missing").unwrap_err();
        assert!(matches!(err, ClientError::Probe(_)));
        assert!(err.to_string().contains("ERROR: relation missing"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(looks_transient("psql: could not connect to server"));
        assert!(looks_transient("Connection refused"));
        assert!(!looks_transient("syntax error at or near"));
    }

    #[tokio::test]
    async fn test_unconfigured_provisioner_is_available() {
        let provisioner = ShellCloudProvisioner::new(Vec::new());
        assert!(provisioner.target_available().await.unwrap());
    }
}
