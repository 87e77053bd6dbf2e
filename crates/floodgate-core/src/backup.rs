//! Backup coordination: restorable artifacts before irreversible mutation.
//!
//! Every configured artifact kind is produced and structurally verified
//! before EXECUTE runs. A run never references an unverified artifact; a
//! verification failure is a hard stage failure.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::{ContainerRuntime, DatabaseClient, DumpKind};
use crate::config::PipelineConfig;
use crate::error::BackupError;

/// Marker expected near the end of every logical dump.
const DUMP_FOOTER_MARKER: &[u8] = b"dump complete";

/// How much of the dump tail to scan for the footer marker.
const FOOTER_WINDOW: usize = 512;

/// The kinds of backup artifacts the coordinator can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    FullDump,
    SchemaOnly,
    DataOnly,
    VolumeSnapshot,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::FullDump => write!(f, "full-dump"),
            ArtifactKind::SchemaOnly => write!(f, "schema-only"),
            ArtifactKind::DataOnly => write!(f, "data-only"),
            ArtifactKind::VolumeSnapshot => write!(f, "volume-snapshot"),
        }
    }
}

impl ArtifactKind {
    fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::FullDump => "full.sql",
            ArtifactKind::SchemaOnly => "schema.sql",
            ArtifactKind::DataOnly => "data.sql",
            ArtifactKind::VolumeSnapshot => "volume.tar.gz",
        }
    }

    fn dump_kind(&self) -> Option<DumpKind> {
        match self {
            ArtifactKind::FullDump => Some(DumpKind::Full),
            ArtifactKind::SchemaOnly => Some(DumpKind::SchemaOnly),
            ArtifactKind::DataOnly => Some(DumpKind::DataOnly),
            ArtifactKind::VolumeSnapshot => None,
        }
    }
}

/// A produced backup artifact.
#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    run: &'a str,
    environment: &'a str,
    created_at: DateTime<Utc>,
    retention_secs: u64,
    artifacts: &'a [BackupArtifact],
}

/// Structural verification of an artifact on disk.
///
/// Dumps must be non-empty, start with a SQL comment header, and carry the
/// completion marker near the end. Snapshots must be readable gzip
/// archives with non-empty content.
pub fn verify_artifact(artifact: &BackupArtifact) -> Result<bool, BackupError> {
    let bytes = std::fs::read(&artifact.path).map_err(|source| BackupError::Io {
        path: artifact.path.clone(),
        source,
    })?;
    if bytes.is_empty() {
        warn!(path = %artifact.path.display(), "artifact is empty");
        return Ok(false);
    }
    match artifact.kind {
        ArtifactKind::VolumeSnapshot => {
            let mut decoder = GzDecoder::new(&bytes[..]);
            let mut content = Vec::new();
            match decoder.read_to_end(&mut content) {
                Ok(_) if !content.is_empty() => Ok(true),
                Ok(_) => {
                    warn!(path = %artifact.path.display(), "snapshot archive is empty");
                    Ok(false)
                }
                Err(e) => {
                    warn!(path = %artifact.path.display(), error = %e, "snapshot archive unreadable");
                    Ok(false)
                }
            }
        }
        _ => {
            let has_header = bytes.starts_with(b"--");
            let tail_start = bytes.len().saturating_sub(FOOTER_WINDOW);
            let has_footer = bytes[tail_start..]
                .windows(DUMP_FOOTER_MARKER.len())
                .any(|w| w == DUMP_FOOTER_MARKER);
            if !has_header || !has_footer {
                warn!(
                    path = %artifact.path.display(),
                    has_header,
                    has_footer,
                    "dump is missing header or completion marker"
                );
            }
            Ok(has_header && has_footer)
        }
    }
}

/// Prune backup run directories older than `max_age`. Runs on a schedule
/// independent of pipeline runs.
pub fn prune_backups(dir: &Path, max_age: Duration) -> Result<Vec<PathBuf>, BackupError> {
    let mut pruned = Vec::new();
    if !dir.exists() {
        return Ok(pruned);
    }
    let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(UNIX_EPOCH);
    let entries = std::fs::read_dir(dir).map_err(|source| BackupError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| BackupError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|source| BackupError::Io {
                path: path.clone(),
                source,
            })?;
        if modified < cutoff {
            std::fs::remove_dir_all(&path).map_err(|source| BackupError::Io {
                path: path.clone(),
                source,
            })?;
            info!(path = %path.display(), "pruned expired backup");
            pruned.push(path);
        }
    }
    Ok(pruned)
}

/// Produces and verifies backup artifacts for a pipeline run.
pub struct BackupCoordinator<'a> {
    config: &'a PipelineConfig,
    db: &'a dyn DatabaseClient,
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> BackupCoordinator<'a> {
    /// Create a coordinator over the given collaborators.
    pub fn new(
        config: &'a PipelineConfig,
        db: &'a dyn DatabaseClient,
        runtime: &'a dyn ContainerRuntime,
    ) -> Self {
        Self {
            config,
            db,
            runtime,
        }
    }

    /// Produce all configured artifacts under a per-run directory, verify
    /// each, and write the manifest. Any unverified artifact is an error.
    pub async fn run(&self, run_id: &str) -> Result<(Vec<BackupArtifact>, PathBuf), BackupError> {
        let dir = self.config.backup_dir.join(run_id);
        std::fs::create_dir_all(&dir).map_err(|source| BackupError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut artifacts = Vec::with_capacity(self.config.backup_kinds.len());
        for kind in &self.config.backup_kinds {
            let mut artifact = self.create_artifact(*kind, &dir).await?;
            artifact.verified = verify_artifact(&artifact)?;
            if !artifact.verified {
                return Err(BackupError::VerificationFailed {
                    path: artifact.path,
                    reason: "structural verification failed".to_string(),
                });
            }
            info!(kind = %kind, path = %artifact.path.display(), "artifact verified");
            artifacts.push(artifact);
        }

        let manifest = self.write_manifest(&dir, run_id, &artifacts)?;
        Ok((artifacts, manifest))
    }

    /// Produce a single artifact of the given kind, unverified.
    pub async fn create_artifact(
        &self,
        kind: ArtifactKind,
        dir: &Path,
    ) -> Result<BackupArtifact, BackupError> {
        let bytes = match kind.dump_kind() {
            Some(dump_kind) => {
                self.db
                    .create_dump(dump_kind)
                    .await
                    .map_err(|source| BackupError::Client {
                        kind: kind.to_string(),
                        source,
                    })?
            }
            None => self
                .runtime
                .snapshot_volume(&self.config.database_volume)
                .await
                .map_err(|source| BackupError::Client {
                    kind: kind.to_string(),
                    source,
                })?,
        };

        let path = dir.join(kind.file_name());
        std::fs::write(&path, &bytes).map_err(|source| BackupError::Io {
            path: path.clone(),
            source,
        })?;
        info!(kind = %kind, size_bytes = bytes.len(), "artifact written");

        Ok(BackupArtifact {
            kind,
            path,
            size_bytes: bytes.len() as u64,
            verified: false,
            created_at: Utc::now(),
        })
    }

    fn write_manifest(
        &self,
        dir: &Path,
        run_id: &str,
        artifacts: &[BackupArtifact],
    ) -> Result<PathBuf, BackupError> {
        let manifest = Manifest {
            run: run_id,
            environment: &self.config.environment,
            created_at: Utc::now(),
            retention_secs: self.config.backup_retention.as_secs(),
            artifacts,
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        let path = dir.join("manifest.json");
        std::fs::write(&path, json).map_err(|source| BackupError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn artifact_at(kind: ArtifactKind, path: PathBuf) -> BackupArtifact {
        BackupArtifact {
            kind,
            path,
            size_bytes: 0,
            verified: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_verify_accepts_framed_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.sql");
        std::fs::write(&path, "--\n-- dump\nCREATE TABLE t ();\n-- dump complete\n").unwrap();
        assert!(verify_artifact(&artifact_at(ArtifactKind::FullDump, path)).unwrap());
    }

    #[test]
    fn test_verify_rejects_truncated_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.sql");
        // No completion marker: the dump was cut off mid-write.
        std::fs::write(&path, "--\n-- dump\nCREATE TABLE t ();\n").unwrap();
        assert!(!verify_artifact(&artifact_at(ArtifactKind::FullDump, path)).unwrap());
    }

    #[test]
    fn test_verify_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.sql");
        std::fs::write(&path, "").unwrap();
        assert!(!verify_artifact(&artifact_at(ArtifactKind::SchemaOnly, path)).unwrap());
    }

    #[test]
    fn test_verify_accepts_gzip_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.tar.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"volume contents").unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();
        assert!(verify_artifact(&artifact_at(ArtifactKind::VolumeSnapshot, path)).unwrap());
    }

    #[test]
    fn test_verify_rejects_non_gzip_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.tar.gz");
        std::fs::write(&path, b"not an archive").unwrap();
        assert!(!verify_artifact(&artifact_at(ArtifactKind::VolumeSnapshot, path)).unwrap());
    }

    #[test]
    fn test_prune_removes_only_expired_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let old_run = dir.path().join("run_old");
        std::fs::create_dir(&old_run).unwrap();
        std::fs::write(old_run.join("manifest.json"), "{}").unwrap();

        // max_age of zero makes everything already on disk expired.
        let pruned = prune_backups(dir.path(), Duration::from_secs(0)).unwrap();
        assert_eq!(pruned.len(), 1);
        assert!(!old_run.exists());

        // A generous age keeps fresh runs.
        let fresh_run = dir.path().join("run_fresh");
        std::fs::create_dir(&fresh_run).unwrap();
        let pruned = prune_backups(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(pruned.is_empty());
        assert!(fresh_run.exists());
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");
        let pruned = prune_backups(&missing, Duration::from_secs(60)).unwrap();
        assert!(pruned.is_empty());
    }
}
