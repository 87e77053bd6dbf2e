//! Migration registry: the durable ledger of applied migrations.
//!
//! The registry is the single source of truth for idempotency and drift
//! detection. `begin_apply` doubles as the mutual-exclusion primitive
//! across concurrent pipeline invocations: inserting a running row is a
//! compare-and-swap, so the first writer wins and the second caller fails
//! fast with `AlreadyRunning`.

use rkyv::{Archive, Deserialize, Serialize};

use crate::clock::current_timestamp;
use crate::error::RegistryError;

/// Status of a migration record.
///
/// Transitions only pending -> running -> {completed | failed}. A completed
/// record is immutable; it is never re-applied, only checksum-compared
/// against the current source for drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Known but not yet attempted.
    Pending,
    /// Currently being applied by some pipeline invocation.
    Running,
    /// Applied and committed.
    Completed,
    /// Attempted and failed; may be re-attempted after inspection.
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Running => write!(f, "running"),
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One row in the migration ledger.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Unique, stable identifier independent of file path.
    pub name: String,
    /// Source file the body was read from when applied.
    pub file: String,
    /// Hex SHA-256 of the body at apply time.
    pub checksum: String,
    /// Current status.
    pub status: MigrationStatus,
    /// When the apply began (microseconds since epoch).
    pub applied_at: u64,
    /// How long the apply took.
    pub duration_ms: u64,
    /// Error message if the apply failed.
    pub error_message: Option<String>,
}

impl MigrationRecord {
    fn running(name: &str, file: &str, checksum: &str) -> Self {
        Self {
            name: name.to_string(),
            file: file.to_string(),
            checksum: checksum.to_string(),
            status: MigrationStatus::Running,
            applied_at: current_timestamp(),
            duration_ms: 0,
            error_message: None,
        }
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RegistryError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| RegistryError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RegistryError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| RegistryError::Deserialization(e.to_string()))
    }
}

/// Token returned by `begin_apply`, consumed by the terminal transitions.
#[derive(Debug)]
pub struct ApplyToken {
    name: String,
}

impl ApplyToken {
    /// Name of the migration this token covers.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Sled-backed migration ledger.
pub struct MigrationRegistry {
    tree: sled::Tree,
}

impl MigrationRegistry {
    /// Tree name for the ledger.
    pub const TREE_NAME: &'static str = "registry:migrations";

    /// Open or create the ledger. Idempotent by construction; safe to call
    /// any number of times.
    pub fn open(db: &sled::Db) -> Result<Self, RegistryError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Look up a migration record by name.
    pub fn lookup(&self, name: &str) -> Result<Option<MigrationRecord>, RegistryError> {
        match self.tree.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(MigrationRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a running row for the migration.
    ///
    /// Fails with `AlreadyRunning` if a running row for this name exists,
    /// or if another invocation wins the compare-and-swap race.
    pub fn begin_apply(
        &self,
        name: &str,
        file: &str,
        checksum: &str,
    ) -> Result<ApplyToken, RegistryError> {
        let existing = self.tree.get(name.as_bytes())?;
        if let Some(ref bytes) = existing {
            let record = MigrationRecord::from_bytes(bytes)?;
            if record.status == MigrationStatus::Running {
                return Err(RegistryError::AlreadyRunning {
                    name: name.to_string(),
                });
            }
        }

        let row = MigrationRecord::running(name, file, checksum).to_bytes()?;
        let swapped = self
            .tree
            .compare_and_swap(name.as_bytes(), existing, Some(row))?;
        if swapped.is_err() {
            // Another invocation wrote the row between our read and swap.
            return Err(RegistryError::AlreadyRunning {
                name: name.to_string(),
            });
        }
        Ok(ApplyToken {
            name: name.to_string(),
        })
    }

    /// Transition the running row to completed.
    pub fn complete_apply(&self, token: &ApplyToken, duration_ms: u64) -> Result<(), RegistryError> {
        self.finish(token, duration_ms, MigrationStatus::Completed, None)
    }

    /// Transition the running row to failed, recording the error.
    pub fn fail_apply(
        &self,
        token: &ApplyToken,
        duration_ms: u64,
        error: &str,
    ) -> Result<(), RegistryError> {
        self.finish(
            token,
            duration_ms,
            MigrationStatus::Failed,
            Some(error.to_string()),
        )
    }

    fn finish(
        &self,
        token: &ApplyToken,
        duration_ms: u64,
        status: MigrationStatus,
        error_message: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut record = self
            .lookup(&token.name)?
            .ok_or_else(|| RegistryError::NotRunning {
                name: token.name.clone(),
            })?;
        if record.status != MigrationStatus::Running {
            return Err(RegistryError::NotRunning {
                name: token.name.clone(),
            });
        }
        record.status = status;
        record.duration_ms = duration_ms;
        record.error_message = error_message;
        self.tree.insert(token.name.as_bytes(), record.to_bytes()?)?;
        // A terminal transition must survive a crash.
        self.tree.flush()?;
        Ok(())
    }

    /// List all records, in key order.
    pub fn list(&self) -> Result<Vec<MigrationRecord>, RegistryError> {
        let mut records = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result?;
            records.push(MigrationRecord::from_bytes(&value)?);
        }
        Ok(records)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), RegistryError> {
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_registry() -> (MigrationRegistry, sled::Db) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let registry = MigrationRegistry::open(&db).unwrap();
        (registry, db)
    }

    #[test]
    fn test_open_is_idempotent() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let _first = MigrationRegistry::open(&db).unwrap();
        let _second = MigrationRegistry::open(&db).unwrap();
    }

    #[test]
    fn test_begin_complete_roundtrip() {
        let (registry, _db) = open_registry();
        let token = registry.begin_apply("001_init", "001_init.sql", "abcd").unwrap();
        assert_eq!(
            registry.lookup("001_init").unwrap().unwrap().status,
            MigrationStatus::Running
        );

        registry.complete_apply(&token, 120).unwrap();
        let record = registry.lookup("001_init").unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Completed);
        assert_eq!(record.duration_ms, 120);
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_begin_fail_records_error() {
        let (registry, _db) = open_registry();
        let token = registry.begin_apply("002_idx", "002_idx.sql", "ef01").unwrap();
        registry.fail_apply(&token, 35, "constraint violation").unwrap();

        let record = registry.lookup("002_idx").unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("constraint violation"));
    }

    #[test]
    fn test_running_row_blocks_second_begin() {
        let (registry, _db) = open_registry();
        let _token = registry.begin_apply("001", "001.sql", "aa").unwrap();
        let second = registry.begin_apply("001", "001.sql", "aa");
        assert!(matches!(second, Err(RegistryError::AlreadyRunning { .. })));
    }

    #[test]
    fn test_failed_row_can_be_reattempted() {
        let (registry, _db) = open_registry();
        let token = registry.begin_apply("001", "001.sql", "aa").unwrap();
        registry.fail_apply(&token, 10, "boom").unwrap();

        let token = registry.begin_apply("001", "001.sql", "aa").unwrap();
        registry.complete_apply(&token, 20).unwrap();
        assert_eq!(
            registry.lookup("001").unwrap().unwrap().status,
            MigrationStatus::Completed
        );
    }

    #[test]
    fn test_finish_without_running_row_is_an_error() {
        let (registry, _db) = open_registry();
        let token = registry.begin_apply("001", "001.sql", "aa").unwrap();
        registry.complete_apply(&token, 5).unwrap();
        // Second terminal transition must be rejected.
        let again = registry.complete_apply(&token, 5);
        assert!(matches!(again, Err(RegistryError::NotRunning { .. })));
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let (registry, _db) = open_registry();
        assert!(registry.lookup("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_returns_all_records() {
        let (registry, _db) = open_registry();
        for name in ["a", "b", "c"] {
            let token = registry.begin_apply(name, "f.sql", "cc").unwrap();
            registry.complete_apply(&token, 1).unwrap();
        }
        let records = registry.list().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.status == MigrationStatus::Completed));
    }

    #[test]
    fn test_record_serialization_roundtrip() {
        let record = MigrationRecord::running("001", "001.sql", "dead");
        let bytes = record.to_bytes().unwrap();
        let restored = MigrationRecord::from_bytes(&bytes).unwrap();
        assert_eq!(restored.name, record.name);
        assert_eq!(restored.checksum, record.checksum);
        assert_eq!(restored.status, record.status);
    }
}
