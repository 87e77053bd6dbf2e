//! Migration source loading.
//!
//! Migration bodies are opaque artifacts identified by name. The execution
//! order comes from an explicit order file, never from directory listing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::checksum::sha256_hex;
use crate::error::SourceError;

/// A loaded migration: stable name, source path, body, and content checksum.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Stable identifier, independent of file path.
    pub name: String,
    /// Source file the body was read from.
    pub file: PathBuf,
    /// The migration body, applied as one transactional unit.
    pub body: String,
    /// Hex SHA-256 of the body.
    pub checksum: String,
}

/// Loads migration bodies from a directory according to an order file.
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
}

impl MigrationSource {
    /// Create a source over the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load all migrations named in the order file, in declared order.
    ///
    /// The order file lists one migration name per line; blank lines and
    /// `#` comments are skipped. Each name maps to `<dir>/<name>.sql`.
    /// Missing or empty bodies and duplicate names are errors.
    pub fn load_ordered(&self, order_file: &Path) -> Result<Vec<Migration>, SourceError> {
        let listing =
            std::fs::read_to_string(order_file).map_err(|source| SourceError::OrderFile {
                path: order_file.to_path_buf(),
                source,
            })?;

        let names: Vec<&str> = listing
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        if names.is_empty() {
            return Err(SourceError::NoMigrations {
                path: order_file.to_path_buf(),
            });
        }

        let mut seen = HashSet::new();
        let mut migrations = Vec::with_capacity(names.len());
        for name in names {
            if !seen.insert(name) {
                return Err(SourceError::Duplicate {
                    name: name.to_string(),
                });
            }
            migrations.push(self.load_one(name)?);
        }
        Ok(migrations)
    }

    /// Load a single migration by name.
    pub fn load_one(&self, name: &str) -> Result<Migration, SourceError> {
        let file = self.dir.join(format!("{name}.sql"));
        let body = std::fs::read_to_string(&file).map_err(|source| SourceError::Missing {
            name: name.to_string(),
            path: file.clone(),
            source,
        })?;
        if body.trim().is_empty() {
            return Err(SourceError::Empty {
                name: name.to_string(),
                path: file,
            });
        }
        let checksum = sha256_hex(body.as_bytes());
        Ok(Migration {
            name: name.to_string(),
            file,
            body,
            checksum,
        })
    }
}
