//! Content checksums for migration bodies.
//!
//! Checksums recorded in the registry are compared against the current
//! source on every lookup of a completed migration; a mismatch is drift.

use sha2::{Digest, Sha256};

/// Compute the hex-encoded SHA-256 digest of a migration body.
pub fn sha256_hex(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}
