//! Timestamps and run identifiers.

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_micros() as u64
}

/// Generate a unique 16-byte run identifier.
pub fn generate_run_id() -> [u8; 16] {
    // Use timestamp + mixed bits
    let ts = current_timestamp();
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    let hash = ts.wrapping_mul(0x517cc1b727220a95);
    id[8..16].copy_from_slice(&hash.to_be_bytes());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_monotonic_enough() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
    }

    #[test]
    fn test_run_id_embeds_timestamp() {
        let before = current_timestamp();
        let id = generate_run_id();
        let after = current_timestamp();
        let ts = u64::from_be_bytes(id[0..8].try_into().unwrap());
        assert!(ts >= before && ts <= after);
    }
}
