//! SHA-256 fingerprints of source files, used to recognise a re-attached file.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fingerprints recorded by other clients may be uppercase.
pub fn same_fingerprint(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}
