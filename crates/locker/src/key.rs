//! Lock key derivation.

use sha2::{Digest, Sha256};

/// Derives the lock key for a repository and pull request.
///
/// The key is the first eight bytes (big endian) of SHA-256 over
/// `"{repo}#{pr}"`, so every process computes the same key for the same
/// environment.
#[must_use]
pub fn lock_key(repo: &str, pull_request: u32) -> i64 {
    let digest = Sha256::digest(format!("{repo}#{pull_request}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
