//! Pairing tokens prove device identity on every device-originated write.
//!
//! The plaintext is handed out exactly once at registration; only the SHA-256
//! digest is ever persisted.

use rand::rngs::OsRng;
use rand::RngCore;

const TOKEN_BYTES: usize = 16;

/// Hex-encoded SHA-256 of the plaintext token.
pub fn hash(plaintext: &str) -> String {
    hex::encode(hmac_sha256::Hash::hash(plaintext.as_bytes()))
}

/// Fresh random token, hex encoded.
pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compares a candidate plaintext against a stored digest without
/// short-circuiting on the first differing byte.
pub fn matches(plaintext: &str, stored_hash: &str) -> bool {
    let candidate = hash(plaintext);
    let (a, b) = (candidate.as_bytes(), stored_hash.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
