//! Authentication challenge solving
//!
//! `secret = base64(sha256(password + salt))`,
//! `response = base64(sha256(secret + challenge))`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use super::AuthenticationChallenge;

/// Compute the `authentication` string sent in Identify
pub fn solve_challenge(password: &str, salt: &str, challenge: &str) -> String {
    let secret = hash_base64(&[password.as_bytes(), salt.as_bytes()]);
    hash_base64(&[secret.as_bytes(), challenge.as_bytes()])
}

impl AuthenticationChallenge {
    pub fn solve(&self, password: &str) -> String {
        solve_challenge(password, &self.salt, &self.challenge)
    }
}

fn hash_base64(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    STANDARD.encode(hasher.finalize())
}
