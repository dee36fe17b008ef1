//! # Cryptographic Utilities
//!
//! Password hashing and random identifiers.
//!
//! Passwords are only ever stored as Argon2id hashes.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::errors::{EngineError, EngineResult};

/// Hash a password using Argon2id
pub fn hash_password(password: &str) -> EngineResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| EngineError::internal("password hashing failed"))
}

/// Verify a password against a stored hash
///
/// A malformed stored hash never matches.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Random alphanumeric string
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// New object id of the configured size
pub fn new_object_id(size: usize) -> String {
    random_string(size)
}

/// Random lowercase hex string of `bytes` bytes
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(buf.as_mut_slice());
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// New opaque session token
pub fn new_session_token() -> String {
    format!("r:{}", random_hex(16))
}
