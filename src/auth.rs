//! MySQL authentication helpers.
//!
//! Implements:
//! - mysql_native_password (SHA1-based, legacy)
//! - caching_sha2_password (SHA256-based, MySQL 8+)

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::protocol::{CACHING_SHA2_PASSWORD, MYSQL_NATIVE_PASSWORD};
use crate::{MySqlError, MySqlResult};

/// Compute mysql_native_password authentication response (legacy).
///
/// Formula: SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
pub fn mysql_native_password(password: &[u8], scramble: &[u8]) -> [u8; 20] {
    let hash1 = Sha1::digest(password);
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    let mut result = [0u8; 20];
    for (out, (a, b)) in result.iter_mut().zip(hash1.iter().zip(hash3.iter())) {
        *out = a ^ b;
    }
    result
}

/// Compute caching_sha2_password authentication response (MySQL 8+).
///
/// Formula: SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
pub fn caching_sha2_password(password: &[u8], scramble: &[u8]) -> [u8; 32] {
    let hash1 = Sha256::digest(password);
    let hash2 = Sha256::digest(hash1);

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(scramble);
    let hash3 = hasher.finalize();

    let mut result = [0u8; 32];
    for (out, (a, b)) in result.iter_mut().zip(hash1.iter().zip(hash3.iter())) {
        *out = a ^ b;
    }
    result
}

/// Auth response for `plugin`. An empty password always yields an empty response.
pub fn scramble_for(plugin: &str, password: &str, scramble: &[u8]) -> MySqlResult<Vec<u8>> {
    if password.is_empty() {
        return Ok(Vec::new());
    }
    match plugin {
        MYSQL_NATIVE_PASSWORD => Ok(mysql_native_password(password.as_bytes(), scramble).to_vec()),
        CACHING_SHA2_PASSWORD => Ok(caching_sha2_password(password.as_bytes(), scramble).to_vec()),
        other => Err(MySqlError::Connect {
            message: format!("Authentication plugin '{}' is not supported", other),
        }),
    }
}
