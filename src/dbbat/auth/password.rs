use argon2::password_hash::{Salt, SaltString};
use argon2::{password_hash, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use tokio::task;

use crate::dbbat::common::{Error, Result};

/// Hash a password into an Argon2id PHC string. Used by tooling and tests;
/// the proxy itself only verifies.
pub async fn hash(password: String) -> Result<String> {
    task::spawn_blocking(move || {
        let salt: [u8; Salt::RECOMMENDED_LENGTH] = rand::random();
        let salt = SaltString::encode_b64(&salt)
            .map_err(|e| Error::crypto(format!("failed to encode salt: {}", e)))?;

        Ok(Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::crypto(format!("failed to hash password: {}", e)))?
            .to_string())
    })
    .await
    .map_err(|e| Error::new(format!("panic in password::hash: {}", e)))?
}

/// Verify a password against an Argon2 PHC string. Argon2id is memory-hard,
/// so this runs on the blocking pool.
pub async fn verify(password: String, hash: String) -> Result<bool> {
    task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| Error::crypto(format!("stored password hash is invalid: {}", e)))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::crypto(format!("failed to verify password: {}", e))),
        }
    })
    .await
    .map_err(|e| Error::new(format!("panic in password::verify: {}", e)))?
}
