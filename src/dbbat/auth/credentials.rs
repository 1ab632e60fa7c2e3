use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use uuid::Uuid;

use crate::dbbat::common::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Encrypt an upstream password with AES-256-GCM. The database uid is bound
/// as additional authenticated data so a ciphertext cannot be transplanted
/// onto another database record. Layout: nonce || ciphertext+tag.
pub fn seal_password(key: &[u8; KEY_LEN], database_uid: Uuid, plaintext: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::crypto(format!("invalid encryption key: {}", e)))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_bytes(),
                aad: database_uid.as_bytes(),
            },
        )
        .map_err(|_| Error::crypto("password encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt an upstream password sealed by seal_password, verifying the
/// database uid AAD binding.
pub fn open_password(key: &[u8; KEY_LEN], database_uid: Uuid, sealed: &[u8]) -> Result<String> {
    if sealed.len() <= NONCE_LEN {
        return Err(Error::crypto("sealed password too short"));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::crypto(format!("invalid encryption key: {}", e)))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: database_uid.as_bytes(),
            },
        )
        .map_err(|_| Error::crypto("password decryption failed (wrong key or database uid)"))?;
    String::from_utf8(plaintext).map_err(|_| Error::crypto("decrypted password is not utf-8"))
}
