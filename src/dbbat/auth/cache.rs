use std::sync::Mutex;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::dbbat::auth::password;
use crate::dbbat::common::Result;

#[derive(Copy, Clone)]
struct CacheEntry {
    valid: bool,
    verified_at: Instant,
}

/// A bounded, short-TTL cache over Argon2id password verification, shared by
/// the proxy and API auth paths. It only accelerates hash verification; the
/// caller still re-fetches the user and grant rows so revocation and expiry
/// are evaluated from fresh data.
pub struct AuthCache {
    enabled: bool,
    ttl: Duration,
    max_size: usize,
    entries: Mutex<FnvHashMap<[u8; 32], CacheEntry>>,
}

impl AuthCache {
    pub fn new(enabled: bool, ttl: Duration, max_size: usize) -> Self {
        AuthCache {
            enabled,
            ttl,
            max_size: max_size.max(1),
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Verify the credential pair against its Argon2 PHC hash, consulting the
    /// cache first.
    pub async fn verify_password(
        &self,
        username: &str,
        password_hash: &str,
        password: &str,
    ) -> Result<bool> {
        if !self.enabled {
            return password::verify(password.to_string(), password_hash.to_string()).await;
        }

        let key = credential_key(username, password);
        {
            let entries = self.entries.lock()?;
            if let Some(entry) = entries.get(&key) {
                if entry.verified_at.elapsed() < self.ttl {
                    debug!(username, "auth cache hit");
                    return Ok(entry.valid);
                }
            }
        }

        let valid = password::verify(password.to_string(), password_hash.to_string()).await?;

        let mut entries = self.entries.lock()?;
        if entries.len() >= self.max_size {
            evict(&mut entries, self.ttl, self.max_size);
        }
        entries.insert(
            key,
            CacheEntry {
                valid,
                verified_at: Instant::now(),
            },
        );
        Ok(valid)
    }

    /// Drop all cached verifications. Called on shutdown.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn credential_key(username: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Expired entries go first; if the table is still full, evict random ones.
fn evict(entries: &mut FnvHashMap<[u8; 32], CacheEntry>, ttl: Duration, max_size: usize) {
    entries.retain(|_, entry| entry.verified_at.elapsed() < ttl);
    let mut rng = rand::thread_rng();
    while entries.len() >= max_size {
        let n = rng.gen_range(0..entries.len());
        let key = *entries.keys().nth(n).unwrap();
        entries.remove(&key);
    }
}
