use std::time::Duration;

use test_log::test;
use uuid::Uuid;

use crate::dbbat::auth::{open_password, password, seal_password, AuthCache};

#[test(tokio::test)]
async fn test_password_hash_and_verify() {
    let hash = password::hash("s3cret".to_string()).await.unwrap();
    assert!(hash.starts_with("$argon2"));
    assert!(password::verify("s3cret".to_string(), hash.clone())
        .await
        .unwrap());
    assert!(!password::verify("wrong".to_string(), hash).await.unwrap());
}

#[test(tokio::test)]
async fn test_verify_rejects_garbage_hash() {
    assert!(password::verify("pw".to_string(), "not-a-phc-string".to_string())
        .await
        .is_err());
}

#[test(tokio::test)]
async fn test_auth_cache_caches_verifications() {
    let hash = password::hash("pw".to_string()).await.unwrap();
    let cache = AuthCache::new(true, Duration::from_secs(300), 16);

    assert!(cache.verify_password("alice", &hash, "pw").await.unwrap());
    assert_eq!(cache.len(), 1);
    // hit: result served from cache (indirectly observable through len)
    assert!(cache.verify_password("alice", &hash, "pw").await.unwrap());
    assert_eq!(cache.len(), 1);
    // different credential pair is a separate entry
    assert!(!cache.verify_password("alice", &hash, "nope").await.unwrap());
    assert_eq!(cache.len(), 2);
    // failures are cached too
    assert!(!cache.verify_password("alice", &hash, "nope").await.unwrap());
    assert_eq!(cache.len(), 2);

    cache.clear();
    assert_eq!(cache.len(), 0);
}

#[test(tokio::test)]
async fn test_auth_cache_ttl_expiry() {
    let hash = password::hash("pw".to_string()).await.unwrap();
    let cache = AuthCache::new(true, Duration::from_millis(10), 16);
    assert!(cache.verify_password("bob", &hash, "pw").await.unwrap());
    tokio::time::sleep(Duration::from_millis(30)).await;
    // expired: falls through to the verifier again and still succeeds
    assert!(cache.verify_password("bob", &hash, "pw").await.unwrap());
}

#[test(tokio::test)]
async fn test_auth_cache_eviction_bounds_size() {
    let hash = password::hash("pw".to_string()).await.unwrap();
    let cache = AuthCache::new(true, Duration::from_secs(300), 4);
    for i in 0..8 {
        let user = format!("user{}", i);
        cache.verify_password(&user, &hash, "pw").await.unwrap();
    }
    assert!(cache.len() <= 4);
}

#[test(tokio::test)]
async fn test_auth_cache_disabled_never_stores() {
    let hash = password::hash("pw".to_string()).await.unwrap();
    let cache = AuthCache::new(false, Duration::from_secs(300), 16);
    assert!(cache.verify_password("carol", &hash, "pw").await.unwrap());
    assert_eq!(cache.len(), 0);
}

#[test]
fn test_seal_open_round_trip() {
    let key = [3u8; 32];
    let uid = Uuid::now_v7();
    let sealed = seal_password(&key, uid, "hunter2").unwrap();
    assert_ne!(sealed, b"hunter2");
    assert_eq!(open_password(&key, uid, &sealed).unwrap(), "hunter2");
}

#[test]
fn test_open_rejects_transplanted_ciphertext() {
    // AAD binds the ciphertext to one database record
    let key = [3u8; 32];
    let uid = Uuid::now_v7();
    let other_uid = Uuid::now_v7();
    let sealed = seal_password(&key, uid, "hunter2").unwrap();
    assert!(open_password(&key, other_uid, &sealed).is_err());
}

#[test]
fn test_open_rejects_wrong_key_and_garbage() {
    let key = [3u8; 32];
    let other_key = [4u8; 32];
    let uid = Uuid::now_v7();
    let sealed = seal_password(&key, uid, "hunter2").unwrap();
    assert!(open_password(&other_key, uid, &sealed).is_err());
    assert!(open_password(&key, uid, b"short").is_err());
}
