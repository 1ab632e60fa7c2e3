use md5::{Digest, Md5};

/// Construct a String hex-encoded MD5 digest of the user, password, and salt
/// according to the PostgreSQL auth algorithm:
/// "md5" + hex(md5(hex(md5(password + user)) + salt))
pub fn hash_md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let pwd_hash = hasher.finalize_reset();
    hasher.update(hex::encode(pwd_hash).as_bytes());
    hasher.update(salt);
    let salted = hasher.finalize();

    let mut result = String::with_capacity(32 + 3);
    result.push_str("md5");
    result.push_str(&hex::encode(salted));
    result
}
