mod cache;
mod credentials;
pub mod password;

pub use self::cache::AuthCache;
pub use self::credentials::{open_password, seal_password, KEY_LEN, NONCE_LEN};
