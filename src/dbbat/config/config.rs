use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::dbbat::auth::KEY_LEN;
use crate::dbbat::common::{Error, Result};
use crate::dbbat::config::SslMode;
use crate::dbbat::store::AccessControl;

pub const LISTEN_BACKLOG: u32 = 1024;

#[derive(Deserialize)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(skip_deserializing)]
    pub config_path: PathBuf,
    /// host to listen on, defaults to 0.0.0.0
    #[serde(default = "default_host")]
    pub host: String,
    /// port to listen on for PostgreSQL connections: default 6432
    #[serde(default = "default_port")]
    pub port: u16,
    /// encryption_key protects upstream credentials at rest: 64 hex chars (32 bytes)
    pub encryption_key: String,
    /// decoded form of encryption_key, filled in by load()
    #[serde(skip_deserializing)]
    pub key: [u8; KEY_LEN],
    /// max_connections to allow before rejecting new connections. Important to
    /// introduce back-pressure. Default 10,000.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// recv_buffer_size is the default size for (user-space) buffers used to read from TCP sockets
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: u32,
    /// how long a graceful shutdown waits for live sessions before force-closing them
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u32,
    /// SO_REUSEPORT on the listener (unix)
    #[serde(default)]
    pub reuseport: bool,
    #[serde(default)]
    pub query_storage: QueryStorageSettings,
    #[serde(default)]
    pub auth_cache: AuthCacheSettings,
    /// seed data for the built-in identity store
    #[serde(default)]
    pub identities: Identities,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
const fn default_port() -> u16 {
    6432
}
const fn default_max_connections() -> u32 {
    10000
}
const fn default_recv_buffer_size() -> u32 {
    32 * 1024
}
const fn default_shutdown_timeout_seconds() -> u32 {
    30
}

/// Result capture limits. Row and byte limits are enforced with
/// all-or-nothing semantics per query.
#[derive(Deserialize, Clone, Copy)]
pub struct QueryStorageSettings {
    #[serde(default = "default_store_results")]
    pub store_results: bool,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: u64,
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: u64,
}

const fn default_store_results() -> bool {
    true
}
const fn default_max_result_rows() -> u64 {
    100_000
}
const fn default_max_result_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for QueryStorageSettings {
    fn default() -> Self {
        Self {
            store_results: default_store_results(),
            max_result_rows: default_max_result_rows(),
            max_result_bytes: default_max_result_bytes(),
        }
    }
}

#[derive(Deserialize, Clone, Copy)]
pub struct AuthCacheSettings {
    #[serde(default = "default_auth_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_auth_cache_ttl_seconds")]
    pub ttl_seconds: u32,
    #[serde(default = "default_auth_cache_max_size")]
    pub max_size: u32,
}

const fn default_auth_cache_enabled() -> bool {
    true
}
const fn default_auth_cache_ttl_seconds() -> u32 {
    300
}
const fn default_auth_cache_max_size() -> u32 {
    10_000
}

impl Default for AuthCacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_auth_cache_enabled(),
            ttl_seconds: default_auth_cache_ttl_seconds(),
            max_size: default_auth_cache_max_size(),
        }
    }
}

/// Seed data for the in-memory identity store. The management surface that
/// would normally maintain users/databases/grants is not part of the proxy;
/// a deployment without it configures identities here.
#[derive(Deserialize, Default)]
pub struct Identities {
    #[serde(default)]
    pub users: Vec<UserSeed>,
    #[serde(default)]
    pub databases: Vec<DatabaseSeed>,
    #[serde(default)]
    pub grants: Vec<GrantSeed>,
}

#[derive(Deserialize)]
pub struct UserSeed {
    pub username: String,
    /// Argon2id PHC string
    pub password_hash: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Deserialize)]
pub struct DatabaseSeed {
    /// name clients ask for in the startup `database` parameter
    pub name: String,
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    /// actual database name on the upstream server; defaults to `name`
    #[serde(default)]
    pub database_name: String,
    pub username: String,
    /// upstream password; sealed with the encryption key at load
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}
const fn default_upstream_port() -> u16 {
    5432
}

#[derive(Deserialize)]
pub struct GrantSeed {
    pub user: String,
    pub database: String,
    #[serde(default)]
    pub controls: Vec<AccessControl>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_query_counts: Option<u64>,
    pub max_bytes_transferred: Option<u64>,
}

/// Load the configuration from dbbat.yaml, see find_config_file for the
/// search order. The settings are leaked; they live for the process lifetime.
pub fn load_config(config_name: &str) -> Result<&'static Settings> {
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy(), "found config file");
    let file = File::open(&config_path)?;
    let mut settings: Settings = serde_yaml::from_reader(file)?;
    settings.load(config_path)?;
    Ok(Box::leak(Box::new(settings)))
}

impl Settings {
    pub fn load(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        let key_bytes = hex::decode(self.encryption_key.trim())
            .map_err(|_| Error::new("encryption_key must be hex"))?;
        if key_bytes.len() != KEY_LEN {
            return Err(Error::new(format!(
                "encryption_key must be {} hex chars ({} bytes)",
                KEY_LEN * 2,
                KEY_LEN
            )));
        }
        self.key.copy_from_slice(&key_bytes);
        if self.recv_buffer_size < 4096 {
            self.recv_buffer_size = default_recv_buffer_size();
        }
        if self.recv_buffer_size > 1024 * 1024 {
            return Err(Error::new("recv_buffer_size cannot be > 1MB"));
        }
        self.recv_buffer_size = self.recv_buffer_size.next_power_of_two();
        for db in &mut self.identities.databases {
            if db.database_name.is_empty() {
                db.database_name = db.name.clone();
            }
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    // Use the full path given as the first command line argument
    if let Some(path) = env::args().nth(1) {
        debug!("using config_path passed on command line");
        return Ok(PathBuf::from(path));
    }

    // Check the current directory or any of its parents for config_name
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    // Check ~/.config/dbbat/{config_name}
    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());
    let conf_path = Path::new(&home).join(".config/dbbat").join(config_name);
    if conf_path.exists() {
        return Ok(conf_path);
    }

    // Check /etc/dbbat/{config_name}
    let conf_path = Path::new("/etc/dbbat").join(config_name);
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::new(format!("config file {} not found", config_name)))
}
