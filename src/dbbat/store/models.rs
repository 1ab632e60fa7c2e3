use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::dbbat::auth;
use crate::dbbat::common::Result;
use crate::dbbat::config::SslMode;
use crate::dbbat::pg::sql::{CopyDirection, CopyFormat};

/// Identity a client authenticates as. Lookup-only from the proxy's side.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: Uuid,
    pub username: String,
    /// Argon2id PHC string, verified through the AuthCache
    pub password_hash: String,
    pub roles: Vec<String>,
}

/// Target server configuration, matched against the client's `database`
/// startup parameter.
#[derive(Debug, Clone)]
pub struct Database {
    pub uid: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// actual database name on the upstream server
    pub database_name: String,
    pub username: String,
    /// AES-256-GCM sealed upstream password, AAD bound to uid
    pub password_ciphertext: Vec<u8>,
    pub ssl_mode: SslMode,
}

impl Database {
    /// Decrypt the stored upstream password. Called once per session.
    pub fn decrypt_password(&self, key: &[u8; auth::KEY_LEN]) -> Result<String> {
        auth::open_password(key, self.uid, &self.password_ciphertext)
    }
}

/// Access restrictions a grant can carry. An empty set means full write access.
#[derive(
    Display, Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccessControl {
    ReadOnly,
    BlockCopy,
    BlockDdl,
}

/// Authorization for a User to use a Database inside a time window, with
/// optional usage caps.
#[derive(Debug, Clone)]
pub struct Grant {
    pub uid: Uuid,
    pub user_id: Uuid,
    pub database_id: Uuid,
    pub controls: Vec<AccessControl>,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub query_count: u64,
    pub bytes_transferred: u64,
    pub max_query_counts: Option<u64>,
    pub max_bytes_transferred: Option<u64>,
}

impl Grant {
    pub fn has_control(&self, control: AccessControl) -> bool {
        self.controls.contains(&control)
    }

    /// A grant is active iff now ∈ [starts_at, expires_at) and not revoked.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.starts_at <= now && now < self.expires_at
    }
}

/// One client session. Created on successful authentication, closed in
/// session cleanup.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub uid: Uuid, // UUIDv7, time-ordered
    pub user_id: Uuid,
    pub database_id: Uuid,
    pub source_ip: IpAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub queries: u64,
    pub bytes_transferred: u64,
}

/// Bound parameter values from an Extended Query Bind, persisted alongside
/// the query as JSONB.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryParameters {
    /// text parameters as strings, binary ones base64-encoded, nulls as null
    pub values: Vec<serde_json::Value>,
    pub format_codes: Vec<i16>,
    pub type_oids: Vec<i32>,
}

/// A query ready to persist; the store assigns its uid.
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub sql_text: String,
    pub parameters: Option<QueryParameters>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub rows_affected: Option<i64>,
    pub error: Option<String>,
    pub copy_format: Option<CopyFormat>,
    pub copy_direction: Option<CopyDirection>,
    /// true when result capture hit a limit and all captured rows were dropped
    pub truncated: bool,
    /// result/COPY bytes the query moved through the proxy, counted whether or
    /// not rows were captured; feeds connection and grant accounting
    pub data_bytes: u64,
}

/// One captured result row ready to persist.
#[derive(Debug, Clone)]
pub struct NewQueryRow {
    pub row_number: u64, // 0-based
    pub row_data: serde_json::Map<String, serde_json::Value>,
    pub row_size_bytes: u64,
}

/// A persisted query, as read back from the store.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub uid: Uuid, // UUIDv7
    pub connection_id: Uuid,
    pub query: NewQuery,
}

/// A persisted captured row.
#[derive(Debug, Clone)]
pub struct QueryRowRecord {
    pub uid: Uuid,
    pub query_id: Uuid,
    pub row: NewQueryRow,
}

/// The fixed failure taxonomy recorded on every failure path so operators can
/// filter by cause.
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    MissingStartupParameter,
    InvalidUsername,
    InvalidPassword,
    DatabaseNotFound,
    NoGrant,
    GrantExpired,
    GrantNotStarted,
    GrantRevoked,
    WrongAccessLevel,
    QueryQuotaExceeded,
    BytesQuotaExceeded,
    UpstreamConnFailed,
    UpstreamAuthFailed,
    SaslNotSupported,
    UpstreamReadOnlyMode,
    ProtocolViolation,
}
