mod memory;
mod models;

use std::net::IpAddr;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dbbat::common::Result;

pub use self::memory::MemoryStore;
pub use self::models::{
    AccessControl, ConnectionRecord, Database, FailureReason, Grant, NewQuery, NewQueryRow,
    QueryParameters, QueryRecord, QueryRowRecord, User,
};

/// The persistence contract the proxy core consumes. Implementations are
/// expected to be transactional per call and safe for concurrent use; the
/// proxy never embeds SQL for the management schema.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    /// The returned record carries the encrypted upstream password.
    async fn get_database_by_name(&self, name: &str) -> Result<Option<Database>>;

    /// Only grants that are active right now (not revoked, inside their time
    /// window) may be returned.
    async fn get_active_grant(&self, user_id: Uuid, database_id: Uuid) -> Result<Option<Grant>>;

    async fn create_connection(
        &self,
        user_id: Uuid,
        database_id: Uuid,
        source_ip: IpAddr,
    ) -> Result<ConnectionRecord>;

    /// Sets disconnected_at; idempotent.
    async fn close_connection(&self, connection_uid: Uuid) -> Result<()>;

    /// Atomic insert of the query plus its captured rows (which may be empty),
    /// and bump of the owning connection's activity counters.
    async fn record_query(
        &self,
        connection_uid: Uuid,
        query: NewQuery,
        rows: Vec<NewQueryRow>,
    ) -> Result<Uuid>;

    /// Store-level atomic increment of a grant's usage counters; never
    /// read-modify-write from the session.
    async fn increment_grant_usage(
        &self,
        grant_uid: Uuid,
        add_queries: u64,
        add_bytes: u64,
    ) -> Result<()>;
}
