use std::net::IpAddr;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use uuid::Uuid;

use crate::dbbat::auth;
use crate::dbbat::common::{Error, Result};
use crate::dbbat::config::Identities;
use crate::dbbat::store::{
    ConnectionRecord, Database, Grant, NewQuery, NewQueryRow, QueryRecord, QueryRowRecord, Store,
    User,
};

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    databases: Vec<Database>,
    grants: Vec<Grant>,
    connections: FnvHashMap<Uuid, ConnectionRecord>,
    queries: Vec<QueryRecord>,
    query_rows: Vec<QueryRowRecord>,
}

/// The built-in Store: concurrent, in-memory, seeded from the `identities`
/// section of the config. Deployments with a management plane point the proxy
/// at a database-backed implementation of the same trait instead.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from config seed data, sealing upstream passwords with
    /// the process encryption key as they are loaded.
    pub fn from_identities(identities: &Identities, key: &[u8; auth::KEY_LEN]) -> Result<Self> {
        let store = Self::new();
        {
            let mut inner = store.inner.write()?;
            for user in &identities.users {
                inner.users.push(User {
                    uid: Uuid::now_v7(),
                    username: user.username.clone(),
                    password_hash: user.password_hash.clone(),
                    roles: user.roles.clone(),
                });
            }
            for db in &identities.databases {
                let uid = Uuid::now_v7();
                inner.databases.push(Database {
                    uid,
                    name: db.name.clone(),
                    host: db.host.clone(),
                    port: db.port,
                    database_name: db.database_name.clone(),
                    username: db.username.clone(),
                    password_ciphertext: auth::seal_password(key, uid, &db.password)?,
                    ssl_mode: db.ssl_mode,
                });
            }
            for grant in &identities.grants {
                let user_id = inner
                    .users
                    .iter()
                    .find(|u| u.username == grant.user)
                    .map(|u| u.uid)
                    .ok_or_else(|| {
                        Error::new(format!("grant references unknown user {}", grant.user))
                    })?;
                let database_id = inner
                    .databases
                    .iter()
                    .find(|d| d.name == grant.database)
                    .map(|d| d.uid)
                    .ok_or_else(|| {
                        Error::new(format!(
                            "grant references unknown database {}",
                            grant.database
                        ))
                    })?;
                inner.grants.push(Grant {
                    uid: Uuid::now_v7(),
                    user_id,
                    database_id,
                    controls: grant.controls.clone(),
                    starts_at: grant.starts_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    expires_at: grant.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC),
                    revoked_at: None,
                    query_count: 0,
                    bytes_transferred: 0,
                    max_query_counts: grant.max_query_counts,
                    max_bytes_transferred: grant.max_bytes_transferred,
                });
            }
        }
        Ok(store)
    }

    pub fn add_user(&self, user: User) {
        self.inner.write().unwrap().users.push(user);
    }

    pub fn add_database(&self, database: Database) {
        self.inner.write().unwrap().databases.push(database);
    }

    pub fn add_grant(&self, grant: Grant) {
        self.inner.write().unwrap().grants.push(grant);
    }

    pub fn get_grant(&self, uid: Uuid) -> Option<Grant> {
        self.inner
            .read()
            .unwrap()
            .grants
            .iter()
            .find(|g| g.uid == uid)
            .cloned()
    }

    pub fn get_connection(&self, uid: Uuid) -> Option<ConnectionRecord> {
        self.inner.read().unwrap().connections.get(&uid).cloned()
    }

    pub fn queries(&self) -> Vec<QueryRecord> {
        self.inner.read().unwrap().queries.clone()
    }

    pub fn rows_for(&self, query_id: Uuid) -> Vec<QueryRowRecord> {
        self.inner
            .read()
            .unwrap()
            .query_rows
            .iter()
            .filter(|r| r.query_id == query_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let inner = self.inner.read()?;
        Ok(inner.users.iter().find(|u| u.username == username).cloned())
    }

    async fn get_database_by_name(&self, name: &str) -> Result<Option<Database>> {
        let inner = self.inner.read()?;
        Ok(inner.databases.iter().find(|d| d.name == name).cloned())
    }

    async fn get_active_grant(&self, user_id: Uuid, database_id: Uuid) -> Result<Option<Grant>> {
        let now = Utc::now();
        let inner = self.inner.read()?;
        Ok(inner
            .grants
            .iter()
            .find(|g| g.user_id == user_id && g.database_id == database_id && g.is_active_at(now))
            .cloned())
    }

    async fn create_connection(
        &self,
        user_id: Uuid,
        database_id: Uuid,
        source_ip: IpAddr,
    ) -> Result<ConnectionRecord> {
        let now = Utc::now();
        let conn = ConnectionRecord {
            uid: Uuid::now_v7(),
            user_id,
            database_id,
            source_ip,
            connected_at: now,
            last_activity_at: now,
            disconnected_at: None,
            queries: 0,
            bytes_transferred: 0,
        };
        self.inner.write()?.connections.insert(conn.uid, conn.clone());
        Ok(conn)
    }

    async fn close_connection(&self, connection_uid: Uuid) -> Result<()> {
        let mut inner = self.inner.write()?;
        if let Some(conn) = inner.connections.get_mut(&connection_uid) {
            if conn.disconnected_at.is_none() {
                conn.disconnected_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn record_query(
        &self,
        connection_uid: Uuid,
        query: NewQuery,
        rows: Vec<NewQueryRow>,
    ) -> Result<Uuid> {
        let mut inner = self.inner.write()?;
        let query_id = Uuid::now_v7();
        if let Some(conn) = inner.connections.get_mut(&connection_uid) {
            conn.queries += 1;
            conn.bytes_transferred += query.data_bytes;
            conn.last_activity_at = Utc::now();
        }
        inner.queries.push(QueryRecord {
            uid: query_id,
            connection_id: connection_uid,
            query,
        });
        for row in rows {
            inner.query_rows.push(QueryRowRecord {
                uid: Uuid::now_v7(),
                query_id,
                row,
            });
        }
        Ok(query_id)
    }

    async fn increment_grant_usage(
        &self,
        grant_uid: Uuid,
        add_queries: u64,
        add_bytes: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write()?;
        if let Some(grant) = inner.grants.iter_mut().find(|g| g.uid == grant_uid) {
            grant.query_count += add_queries;
            grant.bytes_transferred += add_bytes;
        }
        Ok(())
    }
}
