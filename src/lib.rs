pub mod dbbat;
#[cfg(test)]
mod tests;

pub use crate::dbbat::*;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::dbbat::auth::AuthCache;
use crate::dbbat::common::Result;
use crate::dbbat::config::{load_config, Settings};
use crate::dbbat::pg::{SessionContext, TcpUpstreamConnector};
use crate::dbbat::server::ProxyService;
use crate::dbbat::store::{MemoryStore, Store};

/// Install the global tracing subscriber, filtered by RUST_LOG (default info).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Load the configuration settings from dbbat.yaml.
/// See dbbat::config::load_config for the search order.
pub fn init_settings() -> Result<&'static Settings> {
    load_config("dbbat.yaml")
}

pub fn init_runtime() -> io::Result<Runtime> {
    Builder::new_multi_thread().enable_all().build()
}

/// Wire the store, auth cache and session context together and run the accept
/// loop until the shutdown signal flips.
pub async fn run_proxy(conf: &'static Settings, shutdown: watch::Receiver<bool>) -> Result<()> {
    let store: Arc<dyn Store> =
        Arc::new(MemoryStore::from_identities(&conf.identities, &conf.key)?);
    let auth_cache = Arc::new(AuthCache::new(
        conf.auth_cache.enabled,
        Duration::from_secs(conf.auth_cache.ttl_seconds as u64),
        conf.auth_cache.max_size as usize,
    ));
    let ctx = Arc::new(SessionContext {
        store,
        auth_cache: auth_cache.clone(),
        connector: Arc::new(TcpUpstreamConnector),
        encryption_key: conf.key,
        capture: conf.query_storage.into(),
        recv_buffer_size: conf.recv_buffer_size as usize,
    });
    let service = ProxyService::new(
        conf.listen_address(),
        ctx,
        conf.max_connections,
        Duration::from_secs(conf.shutdown_timeout_seconds as u64),
        conf.reuseport,
    )?;
    service.run(shutdown).await;
    auth_cache.clear();
    Ok(())
}
