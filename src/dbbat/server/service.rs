use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::dbbat::common::Result;
use crate::dbbat::pg::{run_session, SessionContext};
use crate::dbbat::server::Listener;

/// The accept loop: one task per accepted connection, liveness tracked in a
/// JoinSet, graceful shutdown with a timeout after which stragglers are
/// force-closed.
pub struct ProxyService {
    listener: Listener,
    ctx: Arc<SessionContext>,
    max_connections: u32,
    shutdown_timeout: Duration,
}

impl ProxyService {
    pub fn new(
        address: String,
        ctx: Arc<SessionContext>,
        max_connections: u32,
        shutdown_timeout: Duration,
        reuseport: bool,
    ) -> Result<Self> {
        Ok(Self {
            listener: Listener::new(address, reuseport)?,
            ctx,
            max_connections,
            shutdown_timeout,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(address = %self.listener.address, "proxy listening");
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Some(conn) => conn,
                        None => break,
                    };
                    // reap finished sessions so len() tracks live ones
                    while sessions.try_join_next().is_some() {}
                    if sessions.len() >= self.max_connections as usize {
                        warn!(limit = self.max_connections, "reached connection limit");
                        continue; // drop the socket
                    }
                    let _ = stream.set_nodelay(true);
                    let ctx = self.ctx.clone();
                    let session_shutdown = shutdown.clone();
                    let span = info_span!("session", client_addr = %remote_addr);
                    sessions.spawn(
                        async move {
                            if let Err(e) = run_session(
                                ctx,
                                stream,
                                remote_addr.ip(),
                                session_shutdown,
                            )
                            .await
                            {
                                warn!(error = %e, "session ended with error");
                            }
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown.changed() => break,
            }
        }

        // stop accepting, then give live sessions a grace period
        drop(self.listener);
        let live = sessions.len();
        if live > 0 {
            info!(sessions = live, "waiting for sessions to drain");
            let drained = tokio::time::timeout(self.shutdown_timeout, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = sessions.len(),
                    "shutdown timeout reached, force-closing sessions"
                );
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
            }
        }
        info!("proxy stopped");
    }
}
