//! Per-data-source backend connection pools.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::mysql::client::BackendConnection;
use crate::mysql::dsn::DsnConfig;

/// Capped pool of authenticated connections to one physical MySQL
/// backend. Acquire is semaphore-gated; a connection that saw a fatal
/// protocol error is discarded instead of returned.
pub struct BackendPool {
    name: String,
    conf: Arc<DsnConfig>,
    idle: Mutex<Vec<BackendConnection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

/// A borrowed connection plus the permit that backs it. Must be handed
/// back through [`BackendPool::release`] on every exit path.
pub struct PooledConn {
    pub conn: BackendConnection,
    pub permit: OwnedSemaphorePermit,
}

impl BackendPool {
    pub fn new(
        name: &str,
        conf: Arc<DsnConfig>,
        max_connections: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            conf,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            acquire_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn acquire(&self) -> Result<PooledConn> {
        let permit = match timeout(
            self.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ProxyError::Pool(format!(
                    "pool {} is shut down",
                    self.name
                )))
            }
            Err(_) => {
                return Err(ProxyError::Pool(format!(
                    "timed out acquiring a connection to {}",
                    self.name
                )))
            }
        };

        // reuse an idle connection, re-syncing its schema to the
        // configured database in case a borrower moved it
        while let Some(mut conn) = self.pop_idle() {
            match conn.sync_db(&self.conf.db_name).await {
                Ok(()) => {
                    return Ok(PooledConn { conn, permit });
                }
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "dropping stale idle connection");
                }
            }
        }

        debug!(pool = %self.name, addr = %self.conf.addr, "dialing backend");
        let conn = BackendConnection::connect(self.conf.clone()).await?;
        Ok(PooledConn { conn, permit })
    }

    /// Returns a borrowed connection. Broken connections are dropped; the
    /// permit is released either way.
    pub fn release(&self, pooled: PooledConn) {
        let PooledConn { conn, permit } = pooled;
        if conn.is_broken() {
            debug!(pool = %self.name, "discarding broken connection");
        } else {
            self.idle.lock().push(conn);
        }
        drop(permit);
    }

    fn pop_idle(&self) -> Option<BackendConnection> {
        self.idle.lock().pop()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
