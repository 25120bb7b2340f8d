//! Process-wide database connection pool with an explicit lifecycle.
//!
//! The pool is created lazily on first use, torn down and rebuilt after
//! fatal transport errors, and drained with a bounded wait on shutdown. All
//! state transitions are serialized behind one mutex, so concurrent callers
//! observe a consistent lifecycle.

use std::error::Error as _;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::config::DbConf;
use crate::metrics::POOL_RESETS;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Connecting,
    Ready,
    Resetting,
    ShuttingDown,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is shutting down")]
    ShuttingDown,
    #[error("failed to create connection pool: {0}")]
    Create(String),
    #[error("failed to acquire a database connection: {0}")]
    Acquire(#[from] deadpool_postgres::PoolError),
}

struct Inner {
    state: PoolState,
    pool: Option<Pool>,
}

pub struct PoolManager {
    conf: DbConf,
    inner: tokio::sync::Mutex<Inner>,
}

impl PoolManager {
    pub fn new(conf: DbConf) -> Self {
        PoolManager {
            conf,
            inner: tokio::sync::Mutex::new(Inner {
                state: PoolState::Uninitialized,
                pool: None,
            }),
        }
    }

    /// A connection handle for one query. Fails immediately during and after
    /// shutdown. The first caller builds the pool; the mutex makes every
    /// concurrent first-acquire wait on that single attempt.
    pub async fn acquire(&self) -> Result<Object, PoolError> {
        let pool = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, PoolState::ShuttingDown | PoolState::Closed) {
                return Err(PoolError::ShuttingDown);
            }
            if inner.pool.is_none() {
                inner.state = PoolState::Connecting;
                match self.build_pool() {
                    Ok(pool) => {
                        info!(
                            host = %self.conf.host,
                            port = self.conf.port,
                            dbname = %self.conf.dbname,
                            max_connections = self.conf.max_connections,
                            min_connections = self.conf.min_connections,
                            "connection pool created"
                        );
                        inner.pool = Some(pool);
                        inner.state = PoolState::Ready;
                    }
                    Err(e) => {
                        inner.state = PoolState::Uninitialized;
                        return Err(e);
                    }
                }
            }
            inner.pool.clone().expect("pool was just created")
        };
        Ok(pool.get().await?)
    }

    fn build_pool(&self) -> Result<Pool, PoolError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.conf.host)
            .port(self.conf.port)
            .user(&self.conf.user)
            .password(&self.conf.password)
            .dbname(&self.conf.dbname)
            .connect_timeout(CONNECT_TIMEOUT);
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(manager)
            .max_size(self.conf.max_connections)
            .wait_timeout(Some(ACQUIRE_TIMEOUT))
            .create_timeout(Some(CONNECT_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PoolError::Create(e.to_string()))
    }

    /// Tears the pool down so the next `acquire` rebuilds it. Idempotent and
    /// infallible: called from error paths, any trouble is logged only.
    pub async fn close_and_reset(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, PoolState::ShuttingDown | PoolState::Closed) {
            return;
        }
        if inner.pool.is_some() {
            inner.state = PoolState::Resetting;
            // close the underlying pool before dropping the handle, so no
            // checked-in connection survives into the rebuilt pool
            inner.pool.as_ref().unwrap().close();
            inner.pool = None;
            POOL_RESETS.inc();
            warn!("connection pool closed after fatal transport error, will reconnect on next use");
        }
        inner.state = PoolState::Uninitialized;
    }

    /// Refuses new work, then waits for checked-out connections to come home,
    /// bounded by `timeout`. The bounding timer is dropped as soon as the
    /// drain completes, so it cannot hold up process exit.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        let pool = {
            let mut inner = self.inner.lock().await;
            if inner.state == PoolState::Closed {
                return;
            }
            // refuse new queries before starting to close
            inner.state = PoolState::ShuttingDown;
            inner.pool.take()
        };
        if let Some(pool) = pool {
            pool.close();
            let drained = tokio::time::timeout(timeout, async {
                while pool.status().size > 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
            match drained {
                Ok(()) => info!("connection pool drained"),
                Err(_) => warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for connection pool to drain"
                ),
            }
        }
        let mut inner = self.inner.lock().await;
        inner.state = PoolState::Closed;
        info!("connection pool closed");
    }

    pub async fn state(&self) -> PoolState {
        self.inner.lock().await.state
    }
}

/// Transport-level failures that leave pooled connections in an unknown
/// state; any of these triggers a full pool reset.
pub fn is_fatal_transport_error(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    if let Some(io) = e.source().and_then(|s| s.downcast_ref::<std::io::Error>()) {
        return matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        );
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conf() -> DbConf {
        DbConf {
            host: "127.0.0.1".to_string(),
            // nothing listens here: connection attempts fail fast
            port: 1,
            user: "report".to_string(),
            password: "report".to_string(),
            dbname: "reportdb".to_string(),
            max_connections: 4,
            min_connections: 1,
        }
    }

    #[tokio::test]
    async fn acquire_fails_cleanly_without_a_database() {
        let mgr = PoolManager::new(test_conf());
        assert_eq!(mgr.state().await, PoolState::Uninitialized);
        let err = mgr.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Acquire(_)));
        // pool construction itself succeeded
        assert_eq!(mgr.state().await, PoolState::Ready);
    }

    #[tokio::test]
    async fn close_and_reset_is_idempotent() {
        let mgr = PoolManager::new(test_conf());
        let _ = mgr.acquire().await;
        mgr.close_and_reset().await;
        assert_eq!(mgr.state().await, PoolState::Uninitialized);
        mgr.close_and_reset().await;
        assert_eq!(mgr.state().await, PoolState::Uninitialized);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work_and_terminates_promptly() {
        let mgr = PoolManager::new(test_conf());
        let _ = mgr.acquire().await;
        let started = std::time::Instant::now();
        mgr.graceful_shutdown(Duration::from_secs(30)).await;
        // an empty pool drains without consuming the timeout
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(mgr.state().await, PoolState::Closed);
        assert!(matches!(
            mgr.acquire().await.unwrap_err(),
            PoolError::ShuttingDown
        ));
        // shutting down twice is fine
        mgr.graceful_shutdown(Duration::from_secs(30)).await;
        assert_eq!(mgr.state().await, PoolState::Closed);
    }
}
