use std::sync::Arc;

use utils::auth::JwtAuth;

use crate::pool::PoolManager;

pub mod config;
pub mod export;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod source;
pub mod xlsx;

pub mod defaults {
    pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
    pub const DEFAULT_API_PORT: u16 = 3001;

    pub const DEFAULT_DB_HOST: &str = "localhost";
    pub const DEFAULT_DB_PORT: u16 = 1433;
    pub const DEFAULT_MAX_DB_CONNECTIONS: usize = 50;
    pub const DEFAULT_MIN_DB_CONNECTIONS: usize = 5;
}

/// Shared state handed to every request handler.
pub struct ExporterState {
    pub pool: Arc<PoolManager>,
    /// `None` only in dev mode: requests are then served unauthenticated.
    pub auth: Option<Arc<JwtAuth>>,
}
