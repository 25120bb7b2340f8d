use crate::config::GatewayConf;
use crate::proxy::ProxyForwarder;

pub mod config;
pub mod http;
pub mod metrics;
pub mod proxy;

pub mod defaults {
    pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
    pub const DEFAULT_APP_PORT: u16 = 3000;

    pub const DEFAULT_API_HOST: &str = "localhost";
    pub const DEFAULT_API_PORT: u16 = 3001;
}

/// Shared state handed to every request handler.
pub struct GatewayState {
    pub conf: GatewayConf,
    pub proxy: ProxyForwarder,
}
