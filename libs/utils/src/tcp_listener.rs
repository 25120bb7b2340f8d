use std::net::{TcpListener, ToSocketAddrs};

use anyhow::Context;

/// Binds the listener eagerly, so that a port conflict fails startup instead
/// of the first request. The listener is left nonblocking, ready for
/// `hyper::Server::from_tcp`.
pub fn bind<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> anyhow::Result<TcpListener> {
    let listener =
        TcpListener::bind(&addr).with_context(|| format!("Failed to bind to address {addr:?}"))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
