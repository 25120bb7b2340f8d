//! Shared plumbing for the export services: bearer-token auth, HTTP router
//! helpers, logging setup and listener binding.

/// JWT minting and verification for service-to-service calls.
pub mod auth;

/// Router construction, auth middleware, error responses, streaming sink.
pub mod http;

/// `tracing` initialization and the panic hook.
pub mod logging;

/// Eager TCP port binding.
pub mod tcp_listener;
