//! Global gateway metrics, exposed on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

pub static PROXIED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_proxied_requests_total",
        "Requests forwarded to the export service, by outcome",
        &["outcome"]
    )
    .expect("Failed to register gateway_proxied_requests_total counter")
});

pub fn preinitialize_metrics() {
    Lazy::force(&PROXIED_REQUESTS);
}
