//! Global exporter metrics, exposed on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

pub static EXPORTS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "exporter_exports_started_total",
        "Number of exports that began streaming"
    )
    .expect("Failed to register exporter_exports_started_total counter")
});

pub static EXPORTS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "exporter_exports_completed_total",
        "Number of exports that finalized successfully"
    )
    .expect("Failed to register exporter_exports_completed_total counter")
});

pub static EXPORTS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "exporter_exports_failed_total",
        "Number of exports that ended on a failure path",
        &["kind"]
    )
    .expect("Failed to register exporter_exports_failed_total counter")
});

pub static EXPORTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "exporter_exports_in_flight",
        "Exports currently streaming"
    )
    .expect("Failed to register exporter_exports_in_flight gauge")
});

pub static ROWS_STREAMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "exporter_rows_streamed_total",
        "Rows committed to the spreadsheet encoder across all exports"
    )
    .expect("Failed to register exporter_rows_streamed_total counter")
});

pub static EXPORT_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "exporter_export_duration_seconds",
        "Wall-clock duration of completed exports",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    )
    .expect("Failed to register exporter_export_duration_seconds histogram")
});

pub static EXPORT_PEAK_RSS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "exporter_export_peak_rss_bytes",
        "Peak resident set size observed during the most recent export"
    )
    .expect("Failed to register exporter_export_peak_rss_bytes gauge")
});

pub static POOL_RESETS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "exporter_pool_resets_total",
        "Times the connection pool was torn down after a fatal transport error"
    )
    .expect("Failed to register exporter_pool_resets_total counter")
});

pub fn preinitialize_metrics() {
    Lazy::force(&EXPORTS_STARTED);
    Lazy::force(&EXPORTS_COMPLETED);
    Lazy::force(&EXPORTS_FAILED);
    Lazy::force(&EXPORTS_IN_FLIGHT);
    Lazy::force(&ROWS_STREAMED);
    Lazy::force(&EXPORT_DURATION);
    Lazy::force(&EXPORT_PEAK_RSS);
    Lazy::force(&POOL_RESETS);
}
