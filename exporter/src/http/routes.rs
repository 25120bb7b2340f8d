use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use hyper::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info_span, Instrument};

use export_api::{export_filename, validate_row_count, HealthStatus, XLSX_CONTENT_TYPE};
use utils::auth::JwtAuth;
use utils::http::endpoint::{
    self, auth_middleware, prometheus_metrics_handler, request_span, ChannelWriter,
};
use utils::http::error::ApiError;
use utils::http::json::json_response;
use utils::http::request::parse_query_param;
use utils::http::{RequestExt, RouterBuilder};

use crate::export::{self, SINK_BUFFER_BYTES, SINK_CHANNEL_DEPTH};
use crate::metrics::EXPORTS_STARTED;
use crate::pool::is_fatal_transport_error;
use crate::source::{ReportSource, RowSource, SourceError};
use crate::ExporterState;

fn get_state(request: &Request<Body>) -> &ExporterState {
    request
        .data::<Arc<ExporterState>>()
        .expect("unknown state type")
        .as_ref()
}

async fn health_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(StatusCode::OK, HealthStatus::ok())
}

fn requested_rows(request: &Request<Body>) -> Result<i64, ApiError> {
    let requested = parse_query_param(request, "rowCount")?;
    validate_row_count(requested).map_err(|e| ApiError::BadRequest(anyhow!(e)))
}

/// Maps a startup failure to a structured response; no bytes have been
/// written yet at this point. Fatal transport errors additionally schedule a
/// pool reset.
fn source_api_error(state: &ExporterState, e: SourceError) -> ApiError {
    if let Some(db) = e.as_db_error() {
        if is_fatal_transport_error(db) {
            let pool = state.pool.clone();
            tokio::spawn(async move { pool.close_and_reset().await });
        }
    }
    ApiError::Database(anyhow::Error::new(e))
}

/// `GET /export/report?rowCount=N` — the streaming path. The response body
/// is the encoder's sink; memory stays bounded however many rows stream
/// through.
async fn export_report_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let row_count = requested_rows(&request)?;
    let state = get_state(&request);

    let source = RowSource::start(&state.pool, row_count)
        .await
        .map_err(|e| source_api_error(state, e))?;
    EXPORTS_STARTED.inc();

    let (tx, rx) = mpsc::channel(SINK_CHANNEL_DEPTH);
    let writer = ChannelWriter::new(SINK_BUFFER_BYTES, tx);
    let filename = export_filename("report", Utc::now());
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, XLSX_CONTENT_TYPE)
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::wrap_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::InternalServerError(e.into()))?;

    tokio::spawn(
        export::drive(source, writer, state.pool.clone())
            .instrument(info_span!("export", row_count)),
    );

    Ok(response)
}

/// `GET /export/report-buffered?rowCount=N` — same contract, but the whole
/// workbook is built in memory and sent with a known length. Kept as a
/// comparison point for the streaming path.
async fn export_report_buffered_handler(
    request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    let row_count = requested_rows(&request)?;
    let state = get_state(&request);

    let mut source = RowSource::start(&state.pool, row_count)
        .await
        .map_err(|e| source_api_error(state, e))?;
    EXPORTS_STARTED.inc();

    let mut rows = Vec::new();
    while let Some(cells) = source.next_row().await {
        rows.push(cells.map_err(|e| source_api_error(state, e))?);
    }

    let bytes = tokio::task::spawn_blocking(move || export::encode_buffered(rows))
        .await
        .map_err(|e| ApiError::InternalServerError(e.into()))?
        .map_err(|e| ApiError::Export(anyhow::Error::new(e)))?;

    let filename = export_filename("report", Utc::now());
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, XLSX_CONTENT_TYPE)
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::InternalServerError(e.into()))
}

async fn handler_404(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    Err(ApiError::NotFound(anyhow!("no such endpoint")))
}

pub fn make_router(state: Arc<ExporterState>) -> RouterBuilder<hyper::Body, ApiError> {
    let mut router = endpoint::make_router();
    if state.auth.is_some() {
        router = router.middleware(auth_middleware(|request| {
            const ALLOWLIST_ROUTES: &[&str] = &["/health", "/metrics"];
            if ALLOWLIST_ROUTES.contains(&request.uri().path()) {
                None
            } else {
                // Option<Arc<JwtAuth>> is always provided as data below, hence unwrap()
                request.data::<Option<Arc<JwtAuth>>>().unwrap().as_ref()
            }
        }))
    }

    let auth = state.auth.clone();
    router
        .data(state)
        .data(auth)
        .get("/health", |r| request_span(r, health_handler))
        .get("/metrics", |r| request_span(r, prometheus_metrics_handler))
        .get("/export/report", |r| request_span(r, export_report_handler))
        .get("/export/report-buffered", |r| {
            request_span(r, export_report_buffered_handler)
        })
        .any(|r| request_span(r, handler_404))
}
