use std::sync::Arc;

use anyhow::anyhow;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::{Body, Request, Response, StatusCode};
use routerify::Middleware;

use export_api::{validate_row_count, HealthStatus};
use utils::http::endpoint::{self, prometheus_metrics_handler, request_span};
use utils::http::error::ApiError;
use utils::http::json::json_response;
use utils::http::request::parse_query_param;
use utils::http::{RequestExt, RouterBuilder};

use crate::GatewayState;

fn get_state(request: &Request<Body>) -> Arc<GatewayState> {
    request
        .data::<Arc<GatewayState>>()
        .expect("unknown state type")
        .clone()
}

async fn health_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(StatusCode::OK, HealthStatus::ok())
}

/// Rejects bad parameters at the edge, before any upstream call is spent.
fn check_row_count(request: &Request<Body>) -> Result<(), ApiError> {
    let requested = parse_query_param(request, "rowCount")?;
    validate_row_count(requested).map_err(|e| ApiError::BadRequest(anyhow!(e)))?;
    Ok(())
}

async fn exports_report_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    check_row_count(&request)?;
    let state = get_state(&request);
    Ok(state.proxy.forward(request, "/export/report").await)
}

async fn exports_report_buffered_handler(
    request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    check_row_count(&request)?;
    let state = get_state(&request);
    Ok(state.proxy.forward(request, "/export/report-buffered").await)
}

async fn preflight_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    // the allow-origin header is attached by the CORS middleware
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
        .body(Body::empty())
        .map_err(|e| ApiError::InternalServerError(e.into()))
}

async fn handler_404(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    Err(ApiError::NotFound(anyhow!("no such endpoint")))
}

pub fn make_router(state: Arc<GatewayState>) -> RouterBuilder<hyper::Body, ApiError> {
    // single-origin CORS; no header means CORS stays disabled
    let allow_origin: Option<HeaderValue> = state
        .conf
        .cors_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok());

    endpoint::make_router()
        .data(state)
        .middleware(Middleware::post(move |mut response: Response<Body>| {
            let allow_origin = allow_origin.clone();
            async move {
                if let Some(origin) = allow_origin {
                    response
                        .headers_mut()
                        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                }
                Ok(response)
            }
        }))
        .get("/health", |r| request_span(r, health_handler))
        .get("/metrics", |r| request_span(r, prometheus_metrics_handler))
        .get("/exports/report", |r| request_span(r, exports_report_handler))
        .get("/exports/report-buffered", |r| {
            request_span(r, exports_report_buffered_handler)
        })
        .options("/exports/report", |r| request_span(r, preflight_handler))
        .options("/exports/report-buffered", |r| {
            request_span(r, preflight_handler)
        })
        .any(|r| request_span(r, handler_404))
}
