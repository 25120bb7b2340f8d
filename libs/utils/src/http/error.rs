use std::sync::atomic::{AtomicBool, Ordering};

use hyper::{header, Body, Response, StatusCode};
use serde::Serialize;
use tracing::{error, info};

use crate::auth::AuthError;

/// Whether JSON error bodies carry the `stack` detail. Set once at startup
/// (development mode only), never toggled afterwards.
static INCLUDE_ERROR_STACK: AtomicBool = AtomicBool::new(false);

pub fn set_include_error_stack(include: bool) {
    INCLUDE_ERROR_STACK.store(include, Ordering::Relaxed);
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0:#}")]
    BadRequest(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Database error: {0:#}")]
    Database(anyhow::Error),

    #[error("Export error: {0:#}")]
    Export(anyhow::Error),

    #[error(transparent)]
    InternalServerError(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Database(_) | ApiError::Export(_) | ApiError::InternalServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Export(_) => "EXPORT_ERROR",
            ApiError::InternalServerError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let stack = match &self {
            ApiError::Database(e) | ApiError::Export(e) | ApiError::InternalServerError(e)
                if INCLUDE_ERROR_STACK.load(Ordering::Relaxed) =>
            {
                Some(format!("{e:?}"))
            }
            _ => None,
        };
        if status.is_server_error() {
            error!("{self:#}");
        } else {
            info!("{self:#}");
        }
        HttpErrorBody::response_from_msg_and_status(self.to_string(), self.code(), stack, status)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorPayload {
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
}

#[derive(Serialize)]
pub struct HttpErrorBody {
    error: ErrorPayload,
}

impl HttpErrorBody {
    pub fn response_from_msg_and_status(
        message: String,
        code: &'static str,
        stack: Option<String>,
        status: StatusCode,
    ) -> Response<Body> {
        let body = HttpErrorBody {
            error: ErrorPayload {
                message,
                code,
                stack,
            },
        };
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            // this unwrap with serde_json::to_string is permitted because the
            // body is a struct of strings only
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }
}

pub async fn route_error_handler(err: routerify::RouteError) -> Response<Body> {
    match err.downcast::<ApiError>() {
        Ok(api_error) => api_error_handler(*api_error),
        Err(other_error) => {
            error!("Error processing HTTP request: {other_error:?}");
            HttpErrorBody::response_from_msg_and_status(
                other_error.to_string(),
                "INTERNAL_ERROR",
                None,
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

pub fn api_error_handler(api_error: ApiError) -> Response<Body> {
    api_error.into_response()
}
