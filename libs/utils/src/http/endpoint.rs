use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderName, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use routerify::ext::RequestExt;
use routerify::{Middleware, RequestInfo, Router, RouterBuilder};
use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

use crate::auth::{parse_bearer, JwtAuth};
use super::error::{route_error_handler, ApiError};

static X_REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Default, Clone)]
struct RequestId(String);

/// Adds a tracing span to the request handler: all log messages produced
/// while handling the request are grouped under a span carrying the method,
/// path and request id. The status and latency are logged on completion.
pub async fn request_span<R, H>(request: Request<Body>, handler: H) -> R::Output
where
    R: Future<Output = Result<Response<Body>, ApiError>> + Send + 'static,
    H: FnOnce(Request<Body>) -> R + Send + Sync + 'static,
{
    let request_id = request.context::<RequestId>().unwrap_or_default().0;
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let span = info_span!("request", %method, %path, %request_id);

    async move {
        let started = std::time::Instant::now();
        let res = handler(request).await;
        match &res {
            Ok(response) => info!(
                status = %response.status(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request handled"
            ),
            Err(e) => info!("Request failed: {e:#}"),
        }
        res
    }
    .instrument(span)
    .await
}

fn add_request_id_middleware() -> Middleware<Body, ApiError> {
    Middleware::pre(move |req| async move {
        let request_id = match req.headers().get(&X_REQUEST_ID_HEADER) {
            Some(request_id) => request_id.to_str().unwrap_or_default().to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        req.set_context(RequestId(request_id));
        Ok(req)
    })
}

async fn add_request_id_header_to_response(
    mut res: Response<Body>,
    req_info: RequestInfo,
) -> Result<Response<Body>, ApiError> {
    if let Some(request_id) = req_info.context::<RequestId>() {
        if let Ok(header_value) = request_id.0.parse() {
            res.headers_mut().insert(&X_REQUEST_ID_HEADER, header_value);
        }
    }
    Ok(res)
}

pub fn make_router() -> RouterBuilder<hyper::Body, ApiError> {
    Router::builder()
        .middleware(add_request_id_middleware())
        .middleware(Middleware::post_with_info(
            add_request_id_header_to_response,
        ))
        .err_handler(route_error_handler)
}

/// Verifies the `Authorization: Bearer` credential and stores the decoded
/// claims in the request context for downstream handlers.
///
/// `provide_auth` returns the verifier to use for a given request; returning
/// `None` (e.g. for allow-listed routes) skips verification. All failures map
/// to 401 without consulting any other resource.
pub fn auth_middleware(
    provide_auth: fn(&Request<Body>) -> Option<&Arc<JwtAuth>>,
) -> Middleware<Body, ApiError> {
    Middleware::pre(move |req| async move {
        if let Some(auth) = provide_auth(&req) {
            let token = parse_bearer(req.headers().get(AUTHORIZATION))?;
            match auth.decode(token) {
                Ok(claims) => {
                    req.set_context(claims);
                }
                Err(e) => {
                    info!("failed to verify bearer token: {e}");
                    return Err(e.into());
                }
            }
        }
        Ok(req)
    })
}

pub async fn prometheus_metrics_handler(_req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let mut buffer = vec![];
    let metrics = prometheus::gather();
    TextEncoder::new()
        .encode(&metrics, &mut buffer)
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(buffer))
        .map_err(|e| ApiError::InternalServerError(e.into()))
}

/// A `std::io::Write` that forwards chunks into a bounded channel, whose
/// receiving end feeds `Body::wrap_stream`. Small writes accumulate in an
/// internal buffer up to `buf_len`, so the channel carries chunks of roughly
/// that size.
///
/// `blocking_send` means this type must only be used from blocking threads
/// (`spawn_blocking`), never on an executor thread. When the channel is
/// bounded, a slow receiver blocks the writer: that is the backpressure path.
///
/// Sending `Err(_)` into `tx` makes hyper abort the in-flight response body,
/// which the client observes as a reset rather than a clean end of transfer.
pub struct ChannelWriter {
    buffer: BytesMut,
    pub tx: mpsc::Sender<std::io::Result<Bytes>>,
    written: usize,
}

impl ChannelWriter {
    pub fn new(buf_len: usize, tx: mpsc::Sender<std::io::Result<Bytes>>) -> Self {
        assert_ne!(buf_len, 0);
        ChannelWriter {
            buffer: BytesMut::with_capacity(buf_len),
            tx,
            written: 0,
        }
    }

    pub fn flush0(&mut self) -> std::io::Result<usize> {
        let n = self.buffer.len();
        if n == 0 {
            return Ok(0);
        }
        tracing::trace!(n, "flushing");
        let ready = self.buffer.split().freeze();

        // This blocks the calling thread until the receiver makes room, or
        // fails if the receiver (the response body) is gone.
        if self.tx.blocking_send(Ok(ready)).is_err() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        self.written += n;
        Ok(n)
    }

    pub fn flushed_bytes(&self) -> usize {
        self.written
    }
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.buffer.len() + buf.len() > self.buffer.capacity() {
            self.flush0()?;
        }
        // assume that this will often under normal operation just move the
        // pointer back to the beginning of allocation, because previous split
        // off parts are already consumed and dropped.
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush0().map(|_| ())
    }
}
