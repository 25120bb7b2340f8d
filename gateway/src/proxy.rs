//! Streaming passthrough to the export service.
//!
//! The gateway never reads an upstream response body: hyper's client body is
//! already a byte stream, and handing it straight back to the server side
//! pipes it to the client chunk by chunk. Backpressure from a slow client
//! therefore reaches the export service's own sink untouched. Should the
//! upstream fail mid-body, the error surfaces through that stream and hyper
//! terminates the client connection abortively.

use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::header::AUTHORIZATION;
use hyper::{Body, Client, Request, Response, StatusCode};
use tracing::warn;

use utils::auth::{mint_token, AuthError};

use crate::config::GatewayConf;
use crate::metrics::PROXIED_REQUESTS;

/// Bounds the wait for upstream response *headers* only. Bodies stream for
/// as long as they stream; slow clients are a backpressure concern, not a
/// timeout concern.
const UPSTREAM_HEADER_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("upstream did not answer within {}s", UPSTREAM_HEADER_TIMEOUT.as_secs())]
    Timeout,
    #[error("upstream request failed: {0}")]
    Transport(hyper::Error),
    #[error("failed to mint bearer token: {0}")]
    Mint(AuthError),
    #[error("failed to build upstream request: {0}")]
    BadRequest(hyper::http::Error),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Mint(_) | ProxyError::BadRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            ProxyError::Timeout => "timeout",
            ProxyError::Transport(_) => "upstream_down",
            ProxyError::Mint(_) | ProxyError::BadRequest(_) => "internal",
        }
    }
}

pub struct ProxyForwarder {
    client: Client<HttpConnector>,
    upstream_base: String,
    jwt_secret: Option<Vec<u8>>,
    token_lifetime: Duration,
}

impl ProxyForwarder {
    pub fn new(conf: &GatewayConf) -> Self {
        ProxyForwarder {
            client: Client::new(),
            upstream_base: conf.upstream_base.clone(),
            jwt_secret: conf.jwt_secret.clone(),
            token_lifetime: conf.token_lifetime,
        }
    }

    /// Forwards `request` to `internal_path` upstream, injecting a freshly
    /// minted bearer, and returns the upstream response as-is.
    ///
    /// Transport failures become status-only responses: 502 when the
    /// upstream cannot be reached, 504 when it does not answer in time. No
    /// JSON body in either case.
    pub async fn forward(&self, request: Request<Body>, internal_path: &str) -> Response<Body> {
        match self.forward_inner(&request, internal_path).await {
            Ok(response) => {
                PROXIED_REQUESTS
                    .with_label_values(&[if response.status().is_success() {
                        "ok"
                    } else {
                        "upstream_error"
                    }])
                    .inc();
                response
            }
            Err(e) => {
                PROXIED_REQUESTS.with_label_values(&[e.outcome()]).inc();
                warn!("proxying {} failed: {e}", request.uri().path());
                status_only(e.status())
            }
        }
    }

    async fn forward_inner(
        &self,
        request: &Request<Body>,
        internal_path: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let mut uri = format!("{}{}", self.upstream_base, internal_path);
        if let Some(query) = request.uri().query() {
            uri.push('?');
            uri.push_str(query);
        }

        let mut outbound = Request::builder().method(request.method().clone()).uri(uri);
        if let Some(secret) = &self.jwt_secret {
            let token =
                mint_token(secret, self.token_lifetime).map_err(ProxyError::Mint)?;
            outbound = outbound.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let outbound = outbound
            .body(Body::empty())
            .map_err(ProxyError::BadRequest)?;

        let response = tokio::time::timeout(UPSTREAM_HEADER_TIMEOUT, self.client.request(outbound))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(ProxyError::Transport)?;
        Ok(response)
    }
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        // only fails on an invalid status, and these are constants
        .unwrap()
}
