//! Gateway behavior against a live listener: CORS, edge validation, bearer
//! injection and streaming passthrough, and the status-only failure modes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, StatusCode};

use export_api::XLSX_CONTENT_TYPE;
use gateway::config::{Environment, GatewayConf};
use gateway::http::routes::make_router;
use gateway::proxy::ProxyForwarder;
use gateway::GatewayState;
use utils::auth::JwtAuth;
use utils::http::RouterService;

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
const ORIGIN: &str = "http://app.example.com";

fn test_conf(upstream_base: String) -> GatewayConf {
    GatewayConf {
        listen_http_addr: "127.0.0.1:0".to_string(),
        upstream_base,
        cors_origin: Some(ORIGIN.to_string()),
        jwt_secret: Some(SECRET.to_vec()),
        token_lifetime: Duration::from_secs(900),
        environment: Environment::Test,
        log_format: Default::default(),
    }
}

async fn start_gateway(upstream_base: String) -> String {
    let conf = test_conf(upstream_base);
    let proxy = ProxyForwarder::new(&conf);
    let state = Arc::new(GatewayState { conf, proxy });
    let router = make_router(state).build().unwrap();
    let service = RouterService::new(router).unwrap();
    let listener = utils::tcp_listener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(hyper::Server::from_tcp(listener).unwrap().serve(service));
    format!("http://{addr}")
}

/// A stand-in export service: verifies the minted bearer for real and
/// answers `/export/report` with a chunked body.
async fn upstream_handler(request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let verified = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| JwtAuth::new(SECRET).unwrap().decode(token).is_ok())
        .unwrap_or(false);
    if !verified {
        return Ok(Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Body::empty())
            .unwrap());
    }
    let response = match request.uri().path() {
        "/export/report" => {
            assert_eq!(request.uri().query(), Some("rowCount=3"));
            let (mut tx, body) = Body::channel();
            tokio::spawn(async move {
                tx.send_data("PK-first-chunk;".into()).await.unwrap();
                tx.send_data("second-chunk".into()).await.unwrap();
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", XLSX_CONTENT_TYPE)
                .header(
                    "content-disposition",
                    "attachment; filename=\"report-2024-03-07-093005.xlsx\"",
                )
                .body(body)
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(response)
}

async fn start_upstream() -> String {
    let listener = utils::tcp_listener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let make_svc =
        make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(upstream_handler)) });
    tokio::spawn(hyper::Server::from_tcp(listener).unwrap().serve(make_svc));
    format!("http://{addr}")
}

/// An address that refuses connections: bind a port, then free it.
fn refused_upstream() -> String {
    let listener = utils::tcp_listener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn bearer_is_minted_and_the_body_streams_through() {
    let upstream = start_upstream().await;
    let base = start_gateway(upstream).await;

    let response = Client::new()
        .get(format!("{base}/exports/report?rowCount=3").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        XLSX_CONTENT_TYPE
    );
    assert!(response.headers().contains_key("content-disposition"));
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        ORIGIN
    );
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"PK-first-chunk;second-chunk");
}

#[tokio::test]
async fn refused_upstream_is_a_bare_502() {
    let base = start_gateway(refused_upstream()).await;
    let response = Client::new()
        .get(format!("{base}/exports/report?rowCount=10").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn health_stays_local_when_upstream_is_down() {
    let base = start_gateway(refused_upstream()).await;
    let response = Client::new()
        .get(format!("{base}/health").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn bad_row_count_never_reaches_the_upstream() {
    // upstream refuses connections, yet the client sees a validation error,
    // proving the check runs at the edge
    let base = start_gateway(refused_upstream()).await;
    let response = Client::new()
        .get(format!("{base}/exports/report?rowCount=abc").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn preflight_advertises_the_single_origin() {
    let base = start_gateway(refused_upstream()).await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri(format!("{base}/exports/report"))
        .body(Body::empty())
        .unwrap();
    let response = Client::new().request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        ORIGIN
    );
    assert_eq!(
        response.headers().get("access-control-allow-methods").unwrap(),
        "GET, OPTIONS"
    );
    assert_eq!(
        response.headers().get("access-control-allow-headers").unwrap(),
        "Content-Type"
    );
}
