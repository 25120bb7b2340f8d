//! Main entry point for the export service executable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use exporter::config::{Environment, ExporterConf};
use exporter::http::routes::make_router;
use exporter::metrics::preinitialize_metrics;
use exporter::pool::{PoolManager, DRAIN_TIMEOUT};
use exporter::ExporterState;
use utils::auth::JwtAuth;
use utils::http::error::set_include_error_stack;
use utils::http::RouterService;
use utils::{logging, tcp_listener};

#[derive(Parser)]
#[command(author, version, about = "Streams XLSX report exports out of the database", long_about = None)]
struct Cli {
    /// Host and port to listen on, like `0.0.0.0:3001`. Overrides API_PORT.
    #[arg(short, long)]
    listen: Option<String>,

    /// Dev mode: permits running without JWT_SECRET and includes error
    /// detail in responses.
    #[arg(long, default_value = "false")]
    dev: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let mut conf = ExporterConf::from_env(args.dev).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        conf.listen_http_addr = listen;
    }

    logging::init(conf.log_format)?;
    logging::install_tracing_panic_hook();
    set_include_error_stack(conf.environment == Environment::Development);
    preinitialize_metrics();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async_main(conf))
}

async fn async_main(conf: ExporterConf) -> anyhow::Result<()> {
    info!(
        environment = %conf.environment,
        "starting exporter on {}",
        conf.listen_http_addr
    );

    // Bind early so a port conflict fails startup with a nonzero exit.
    let http_listener = tcp_listener::bind(conf.listen_http_addr.clone())?;

    let auth = match &conf.jwt_secret {
        Some(secret) => Some(Arc::new(
            JwtAuth::new(secret).map_err(anyhow::Error::new)?,
        )),
        None => {
            warn!("No JWT_SECRET configured: requests are served unauthenticated (dev mode)");
            None
        }
    };

    let pool = Arc::new(PoolManager::new(conf.db.clone()));
    let state = Arc::new(ExporterState {
        pool: pool.clone(),
        auth,
    });

    let router = make_router(state).build().map_err(|err| anyhow!(err))?;
    let service = RouterService::new(router).unwrap();

    let server_shutdown = CancellationToken::new();
    let server = hyper::Server::from_tcp(http_listener)?
        .serve(service)
        .with_graceful_shutdown({
            let server_shutdown = server_shutdown.clone();
            async move {
                server_shutdown.cancelled().await;
            }
        });
    let server_task = tokio::task::spawn(server);

    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigquit = tokio::signal::unix::signal(SignalKind::quit())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    info!("Terminating on signal");

    // Stop accepting requests, give in-flight exports a moment to finish,
    // then drain the pool with its own bounded timeout.
    server_shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), server_task).await {
        Ok(Ok(_)) => {
            info!("Joined HTTP server task");
        }
        Ok(Err(e)) => {
            tracing::error!("Error joining HTTP server task: {e}")
        }
        Err(_) => {
            warn!("Timed out joining HTTP server task");
            // Fall through to pool shutdown anyway; request handlers still
            // in flight will see cancellation as their clients disconnect.
        }
    }

    pool.graceful_shutdown(DRAIN_TIMEOUT).await;
    info!("Shutdown complete");

    std::process::exit(0);
}
