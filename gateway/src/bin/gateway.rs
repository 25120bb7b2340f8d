//! Main entry point for the gateway executable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gateway::config::{Environment, GatewayConf};
use gateway::http::routes::make_router;
use gateway::metrics::preinitialize_metrics;
use gateway::proxy::ProxyForwarder;
use gateway::GatewayState;
use utils::http::error::set_include_error_stack;
use utils::http::RouterService;
use utils::{logging, tcp_listener};

#[derive(Parser)]
#[command(author, version, about = "Edge gateway for the export service", long_about = None)]
struct Cli {
    /// Host and port to listen on, like `0.0.0.0:3000`. Overrides APP_PORT.
    #[arg(short, long)]
    listen: Option<String>,

    /// Dev mode: permits running without JWT_SECRET and includes error
    /// detail in responses.
    #[arg(long, default_value = "false")]
    dev: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let mut conf = GatewayConf::from_env(args.dev).context("Failed to load configuration")?;
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

async fn async_main(conf: GatewayConf) -> anyhow::Result<()> {
    info!(
        environment = %conf.environment,
        upstream = %conf.upstream_base,
        "starting gateway on {}",
        conf.listen_http_addr
    );
    if conf.jwt_secret.is_none() {
        warn!("No JWT_SECRET configured: forwarding without bearer tokens (dev mode)");
    }

    // Bind early so a port conflict fails startup with a nonzero exit.
    let http_listener = tcp_listener::bind(conf.listen_http_addr.clone())?;

    let proxy = ProxyForwarder::new(&conf);
    let state = Arc::new(GatewayState { conf, proxy });

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
        }
    }
    info!("Shutdown complete");

    std::process::exit(0);
}
