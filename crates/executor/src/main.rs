use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use am_executor::config::{self, Config};
use am_executor::server::Server;

/// How long in-flight HTTP requests get to drain after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            config::print_usage();
            std::process::exit(1);
        }
    };

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    config.log_warnings();

    if let Err(err) = run(config).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> am_executor::Result<()> {
    let addr = config.bind_addr();
    let commands = config
        .commands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let server = Arc::new(Server::new(config)?);
    let app = server.router();

    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr} with commands: {commands}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(());

    // In-flight launches keep their child processes; the grace window only
    // bounds how long we wait for open requests to drain.
    match tokio::time::timeout(SHUTDOWN_GRACE, serving).await {
        Ok(Ok(Ok(()))) => info!("server stopped"),
        Ok(Ok(Err(err))) => return Err(err.into()),
        Ok(Err(err)) => warn!("server task failed: {err}"),
        Err(_) => warn!("shutdown grace window expired, exiting with requests still in flight"),
    }

    Ok(())
}
