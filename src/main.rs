// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tailscrape::config::{self, ScrapeConfig};
use tailscrape::metrics::Registry;
use tailscrape::scraper::{supervisor, SshTransport, Supervisor};
use tailscrape::server::MetricsServer;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "tailscrape", about = "SSH log tailing Prometheus exporter")]
struct Args {
    /// Path to the scrape configuration file
    #[arg(long, env = "SCRAPECONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    scrapeconfig: PathBuf,

    /// Address to serve the scrape endpoint on
    #[arg(long, env = "TAILSCRAPE_LISTEN", default_value = "0.0.0.0:9144")]
    listen: SocketAddr,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let scrape_config = match ScrapeConfig::load(&args.scrapeconfig) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %args.scrapeconfig.display(), error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let schema = match scrape_config.compile() {
        Ok(schema) => schema,
        Err(err) => {
            error!(error = %err, "invalid column schema");
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(Registry::new(
        scrape_config.global.prefix.clone(),
        scrape_config.ttl(),
    ));
    if let Err(err) = schema.register(&registry) {
        error!(error = %err, "failed to register metric families");
        return ExitCode::FAILURE;
    }

    // Bind before starting the runtime so a taken port fails fast.
    let listener = match std::net::TcpListener::bind(args.listen) {
        Ok(listener) => listener,
        Err(err) => {
            error!(endpoint = %args.listen, error = %err, "failed to bind scrape endpoint");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let columns = Arc::new(schema.columns);
    match runtime.block_on(run(scrape_config, registry, columns, listener, args.listen)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "exporter failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    scrape_config: ScrapeConfig,
    registry: Arc<Registry>,
    columns: Arc<Vec<Option<tailscrape::parser::ColumnReader>>>,
    listener: std::net::TcpListener,
    listen: SocketAddr,
) -> Result<(), BoxError> {
    info!(endpoint = %listen, "starting tailscrape");

    // The socket was bound std before the runtime existed; hand it to tokio.
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let root_cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();

    let supervisor = Supervisor::new(registry.clone(), columns, Arc::new(SshTransport));
    {
        let cancel = root_cancel.clone();
        let config = scrape_config.clone();
        tasks.spawn(async move {
            supervisor::run(supervisor, config, cancel).await;
            Ok(())
        });
    }

    {
        let server = MetricsServer::new(registry);
        let cancel = root_cancel.clone();
        tasks.spawn(async move { server.serve(listener, cancel).await });
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => error!("task exited unexpectedly"),
                Ok(Err(err)) => error!(error = %err, "task failed"),
                Err(err) => error!(error = %err, "task panicked"),
            }
        }
    }

    root_cancel.cancel();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "task failed during shutdown"),
            Err(err) => error!(error = %err, "task panicked during shutdown"),
        }
    }

    info!("shutdown complete");
    Ok(())
}
