use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use recon_api::{Server, DEFAULT_SOCKET_PATH};
use recon_runtime::{Runtime, RuntimeConfig};
use recon_store::{NamespacedState, StoreConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "recond", version, about = "Recon daemon")]
struct Args {
    /// Listening socket
    #[arg(long = "socket-path", env = "RECON_SOCKET_PATH", default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,
}

fn init_tracing() {
    let env = std::env::var("RECON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RECON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Resolves on the first SIGTERM or SIGINT.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut term, mut int) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(t), Ok(i)) => (t, i),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers; falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C");
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env();
    let runtime_config = RuntimeConfig::from_env();
    info!(
        socket = %args.socket_path.display(),
        history = store_config.history_capacity,
        watch_buffer = store_config.watch_buffer,
        max_retries = runtime_config.max_retries,
        grace_ms = %runtime_config.grace_period.as_millis(),
        "recond: starting"
    );
    let store = Arc::new(NamespacedState::new(store_config));
    let runtime = Runtime::new(store, runtime_config);
    let server = Server::new(runtime.clone(), &args.socket_path);
    let listener = server.bind().context("cannot listen")?;
    runtime.start();

    let token = CancellationToken::new();
    let serve = server.serve(listener, token.clone());
    tokio::pin!(serve);
    let served = tokio::select! {
        res = &mut serve => res,
        _ = shutdown_signal() => {
            // Stop accepting, end streams, close adapter sessions, remove the socket.
            token.cancel();
            serve.await
        }
    };
    runtime.shutdown().await;
    info!("recond: stopped");
    served
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    init_metrics();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %format!("{e:#}"), "recond: fatal");
        eprintln!("recond: {e:#}");
        std::process::exit(1);
    }
}
