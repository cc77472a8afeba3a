//! udpfwd - UDP forwarding daemon
//!
//! Relays datagrams from frontend ports to DNS-named backends. Rules are
//! managed over a small HTTP API and persisted to a records file.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use udpfwd_api::{ApiListen, ApiServer, ApiServerConfig};
use udpfwd_control::RelayRegistry;
use udpfwd_relay::{RelayConfig, SystemResolver};
use udpfwd_store::{FileRuleStore, RuleStore};

/// UDP forwarding daemon with a runtime control API
#[derive(Parser, Debug)]
#[command(name = "udpfwd")]
#[command(about = "Relay UDP ports to DNS-named backends", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Unix socket for the control API
    #[arg(long, env = "SOCKET_PATH", default_value = "/etc/udplb/api.sock")]
    socket_path: PathBuf,

    /// Serve the control API on TCP instead of the Unix socket
    #[arg(long, env = "UDPFWD_API_ADDR")]
    api_addr: Option<SocketAddr>,

    /// File the active rules are persisted to
    #[arg(long, env = "RECORDS_PATH", default_value = "/var/lib/udpproxy/records")]
    records_path: PathBuf,

    /// Address frontend sockets bind to
    #[arg(long, env = "UDPFWD_BIND_IP", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Seconds of inactivity before a client flow is dropped
    #[arg(long, env = "UDPFWD_IDLE_TIMEOUT", default_value = "90")]
    idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "UDPFWD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn api_listen(&self) -> ApiListen {
        match self.api_addr {
            Some(addr) => ApiListen::Tcp(addr),
            None => ApiListen::Unix(self.socket_path.clone()),
        }
    }

    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_ip: self.bind_ip,
            idle_timeout: Duration::from_secs(self.idle_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Starting udpfwd {}", env!("GIT_TAG"));
    info!("Records file: {}", cli.records_path.display());

    let store = Arc::new(
        FileRuleStore::new(&cli.records_path).context("Failed to prepare records directory")?,
    );
    let records = store
        .load()
        .await
        .context("Failed to read records from file")?;
    info!("Loaded {} records", records.len());

    let registry = Arc::new(RelayRegistry::new(
        store,
        Arc::new(SystemResolver),
        cli.relay_config(),
    ));

    let restore_registry = registry.clone();
    tokio::spawn(async move {
        let active = restore_registry.restore(records).await;
        info!("Restored relays, {} active", active);
    });

    let shutdown = CancellationToken::new();
    let server = ApiServer::new(
        ApiServerConfig {
            listen: cli.api_listen(),
        },
        registry.clone(),
    );
    let mut api_handle = tokio::spawn(server.start(shutdown.clone()));

    tokio::select! {
        signal = shutdown_signal() => {
            info!("Received {}, stopping server", signal);
        }
        result = &mut api_handle => {
            // The API server only returns on its own when it could not start
            match result {
                Ok(Ok(())) => anyhow::bail!("API server exited unexpectedly"),
                Ok(Err(e)) => return Err(e.context("API server failed")),
                Err(e) => return Err(anyhow::anyhow!("API server task panicked: {}", e)),
            }
        }
    }

    tokio::spawn(async {
        loop {
            let signal = shutdown_signal().await;
            warn!("Already received a shutdown signal, ignoring {}", signal);
        }
    });

    shutdown.cancel();
    match api_handle.await {
        Ok(Ok(())) => info!("Server stopped"),
        Ok(Err(e)) => error!("API server error during shutdown: {:#}", e),
        Err(e) => error!("API server task failed: {}", e),
    }

    info!("Stopping all relays");
    registry.close().await;
    info!("Relays stopped");

    Ok(())
}

/// Wait for SIGINT or SIGTERM and return its name
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error listening for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error listening for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}
