//! Trellis daemon
//!
//! Wires the control plane together: the local API server on its local
//! transport, the DNS manager with the platform configurator, and the
//! node backend. On shutdown the host's DNS configuration is restored
//! and the API socket removed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use trellis_backend::MemBackend;
use trellis_dns::{LoggingSink, Manager as DnsManager, NoopOsConfigurator, OsConfigurator};
use trellis_localapi::Server;

mod config;

use config::DaemonConfig;

/// Trellis - mesh VPN node daemon
#[derive(Parser)]
#[command(name = "trellisd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.trellis/trellisd.toml")]
    config: PathBuf,

    /// Unix socket path for the local API (overrides config)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Serve the local API on loopback TCP instead of the Unix socket
    /// (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Do not touch the host's DNS configuration
    #[arg(long)]
    no_dns: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config_path = expand_path(&cli.config)?;
    let mut config = DaemonConfig::load_or_create(&config_path).await?;
    if let Some(socket) = &cli.socket {
        config.api.socket_path = socket.to_string_lossy().into_owned();
    }
    if let Some(port) = cli.port {
        config.api.tcp_port = Some(port);
    }
    if cli.no_dns {
        config.dns.manage_host = false;
    }
    config.validate()?;

    info!("starting trellisd...");

    // Backend. The tunnel engine plugs in here; without one we run the
    // in-memory backend, which serves the whole local API.
    let mut backend = MemBackend::new();
    if let Some(spool) = &config.files.spool_dir {
        backend = backend.with_file_dir(PathBuf::from(spool));
    }
    let backend = Arc::new(backend);
    info!("running with the in-memory dev backend");

    // Host DNS.
    let os: Arc<dyn OsConfigurator> = if !config.dns.manage_host {
        Arc::new(NoopOsConfigurator)
    } else {
        new_os_configurator(&config)
    };
    let dns = Arc::new(DnsManager::new(os, Arc::new(LoggingSink)));

    // Local API.
    let server = Arc::new(
        Server::new(
            backend.clone(),
            trellis_metrics::global(),
            log_id(),
        )
        .with_required_password(config.api.required_password.clone()),
    );
    let socket_path = PathBuf::from(&config.api.socket_path);
    let api_task = match config.api.tcp_port {
        Some(port) => {
            let token = trellis_localapi::generate_token();
            // The token is the client's only way in; surface it once.
            println!("trellisd: local API token: {token}");
            tokio::spawn(async move { server.run_tcp(port, token).await })
        }
        None => spawn_unix_api(server, socket_path.clone())?,
    };

    wait_for_shutdown_signal().await;
    info!("shutting down...");

    api_task.abort();
    if let Err(e) = dns.close() {
        warn!("restoring host DNS: {e}");
    }
    if config.api.tcp_port.is_none() {
        let _ = std::fs::remove_file(&socket_path);
    }
    info!("bye");
    Ok(())
}

#[cfg(unix)]
fn spawn_unix_api(
    server: Arc<Server>,
    path: PathBuf,
) -> Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    Ok(tokio::spawn(async move { server.run_unix(&path).await }))
}

#[cfg(not(unix))]
fn spawn_unix_api(
    _server: Arc<Server>,
    _path: PathBuf,
) -> Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    anyhow::bail!("the Unix socket transport is unavailable on this platform; set api.tcp_port")
}

#[cfg(windows)]
fn new_os_configurator(config: &DaemonConfig) -> Arc<dyn OsConfigurator> {
    if config.dns.interface_guid.is_empty() {
        warn!("dns.interface_guid not set; not managing host DNS");
        return Arc::new(NoopOsConfigurator);
    }
    Arc::new(trellis_dns::WindowsOsConfigurator::new(
        &config.dns.interface_guid,
    ))
}

#[cfg(unix)]
fn new_os_configurator(_config: &DaemonConfig) -> Arc<dyn OsConfigurator> {
    Arc::new(trellis_dns::DirectOsConfigurator::new())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("installing SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Identifier stamped into bug report markers, stable for the process.
fn log_id() -> String {
    format!("{:08x}", std::process::id())
}

fn expand_path(path: &PathBuf) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.clone())
    }
}
