use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use endlessh::config::Config;
use endlessh::server::Server;

/// An SSH tarpit.
#[derive(Parser)]
#[command(name = "endlessh", about, version = version::full())]
struct Cli {
    /// Path to a YAML configuration file. Explicit flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Message millisecond delay.
    #[arg(long = "interval_ms")]
    interval_ms: Option<u64>,

    /// Maximum banner line length.
    #[arg(long = "line_length")]
    line_length: Option<u64>,

    /// Maximum number of clients.
    #[arg(long = "max_clients")]
    max_clients: Option<usize>,

    /// Connection type. Possible values are tcp, tcp4, tcp6.
    #[arg(long = "conn_type")]
    conn_type: Option<String>,

    /// SSH listening address.
    #[arg(long)]
    host: Option<String>,

    /// SSH listening port. Repeat the flag to listen on multiple ports.
    #[arg(long = "port")]
    port: Vec<u16>,

    /// Enable prometheus.
    #[arg(long = "enable_prometheus")]
    enable_prometheus: bool,

    /// The address for prometheus.
    #[arg(long = "prometheus_host")]
    prometheus_host: Option<String>,

    /// The port for prometheus.
    #[arg(long = "prometheus_port")]
    prometheus_port: Option<u16>,

    /// Entry point for prometheus.
    #[arg(long = "prometheus_entry")]
    prometheus_entry: Option<String>,

    /// Remove series of IPs unseen for this many seconds. 0 disables the
    /// cleanup.
    #[arg(long = "prometheus_clean_unseen_seconds")]
    prometheus_clean_unseen_seconds: Option<u64>,

    /// Supplier to obtain Geohash of IPs. Possible values are off, ip-api,
    /// max-mind-db.
    #[arg(long = "geoip_supplier")]
    geoip_supplier: Option<String>,

    /// Path to the MaxMind DB file.
    #[arg(long = "max_mind_db")]
    max_mind_db: Option<String>,
}

/// Build-time version info, injected via RUSTFLAGS or the environment.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

/// Merge CLI flags over the config file (or the defaults).
fn build_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(ms) = cli.interval_ms {
        cfg.interval = Duration::from_millis(ms);
    }
    if let Some(line_length) = cli.line_length {
        cfg.line_length = line_length;
    }
    if let Some(max_clients) = cli.max_clients {
        cfg.max_clients = max_clients;
    }
    if let Some(conn_type) = &cli.conn_type {
        cfg.conn_type = conn_type.parse()?;
    }
    if let Some(host) = &cli.host {
        cfg.host = host.clone();
    }
    if !cli.port.is_empty() {
        cfg.ports = cli.port.clone();
    }

    if cli.enable_prometheus {
        cfg.prometheus.enabled = true;
    }
    if let Some(host) = &cli.prometheus_host {
        cfg.prometheus.host = host.clone();
    }
    if let Some(port) = cli.prometheus_port {
        cfg.prometheus.port = port;
    }
    if let Some(entry) = &cli.prometheus_entry {
        cfg.prometheus.entry = entry.clone();
    }
    if let Some(seconds) = cli.prometheus_clean_unseen_seconds {
        cfg.prometheus.clean_unseen_seconds = seconds;
    }

    if let Some(supplier) = &cli.geoip_supplier {
        cfg.geoip.supplier = supplier.parse()?;
    }
    if let Some(path) = &cli.max_mind_db {
        cfg.geoip.max_mind_db = path.clone();
    }

    cfg.validate()?;

    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = build_config(&cli)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting endlessh",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the tarpit.
    let mut server = Server::new(cfg)?;
    server.start().await?;

    // Wait for shutdown signal. Trapped sockets die with the process.
    let _ = shutdown_rx.await;

    server.stop().await?;

    tracing::info!("endlessh stopped");

    Ok(())
}
