//! `xocsi` — Xen Orchestra CSI plugin daemon.

mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use libxocsi::transport::{CsiClient, CsiServer};
use libxocsi::{CsiMessage, DriverConfig, XoCsiDriver, version};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "xocsi", about = "Xen Orchestra block-volume CSI plugin", disable_version_flag = true)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Print version information and exit.
    #[arg(short = 'V', long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the plugin server.
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "/etc/xocsi/config.yaml")]
        config: PathBuf,
        /// Overrides `listen` from the config file.
        #[arg(long, value_name = "ADDR")]
        listen: Option<SocketAddr>,
        /// Overrides `node_id` from the config file.
        #[arg(long, value_name = "VM_UUID")]
        node_id: Option<String>,
    },
    /// Ask a running server for its plugin info and readiness.
    Probe {
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:10000")]
        addr: SocketAddr,
        /// Name in the server certificate.
        #[arg(long, default_value = "localhost")]
        server_name: String,
        /// CA bundle that signed the server certificate.
        #[arg(long, value_name = "FILE")]
        ca: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", version::version_info());
        return Ok(());
    }

    init_tracing(cli.log_format);

    match cli.command {
        Some(Command::Serve {
            config,
            listen,
            node_id,
        }) => serve(config, listen, node_id).await,
        Some(Command::Probe {
            addr,
            server_name,
            ca,
        }) => probe(addr, &server_name, ca).await,
        None => bail!("no command given, see --help"),
    }
}

async fn serve(
    config_path: PathBuf,
    listen: Option<SocketAddr>,
    node_id: Option<String>,
) -> Result<()> {
    let mut config = DriverConfig::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if node_id.is_some() {
        config.node_id = node_id;
    }

    info!(version = %version::version_info(), driver = %config.driver_name, "starting xocsi");

    let driver = Arc::new(XoCsiDriver::from_config(&config).context("initialise driver")?);
    let tls = tls::server_config(&config.tls.cert, &config.tls.key)?;
    let server = CsiServer::new(config.listen, tls, driver).context("start QUIC listener")?;

    tokio::select! {
        res = server.serve() => res.context("accept loop failed")?,
        res = shutdown_signal() => {
            res?;
            info!("shutdown signal received");
        }
    }
    server.shutdown().await;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

async fn probe(addr: SocketAddr, server_name: &str, ca: PathBuf) -> Result<()> {
    let tls = tls::client_config(&ca)?;
    let client = CsiClient::connect(addr, server_name, tls)
        .await
        .with_context(|| format!("connect to {addr}"))?;

    let info = client.call(&CsiMessage::GetPluginInfo).await?;
    let ready = client.call(&CsiMessage::Probe).await?;
    client.close().await;

    match (info, ready) {
        (CsiMessage::PluginInfoResponse(info), CsiMessage::ProbeResult(true)) => {
            println!("{} {} ready", info.name, info.vendor_version);
            Ok(())
        }
        (info, ready) => {
            warn!(%info, %ready, "plugin not ready");
            bail!("plugin at {addr} is not ready")
        }
    }
}
