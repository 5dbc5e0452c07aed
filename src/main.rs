//! Sail relay daemon - CLI entry point.
//!
//! See the `sail_relay` library for the core functionality.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sail_relay::approval::ApprovalGate;
use sail_relay::{Config, HostAllowList, NativeChannel, NativeHostLauncher, RelayServer, SessionCtx};

/// Crate version, shown by `--version` and logged at startup.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "sail-relay")]
#[command(version = VERSION)]
#[command(about = "Connection broker between sandboxed browser callers and the Sail host service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay daemon (default when no subcommand is given)
    Run {
        /// Relay socket path (overrides config)
        #[arg(long)]
        socket: Option<std::path::PathBuf>,
        /// Native messaging host name (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Approve a hostname for project launches
    Approve {
        /// Hostname to approve; a leading dot approves all subdomains
        host: String,
    },
    /// List approved hostnames
    Hosts,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        None => run_daemon(None, None).await,
        Some(Commands::Run { socket, host }) => run_daemon(socket, host).await,
        Some(Commands::Approve { host }) => approve_host(&host).await,
        Some(Commands::Hosts) => list_hosts().await,
    }
}

/// Start the relay server and block until shutdown.
async fn run_daemon(
    socket_override: Option<std::path::PathBuf>,
    host_override: Option<String>,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(socket) = socket_override {
        config.socket_path = Some(socket);
    }
    if let Some(host) = host_override {
        config.host_name = host;
    }

    log::info!("sail-relay v{VERSION} starting");

    let launcher = match &config.manifest_dirs {
        Some(dirs) => NativeHostLauncher::new(&config.host_name, dirs.clone()),
        None => NativeHostLauncher::with_default_dirs(&config.host_name),
    };
    let channel = Arc::new(NativeChannel::new(
        Arc::new(launcher),
        config.connect_timeout(),
        config.request_timeout(),
    ));
    let gate = Arc::new(HostAllowList::load(Config::approved_hosts_path()?));

    let ctx = SessionCtx {
        channel: Arc::clone(&channel),
        gate,
        tunnel_open_timeout: config.tunnel_open_timeout(),
    };
    let server = RelayServer::start(config.socket_path(), ctx)?;
    println!("sail-relay listening on {}", server.socket_path().display());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    server.shutdown();
    channel.dispose();
    Ok(())
}

/// Add a hostname to the persisted allow-list.
async fn approve_host(host: &str) -> Result<()> {
    let gate = HostAllowList::load(Config::approved_hosts_path()?);
    gate.approve(host).await?;
    println!("Approved {host}");
    Ok(())
}

/// Print the current allow-list.
async fn list_hosts() -> Result<()> {
    let gate = HostAllowList::load(Config::approved_hosts_path()?);
    for host in gate.entries().await {
        println!("{host}");
    }
    Ok(())
}
