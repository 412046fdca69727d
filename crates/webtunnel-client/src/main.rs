//! `webtunnel` client
//!
//! Exposes a local TCP/HTTP service on the public internet through a relay
//! server, without inbound ports on the local machine.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use webtunnel_client::tunnel::{Client, ReconnectPolicy, TunnelConfig};
use webtunnel_core::config::{ConfigOverlay, ServerAddrOverlay, load_config};
use webtunnel_core::{Identity, tracing_init};

#[derive(Parser, Debug)]
#[command(name = "webtunnel")]
#[command(version, about = "webtunnel - expose a local service through a relay")]
struct Args {
    /// Host of the local service
    #[arg(long = "lh", env = "WEBTUNNEL_LOCAL_HOST")]
    local_host: Option<String>,

    /// Port of the local service
    #[arg(long = "lp", env = "WEBTUNNEL_LOCAL_PORT")]
    local_port: Option<u16>,

    /// Relay server host
    #[arg(long = "rh", env = "WEBTUNNEL_REMOTE_HOST")]
    remote_host: Option<String>,

    /// Relay server port
    #[arg(long = "rp", env = "WEBTUNNEL_REMOTE_PORT")]
    remote_port: Option<u16>,

    /// Number of idle data connections kept open to the relay
    #[arg(long = "ps", env = "WEBTUNNEL_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Identity file (created on first run)
    #[arg(long = "uuid", env = "WEBTUNNEL_IDENTITY_FILE")]
    identity_file: Option<PathBuf>,

    /// Replace the `Host` header of forwarded requests
    #[arg(long, env = "WEBTUNNEL_REWRITE_HOST")]
    rewrite_host: Option<String>,

    /// Verbose logging, including request previews
    #[arg(short, long, env = "WEBTUNNEL_VERBOSE")]
    verbose: bool,

    /// Settings file layered over the global one
    #[arg(long, env = "WEBTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "WEBTUNNEL_LOG_JSON")]
    log_json: bool,

    /// Wait this long between reconnect attempts (default: retry immediately)
    #[arg(long, env = "WEBTUNNEL_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: Option<u64>,
}

impl Args {
    fn overlay(&self) -> ConfigOverlay {
        let addr = |host: &Option<String>, port: Option<u16>| {
            (host.is_some() || port.is_some()).then(|| ServerAddrOverlay {
                host: host.clone(),
                port,
            })
        };
        ConfigOverlay {
            local_server: addr(&self.local_host, self.local_port),
            remote_server: addr(&self.remote_host, self.remote_port),
            pool_size: self.pool_size,
            identity_file: self.identity_file.clone(),
            rewrite_host: self.rewrite_host.clone(),
            debug: self.verbose.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_config(args.config.as_deref())?;
    settings.merge(args.overlay());
    settings.validate()?;

    tracing_init::init_tracing("webtunnel_client", settings.debug, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        local = %settings.local_server,
        relay = %settings.remote_server,
        pool_size = settings.pool_size,
        "Starting webtunnel"
    );

    let identity = Identity::load_or_generate(&settings.identity_file)?;
    info!("Your id is {identity}");

    let mut config = TunnelConfig::new(&settings);
    if let Some(ms) = args.reconnect_delay_ms {
        config.reconnect = ReconnectPolicy::fixed(Duration::from_millis(ms));
    }

    let client = Client::new(config, identity);
    let tunnel_id = client.connect().await?;
    info!(tunnel = %tunnel_id, "Tunnel ready");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    client.close().await;
    info!("webtunnel stopped");
    Ok(())
}
