//! Proxy/registrar process entry point, `SPEC_FULL.md` §4.12/§4.10.
//!
//! Wires `ProxyState::init` into a `UdpTransport`/`TimerService` pair for the
//! `serve` path, and hands the same `CdrEngine`/`RegistrarTable` to an
//! `AutoDialerManager` for the `dial`/`dial-batch` paths, mirroring the
//! teacher's pattern of one small `main` that builds the shared state once
//! and delegates everything else to library code.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use ims_sip_core::dialer::client::DialerConfig;
use ims_sip_core::dialer::manager::AutoDialerManager;
use ims_sip_core::error::{Error, Result};
use ims_sip_core::state::{ProxyState, SipDatagramHandler};
use ims_sip_core::transport::{DatagramHandler, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "ims-sip-server", about = "SIP proxy/registrar with an embedded auto-dialer")]
struct Args {
    /// Path to the JSON config file (created with defaults if missing).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the proxy/registrar UDP listener (the default when no subcommand is given).
    Serve,
    /// Registers the embedded auto-dialer and places a single call.
    Dial {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        callee: String,
        #[arg(long)]
        wav: PathBuf,
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        #[arg(long, default_value_t = 10_000)]
        local_port: u16,
    },
    /// Registers the embedded auto-dialer and dials every callee in `callees_file`
    /// (one number per line), bounded to a 5-minute batch window.
    DialBatch {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        callees_file: PathBuf,
        #[arg(long)]
        wav: PathBuf,
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        #[arg(long, default_value_t = 10_000)]
        local_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let initial_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (filter_layer, reload_handle) = reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let state = Arc::new(ProxyState::init(&args.config)?);

    // `LOG_LEVEL` (§4.12) takes effect immediately via this reload handle
    // instead of requiring a restart.
    state.config.on_log_level_change(move |level| match EnvFilter::try_new(level) {
        Ok(filter) => {
            if reload_handle.reload(filter).is_err() {
                tracing::warn!("log filter reload handle is gone");
            }
        }
        Err(err) => tracing::warn!(level, error = %err, "invalid LOG_LEVEL value, ignoring"),
    });

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(state).await,
        Command::Dial { username, password, callee, wav, duration_secs, local_port } => {
            let manager = build_dialer(&state, username, password, local_port);
            if !manager.start().await {
                return Err(Error::DialerNotRunning);
            }
            let outcome = manager.dial(&callee, &wav, Duration::from_secs(duration_secs)).await;
            tracing::info!(success = outcome.success, message = %outcome.message, "dial complete");
            manager.stop();
            Ok(())
        }
        Command::DialBatch { username, password, callees_file, wav, duration_secs, local_port } => {
            let callees: Vec<String> = std::fs::read_to_string(&callees_file)?
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();

            let manager = build_dialer(&state, username, password, local_port);
            if !manager.start().await {
                return Err(Error::DialerNotRunning);
            }
            let result = manager.dial_batch(callees, &wav, Duration::from_secs(duration_secs)).await;
            tracing::info!(accepted = result.accepted, total = result.total, message = %result.message, "batch complete");
            for (callee, outcome) in &result.results {
                tracing::info!(callee = %callee, success = outcome.success, message = %outcome.message, "call result");
            }
            manager.stop();
            Ok(())
        }
    }
}

fn build_dialer(state: &Arc<ProxyState>, username: String, password: String, local_port: u16) -> AutoDialerManager {
    let static_config = state.static_config();
    let config = DialerConfig {
        server_ip: static_config.server_ip.clone(),
        server_port: static_config.server_port,
        local_ip: static_config.server_ip,
        username,
        password,
        realm: static_config.realm,
        local_port,
    };
    AutoDialerManager::new(config, state.cdr.clone(), state.registrar.clone())
}

async fn run_server(state: Arc<ProxyState>) -> Result<()> {
    let static_config = state.static_config();
    let bind_addr = format!("{}:{}", static_config.server_ip, static_config.server_port);
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| Error::ParseError(format!("bad listen address {bind_addr}: {e}")))?;

    let transport = UdpTransport::bind(addr).await?;
    let handler: Arc<dyn DatagramHandler> = Arc::new(SipDatagramHandler { state: state.clone() });
    let timers = state.start_timers();
    let token = CancellationToken::new();

    let run_token = token.clone();
    let run_task = tokio::spawn(async move { transport.run(handler, run_token).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    token.cancel();
    if let Err(err) = run_task.await {
        tracing::warn!(error = %err, "transport task panicked during shutdown");
    }
    timers.shutdown().await;
    Ok(())
}
