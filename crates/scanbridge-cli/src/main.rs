//! `scanbridge` – barcode scanner to browser bridge.
//!
//! This binary wires the whole stack together:
//!
//! 1. Loads `~/.scanbridge/config.toml` (or `$SCANBRIDGE_CONFIG`), applying
//!    `SCANBRIDGE_*` environment overrides.
//! 2. Starts the [`LinkSupervisor`] on the configured device, publishing
//!    every scan through the [`BroadcastHub`].
//! 3. Starts the [`HealthMonitor`] probe loop and the [`GatewayServer`].
//! 4. Intercepts **Ctrl-C** to drain the device link and stop every task.
//!
//! `scanbridge init` writes a default configuration file and exits.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use scanbridge_gateway::GatewayServer;
use scanbridge_hal::{FramedConnection, LinkSupervisor};
use scanbridge_middleware::{BroadcastHub, EventBus, HealthMonitor, SubscriberRegistry};
use scanbridge_types::{BridgeError, LinkSink};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

fn main() -> ExitCode {
    // Installed before the runtime exists; see `telemetry::build_provider`.
    let _tracing = telemetry::init_tracing("scanbridge");

    match std::env::args().nth(1).as_deref() {
        None => {}
        Some("init") => return write_default_config(),
        Some("help" | "--help" | "-h") => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Some(other) => {
            eprintln!("{} unknown command `{other}`", "error:".red().bold());
            print_usage();
            return ExitCode::FAILURE;
        }
    }

    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config::config_path().display(), "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => {
            info!("scanbridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "scanbridge failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), BridgeError> {
    let link_config = cfg.link_config()?;
    let listen_addr = cfg.listen_addr()?;
    info!(
        device = %link_config.device,
        baud_rate = link_config.baud_rate,
        addr = %listen_addr,
        "starting scanbridge"
    );

    let shutdown = CancellationToken::new();
    install_ctrlc_handler(shutdown.clone());

    let registry = Arc::new(SubscriberRegistry::new(cfg.send_buffer));
    let hub: Arc<dyn LinkSink> = Arc::new(BroadcastHub::new(Arc::clone(&registry)));
    // The standalone binary has no domain producer, so the SSE routes only
    // send their greeting here. Embedders publish on a clone of this bus.
    let bus = EventBus::new();

    let supervisor = LinkSupervisor::new(
        FramedConnection::new(&link_config),
        link_config.backoff.clone(),
        hub,
    )
    .with_cancellation(shutdown.clone());

    let gateway = GatewayServer::new(Arc::clone(&registry), bus, supervisor.watch_state())
        .with_bind_address(listen_addr.ip())
        .with_port(listen_addr.port())
        .with_cancellation(shutdown.clone());
    // Bind before touching the device so a taken port fails fast.
    let listener = gateway.bind().await?;

    let monitor = HealthMonitor::new(Arc::clone(&registry), cfg.health_config())
        .with_cancellation(shutdown.clone())
        .spawn();
    let link = tokio::spawn(supervisor.run());

    let served = gateway.serve(listener).await;
    shutdown.cancel();

    if let Err(e) = link.await {
        warn!(error = %e, "link supervisor task failed");
    }
    if let Err(e) = monitor.await {
        warn!(error = %e, "health monitor task failed");
    }
    served
}

fn install_ctrlc_handler(shutdown: CancellationToken) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – closing the scanner link …".yellow().bold());
        shutdown.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; shutdown on Ctrl-C will not be graceful");
    }
}

fn write_default_config() -> ExitCode {
    match config::save(&Config::default()) {
        Ok(path) => {
            println!("  {} {}", "Wrote default configuration to".green(), path.display().to_string().bold());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "scanbridge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Scanner link → WebSocket / SSE bridge");
    println!();
}

fn print_usage() {
    println!("{}", "Usage:".bold());
    println!("  scanbridge          run the bridge");
    println!("  scanbridge init     write a default config to {}", config::config_path().display());
    println!("  scanbridge help     show this message");
}
