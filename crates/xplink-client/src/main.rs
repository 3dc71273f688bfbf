//! XPLink client — entry point.
//!
//! This binary keeps a local variable store synchronized with a running
//! flight simulator: it discovers the simulator on the LAN, downloads its
//! dataref/command catalogs, opens the streaming connection, and mirrors
//! every subscribed value into the registry until stopped with Ctrl+C.
//!
//! On its own the binary is mostly a harness around
//! [`xplink_client::SyncService`]; pass `--watch` paths to subscribe a
//! collection and log every value change, which is the quickest way to
//! verify a simulator link end to end.
//!
//! # Usage
//!
//! ```text
//! xplink-client [OPTIONS]
//!
//! Options:
//!   --config <FILE>      Configuration file [default: platform config dir]
//!   --host <HOST>        Simulator host; skips beacon discovery
//!   --port <PORT>        Simulator web API port [default: 8086]
//!   --log-level <LEVEL>  Log filter when RUST_LOG is unset
//!   --watch <PATH>       Dataref to watch and log (repeatable)
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present; `RUST_LOG` always wins
//! over `--log-level`.
//!
//! | Variable           | Description                          |
//! |--------------------|--------------------------------------|
//! | `XPLINK_CONFIG`    | Configuration file path              |
//! | `XPLINK_SIM_HOST`  | Simulator host (disables discovery)  |
//! | `XPLINK_SIM_PORT`  | Simulator web API port               |
//! | `RUST_LOG`         | Tracing filter, e.g. `debug`         |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xplink_client::infrastructure::storage::config::{load_config, load_config_from, AppConfig};
use xplink_client::SyncService;
use xplink_core::{Value, Variable, VariableListener};

/// Name of the collection that carries `--watch` subscriptions.
const WATCH_COLLECTION: &str = "cli-watch";

// ── CLI argument definitions ──────────────────────────────────────────────────

/// XPLink simulator synchronization client.
#[derive(Debug, Parser)]
#[command(
    name = "xplink-client",
    about = "Synchronizes a local variable store with a flight simulator",
    version
)]
struct Cli {
    /// Configuration file to load instead of the platform default location.
    #[arg(long, value_name = "FILE", env = "XPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Simulator hostname or IP. Setting this skips beacon discovery and
    /// connects directly.
    #[arg(long, env = "XPLINK_SIM_HOST")]
    host: Option<String>,

    /// Simulator web API port. Only meaningful together with `--host`;
    /// discovered simulators announce their own port.
    #[arg(long, env = "XPLINK_SIM_PORT")]
    port: Option<u16>,

    /// Log filter used when `RUST_LOG` is unset, e.g. `debug` or
    /// `xplink_client=trace`.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Dataref path to watch; every value change is logged. Repeatable.
    #[arg(long, value_name = "PATH")]
    watch: Vec<String>,
}

impl Cli {
    /// Applies the CLI overrides on top of the loaded configuration.
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.simulator.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.simulator.port = port;
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

// ── Watch logging ─────────────────────────────────────────────────────────────

/// Listener behind `--watch`: logs every change of the watched variables.
struct WatchLogger;

impl VariableListener for WatchLogger {
    fn variable_changed(&self, variable: &Variable) {
        match variable.value() {
            Some(Value::Float(f)) => info!("{} = {f:.4}", variable.name()),
            Some(value) => info!("{} = {value}", variable.name()),
            None => info!("{} is unset", variable.name()),
        }
    }

    fn listener_name(&self) -> &str {
        "watch-logger"
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => load_config().context("loading configuration")?,
    };
    cli.apply_to(&mut config);

    // `RUST_LOG` wins; the configured level is only the fallback.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    info!(
        "XPLink client starting — simulator {}",
        match &config.simulator.host {
            Some(host) => format!("{host}:{} (fixed)", config.simulator.port),
            None => "via beacon discovery".to_string(),
        }
    );

    let service = SyncService::new(config).context("creating sync service")?;
    service.start();

    // Listeners are held weakly by their variables, so the logger must stay
    // alive for as long as the watch runs.
    let watch_logger: Arc<dyn VariableListener> = Arc::new(WatchLogger);
    if !cli.watch.is_empty() {
        for path in &cli.watch {
            match service.get_variable(path) {
                Ok(variable) => variable.add_listener(&watch_logger),
                Err(e) => warn!("cannot watch {path}: {e}"),
            }
        }
        let paths: Vec<&str> = cli.watch.iter().map(String::as_str).collect();
        service.request_collection(WATCH_COLLECTION, &paths).await;
        info!("watching {} path(s)", cli.watch.len());
    }

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl+C")?;
    info!("received Ctrl+C — shutting down");

    service.stop().await;
    info!("XPLink client stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
