//! balance-bridge: MT-SICS laboratory balance bridge
//!
//! Commands:
//! - `serve`: run the bridge daemon with its HTTP/NDJSON surface
//! - `read`: connect once, print a single reading as JSON and exit
//! - `watch`: follow a running daemon's stream through the stability window
//! - `simulate`: run a simulated balance on a TCP port for bench testing
//!
//! ```bash
//! BALANCE_BRIDGE_INSTRUMENT__HOST=192.168.1.40 balance-bridge serve
//! balance-bridge watch --url http://127.0.0.1:8765
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod telemetry;
mod watch;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bridge_core::config::DEFAULT_CONFIG_PATH;
use bridge_core::{BridgeConfig, ConnectivityState};
use bridge_driver_mtsics::{Bridge, SimulatedBalance};
use bridge_server::{start_http_server, ServerState, StreamEvent};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;

use crate::telemetry::{OutputFormat, TracingConfig};
use crate::watch::Watcher;

#[derive(Parser)]
#[command(name = "balance-bridge")]
#[command(about = "Bridge an MT-SICS laboratory balance to HTTP/NDJSON clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that talk to the instrument directly.
#[derive(Args, Debug, Clone)]
struct InstrumentArgs {
    /// Configuration file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Balance host, overriding the configuration
    #[arg(long)]
    host: Option<String>,

    /// Balance TCP port, overriding the configuration
    #[arg(long)]
    port: Option<u16>,
}

impl InstrumentArgs {
    fn load(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::load_from(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(host) = &self.host {
            config.instrument.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.instrument.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon
    Serve {
        #[command(flatten)]
        instrument: InstrumentArgs,

        /// HTTP listen address, overriding the configuration
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Take a single reading and print it as JSON
    Read {
        #[command(flatten)]
        instrument: InstrumentArgs,
    },

    /// Follow a running bridge's weight stream
    Watch {
        /// Base URL of the bridge
        #[arg(long, default_value = "http://127.0.0.1:8765")]
        url: String,

        /// Number of readings in the stability window
        #[arg(long, default_value_t = bridge_core::stability::DEFAULT_WINDOW)]
        window: usize,

        /// Maximum spread inside the window to call it stable
        #[arg(long, default_value_t = bridge_core::stability::DEFAULT_TOLERANCE)]
        tolerance: f64,

        /// Stop after this many readings
        #[arg(long)]
        count: Option<usize>,
    },

    /// Serve a simulated balance over TCP
    Simulate {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8001")]
        bind: SocketAddr,

        /// Initial gross weight
        #[arg(long, default_value_t = 0.0)]
        weight: f64,

        /// Weight unit
        #[arg(long, default_value = "g")]
        unit: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { instrument, bind } => serve(instrument, bind).await,
        Commands::Read { instrument } => read_once(instrument).await,
        Commands::Watch {
            url,
            window,
            tolerance,
            count,
        } => {
            init_cli_tracing()?;
            if window == 0 || !tolerance.is_finite() || tolerance < 0.0 {
                bail!("window must be at least 1 and tolerance a non-negative number");
            }
            let mut watcher = Watcher::new(window, tolerance);
            watch::run(&url, &mut watcher, count).await
        }
        Commands::Simulate { bind, weight, unit } => simulate(bind, weight, unit).await,
    }
}

/// CLI tools log warnings only, compactly, to keep stdout readable.
fn init_cli_tracing() -> Result<()> {
    let config = TracingConfig::default()
        .with_format(OutputFormat::Compact)
        .with_filter("warn");
    telemetry::init(&config).map_err(anyhow::Error::msg)
}

async fn serve(args: InstrumentArgs, bind: Option<SocketAddr>) -> Result<()> {
    let mut config = args.load()?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let tracing_config =
        TracingConfig::from_logging_config(&config.logging).map_err(anyhow::Error::msg)?;
    telemetry::init(&tracing_config).map_err(anyhow::Error::msg)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        instrument = ?config.instrument.endpoint().map(|e| e.to_string()),
        bind = %config.server.bind,
        "starting balance bridge"
    );

    let bridge = Arc::new(Bridge::start(&config));
    let state = ServerState::new(Arc::clone(&bridge), &config.stream);
    let server = start_http_server(config.server.bind, state)
        .await
        .with_context(|| format!("binding HTTP server to {}", config.server.bind))?;

    println!("balance bridge listening on http://{}", server.local_addr());
    println!("press Ctrl+C to stop");

    signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("shutdown requested");
    server.shutdown().await;
    bridge.shutdown().await;
    tracing::info!("balance bridge stopped");
    Ok(())
}

async fn read_once(args: InstrumentArgs) -> Result<()> {
    init_cli_tracing()?;
    let config = args.load()?;

    let bridge = Bridge::start(&config);
    if bridge.is_disabled() {
        bail!("no balance host configured (set instrument.host or pass --host)");
    }

    let state = bridge
        .wait_for_connection(config.instrument.connect_timeout)
        .await;
    let result = if state == ConnectivityState::Connected {
        bridge.read_weight().await.map_err(anyhow::Error::from)
    } else {
        Err(anyhow::anyhow!(
            "could not connect to balance within {:?}",
            config.instrument.connect_timeout
        ))
    };
    bridge.shutdown().await;

    let reading = result?;
    println!("{}", serde_json::to_string(&StreamEvent::from(reading))?);
    Ok(())
}

async fn simulate(bind: SocketAddr, weight: f64, unit: String) -> Result<()> {
    telemetry::init(&TracingConfig::default()).map_err(anyhow::Error::msg)?;

    let balance = SimulatedBalance::new();
    balance.set_unit(unit);
    balance.set_weight(weight, true);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding simulator to {}", bind))?;
    println!("simulated balance listening on {}", listener.local_addr()?);

    tokio::select! {
        result = balance.listen(listener) => result.context("simulator stopped")?,
        result = signal::ctrl_c() => result.context("waiting for shutdown signal")?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve_overrides() {
        let cli = Cli::try_parse_from([
            "balance-bridge",
            "serve",
            "--host",
            "10.0.0.7",
            "--port",
            "4305",
            "--bind",
            "0.0.0.0:9000",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { instrument, bind } => {
                assert_eq!(instrument.host.as_deref(), Some("10.0.0.7"));
                assert_eq!(instrument.port, Some(4305));
                assert_eq!(bind, Some("0.0.0.0:9000".parse().unwrap()));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn watch_defaults_match_detector_defaults() {
        let cli = Cli::try_parse_from(["balance-bridge", "watch"]).unwrap();
        match cli.command {
            Commands::Watch {
                url,
                window,
                tolerance,
                count,
            } => {
                assert_eq!(url, "http://127.0.0.1:8765");
                assert_eq!(window, 5);
                assert_eq!(tolerance, 0.5);
                assert_eq!(count, None);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn host_override_enables_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "[instrument]\nport = 8001\n").unwrap();
        let args = InstrumentArgs {
            config: path,
            host: Some("balance.lab".to_string()),
            port: None,
        };
        let config = args.load().unwrap();
        assert_eq!(
            config.instrument.endpoint().map(|e| e.to_string()),
            Some("balance.lab:8001".to_string())
        );
    }
}
