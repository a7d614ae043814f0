//! HV rack server.
//!
//! ```bash
//! hv-rack-server --config config/hv_rack.toml            # serve (default)
//! hv-rack-server --simulated --log-level debug serve      # no hardware
//! hv-rack-server calibrate --input calibration/points.csv # fit scaling coefficients
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hv_rack::calibration;
use hv_rack::config::{BackendMode, Settings, DEFAULT_CONFIG_PATH};
use hv_rack::hardware::build_backend;
use hv_rack::logging;
use hv_rack::storage::{DailyTsvWriter, MeasurementSink, SyncLoop};
use hv_rack::transport::{TcpServer, WsServer};
use hv_rack::{Coordinator, TelemetryHub};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "hv-rack-server", version, about = "HV power-supply rack server")]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Force the simulated backend
    #[arg(long)]
    simulated: bool,

    /// Override application.log_level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the server (default)
    Serve,
    /// Fit scaling coefficients from a `native,measured` CSV and print them as TOML
    Calibrate {
        /// CSV file with recorded calibration points
        #[arg(long, short)]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        // Calibration works offline and never reads the server configuration.
        Some(Cmd::Calibrate { ref input }) => calibrate(input),
        Some(Cmd::Serve) | None => {
            let settings = serve_settings(&cli)?;
            logging::init(&settings.application).context("Failed to initialize logging")?;
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build Tokio runtime")?
                .block_on(serve(settings))
        }
    }
}

/// Loads settings, applies command-line overrides, then validates the result.
fn serve_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::extract_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.simulated {
        settings.hardware.mode = BackendMode::Simulated;
    }
    if let Some(level) = &cli.log_level {
        settings.application.log_level = level.clone();
    }
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

fn calibrate(input: &std::path::Path) -> Result<()> {
    let points = calibration::load_points(input)
        .with_context(|| format!("Failed to read calibration points from {}", input.display()))?;
    let coefficients = calibration::fit(&points).context("Calibration fit failed")?;
    print!("{}", calibration::to_toml_snippet(&coefficients));
    Ok(())
}

async fn serve(settings: Settings) -> Result<()> {
    info!(
        name = %settings.application.name,
        mode = ?settings.hardware.mode,
        "Starting HV rack server"
    );

    let backend = build_backend(&settings.hardware)
        .await
        .context("Failed to open hardware")?;

    let sink: Option<Box<dyn MeasurementSink>> = if settings.storage.enabled {
        let writer = DailyTsvWriter::new(&settings.storage.root, &settings.storage.control_name)
            .context("Failed to prepare measurement storage")?;
        Some(Box::new(writer))
    } else {
        None
    };

    let hub = TelemetryHub::new(settings.hub.subscriber_queue_capacity);
    let coordinator = Coordinator::new(settings.coordinator.clone(), backend, hub, sink);
    coordinator
        .start()
        .await
        .context("Hardware initialization failed")?;

    let shutdown = CancellationToken::new();
    let mut services = Vec::new();

    if let Some(sync) = SyncLoop::from_config(&settings.storage) {
        services.push(tokio::spawn(sync.run(shutdown.child_token())));
    }

    let tcp = match TcpServer::bind(&settings.server.tcp_addr(), coordinator.handle()).await {
        Ok(server) => server,
        Err(e) => {
            coordinator.stop().await;
            return Err(e).context("Failed to bind TCP interface");
        }
    };
    services.push(tokio::spawn(tcp.run(shutdown.child_token())));

    if settings.server.ws_enabled {
        match WsServer::bind(&settings.server.ws_addr(), coordinator.handle()).await {
            Ok(ws) => services.push(tokio::spawn(ws.run(shutdown.child_token()))),
            Err(e) => error!(error = %e, "WebSocket interface disabled"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
    info!("Shutdown requested");

    shutdown.cancel();
    coordinator.stop().await;
    for service in services {
        let _ = service.await;
    }
    info!("HV rack server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broken_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("rack.toml");
        std::fs::write(&path, "[application]\nlog_level = \"verbose\"\n").unwrap();
        path
    }

    #[test]
    fn test_calibrate_ignores_server_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = broken_config(dir.path());
        let points = dir.path().join("points.csv");
        std::fs::write(&points, "native,measured\n0.0,1.0\n1.0,3.0\n2.0,5.0\n").unwrap();

        let cli = Cli::parse_from([
            "hv-rack-server",
            "--config",
            config.to_str().unwrap(),
            "calibrate",
            "--input",
            points.to_str().unwrap(),
        ]);
        run(cli).unwrap();
    }

    #[test]
    fn test_serve_settings_validate_after_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config = broken_config(dir.path());
        let config = config.to_str().unwrap();

        let cli = Cli::parse_from(["hv-rack-server", "--config", config]);
        let err = serve_settings(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid log_level"));

        // A valid override rescues a bad file value.
        let cli = Cli::parse_from([
            "hv-rack-server",
            "--config",
            config,
            "--simulated",
            "--log-level",
            "debug",
        ]);
        let settings = serve_settings(&cli).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.hardware.mode, BackendMode::Simulated);
    }
}
