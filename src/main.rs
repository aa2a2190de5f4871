//! device-mcp: MCP server for small devices
//!
//! Serves built-in tools, resources and prompts over the console, HTTP or a
//! BLE GATT link.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use device_mcp::capabilities;
use device_mcp::config::{self, Config, TransportKind};
use device_mcp::mcp::{http, ConsoleTransport};
use device_mcp::shutdown::{self, Shutdown};

/// MCP server for small devices.
///
/// Exposes tools, resources and prompts to AI assistants over stdin/stdout,
/// an HTTP endpoint or as a BLE GATT peripheral.
#[derive(Parser, Debug)]
#[command(name = "device-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Transport to serve on (overrides the configuration file)
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
///
/// Logs go to stderr; stdout carries the console transport.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Serves the selected transport until it ends or a termination signal
/// arrives.
async fn serve(cfg: Config, transport: TransportKind) -> Result<(), Box<dyn Error>> {
    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = shutdown::trigger_on_os_signal(shutdown).await {
                error!(error = %e, "Failed to install signal handlers");
            }
        }
    });

    let core = capabilities::server_core(cfg.server_info());

    match transport {
        TransportKind::Stdio => {
            info!("Serving on stdin/stdout, waiting for client messages...");
            ConsoleTransport::stdio().run(&core, signal).await?;
        }
        TransportKind::Http => {
            let listener = tokio::net::TcpListener::bind(cfg.http.socket_addr()?).await?;
            http::serve(listener, std::sync::Arc::new(core), signal).await?;
        }
        TransportKind::Ble => serve_ble(&cfg, core, signal).await?,
    }

    Ok(())
}

#[cfg(feature = "bluez")]
async fn serve_ble(
    cfg: &Config,
    core: device_mcp::mcp::ServerCore,
    signal: shutdown::ShutdownSignal,
) -> Result<(), Box<dyn Error>> {
    use device_mcp::ble::bluez::BluezPeripheral;
    use device_mcp::ble::BleServer;

    let settings = cfg.ble.to_settings()?;
    let peripheral = BluezPeripheral::new().await?;
    BleServer::new(peripheral, std::sync::Arc::new(core), settings)
        .run(signal)
        .await?;
    Ok(())
}

#[cfg(not(feature = "bluez"))]
async fn serve_ble(
    _cfg: &Config,
    _core: device_mcp::mcp::ServerCore,
    _signal: shutdown::ShutdownSignal,
) -> Result<(), Box<dyn Error>> {
    Err("BLE transport requires building with the `bluez` feature".into())
}

/// Entry point for the device-mcp server.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nConfig read from: {}", default_path.display());
                    eprintln!("See config/example-config.json for the format");
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    // Display GPL license notice (required by GPLv3 Section 5d)
    eprintln!(
        "device-mcp {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!();

    let transport = args.transport.unwrap_or(cfg.transport);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?transport,
        "Starting device-mcp server"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cfg, transport)) {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
