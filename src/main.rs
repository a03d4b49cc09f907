use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vision_link::config::ConfigStore;
use vision_link::events::{EventBus, SystemEvent};
use vision_link::role::Role;
use vision_link::session;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vision-link command line arguments
#[derive(Parser, Debug)]
#[command(name = "vision-link")]
#[command(version, about = "Peer-to-peer camera link with live object detection", long_about = None)]
struct CliArgs {
    /// Which end of the link this node is
    #[arg(short = 'r', long, value_enum)]
    role: Role,

    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "vision-link.toml")]
    config: PathBuf,

    /// Relay server base URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    server: Option<String>,

    /// Camera device path (overrides config)
    #[arg(short = 'd', long, value_name = "PATH")]
    device: Option<String>,

    /// Start in detecting mode (viewer)
    #[arg(long)]
    detect: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting vision-link v{} as {}", env!("CARGO_PKG_VERSION"), args.role);

    let config_store = ConfigStore::load(&args.config).await?;
    tracing::info!("Configuration: {}", args.config.display());

    // CLI overrides apply to this run only
    config_store.override_with(|config| {
        if let Some(server) = &args.server {
            config.server.base_url = server.clone();
        }
        if let Some(device) = &args.device {
            config.camera.device = Some(device.clone());
        }
        if args.detect {
            config.detection.enabled = true;
        }
    });
    let config = config_store.get();

    let events = Arc::new(EventBus::new());
    spawn_event_logger(events.subscribe());

    let cancel = CancellationToken::new();
    let mut session = session::start(args.role, &config, events.clone(), cancel.clone()).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutdown signal received");
        }
        state = session.finished() => {
            tracing::info!("Session ended: {}", state);
        }
    }

    let summary = session.shutdown().await;
    if summary.count_frames > 0 {
        tracing::info!("Metrics: {}", serde_json::to_string(&summary)?);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log every session event; stands in for an on-screen UI
fn spawn_event_logger(mut rx: broadcast::Receiver<SystemEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SystemEvent::OverlayUpdated { .. } | SystemEvent::DetectionsUpdated { .. }) => {}
                Ok(SystemEvent::Error { module, message }) => {
                    tracing::error!("[{}] {}", module, message);
                }
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!("event: {}", json),
                    Err(_) => tracing::info!("event: {}", event.event_name()),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vision_link=error,webrtc=error",
        LogLevel::Warn => "vision_link=warn,webrtc=warn",
        LogLevel::Info => "vision_link=info,webrtc=warn",
        LogLevel::Verbose => "vision_link=debug,webrtc=warn",
        LogLevel::Debug => "vision_link=debug,webrtc=info",
        LogLevel::Trace => "vision_link=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
