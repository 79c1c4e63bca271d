use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use netpulse::api::{self, StatusBoard};
use netpulse::config::{parse_duration, MonitorConfig};
use netpulse::engine::{CheckTree, Monitor};
use netpulse::lifecycle::Lifecycle;
use netpulse::notify::{LogSink, NotificationHub, WebhookSink};

#[derive(Parser)]
#[command(name = "netpulse", about = "Edge-triggered TLS/SMTP health checker")]
struct Cli {
    /// Check definitions (YAML, or JSON by extension).
    #[arg(long, default_value = "checks.yaml")]
    config: PathBuf,

    /// Interval to run checks in, e.g. "10m" or "1h30m". Overrides the config file.
    #[arg(long)]
    interval: Option<String>,

    /// Status server listen address. Overrides the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = MonitorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let interval = match &cli.interval {
        Some(raw) => parse_duration(raw),
        None => config.interval(),
    }
    .context("Cannot parse interval")?;
    let grace = config.shutdown_grace().context("Cannot parse shutdown grace")?;
    let listen = cli.listen.clone().unwrap_or_else(|| config.listen.clone());

    let tree = CheckTree::build(&config.checks).context("Invalid check definitions")?;
    info!(checks = tree.count(), "Check tree loaded");

    let board = Arc::new(StatusBoard::new());
    let mut hub = NotificationHub::new();
    hub.register(Arc::new(LogSink));
    hub.register(board.clone());
    if let Some(url) = &config.webhook_url {
        hub.register(Arc::new(WebhookSink::new(url.as_str())?));
        info!("Webhook notifications enabled");
    }

    info!(sinks = hub.len(), "Notification hub ready");

    let stop = shutdown_signal()?;
    let mut lifecycle = Lifecycle::new();
    api::start_server(&listen, board, grace, &mut lifecycle).await?;

    let mut monitor = Monitor::new(tree, hub, interval);
    let passes = monitor.run(stop).await;

    lifecycle.shutdown().await;
    info!(passes, "Shutdown complete.");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let json = std::env::var("RUST_LOG_FORMAT").is_ok_and(|v| v == "json");
    let log_layer = if json {
        fmt::layer().json().with_filter(env_filter).boxed()
    } else {
        fmt::layer().with_ansi(true).with_filter(env_filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

/// Installs the interrupt/terminate handlers now and resolves on the first
/// signal.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("Cannot install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Cannot install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, shutting down."),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down."),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down.");
        }
    })
}
