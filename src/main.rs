use std::path::PathBuf;
use std::time::Duration;

use slotbook::engine::EngineConfig;
use slotbook::observability;
use slotbook::service::{BookingService, ServiceConfig};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    observability::init(env_parse::<u16>("SLOTBOOK_METRICS_PORT"));

    let data_dir: PathBuf = std::env::var("SLOTBOOK_DATA_DIR")
        .unwrap_or_else(|_| "./slotbook-data".to_string())
        .into();

    let mut config = ServiceConfig::default();
    if let Some(mins) = env_parse::<u64>("SLOTBOOK_REMINDER_INTERVAL_MINS") {
        config.reminder_interval = Duration::from_secs(mins * 60);
    }
    if let Some(threshold) = env_parse("SLOTBOOK_COMPACT_THRESHOLD") {
        config.compact_threshold = threshold;
    }
    if let Some(limit) = env_parse("SLOTBOOK_MONTHLY_ACTION_LIMIT") {
        config.engine = EngineConfig {
            monthly_action_limit: limit,
            ..EngineConfig::default()
        };
    }

    let service = BookingService::open(&data_dir, config)?;
    tracing::info!(data_dir = %data_dir.display(), "slotbook up");

    shutdown_signal().await;
    tracing::info!("shutting down");
    let _ = service.engine().compact_wal().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
