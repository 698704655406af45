//! Process assembly: open the data directory, recover the engine from its
//! WAL, spawn the background loops.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, EngineConfig};
use crate::notify::ChannelNotifier;
use crate::reminder;

const WAL_FILE: &str = "bookings.wal";
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub reminder_interval: Duration,
    /// Compact once this many events accumulate past the last compaction.
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reminder_interval: Duration::from_secs(600),
            compact_threshold: 10_000,
            engine: EngineConfig::default(),
        }
    }
}

/// A fully assembled booking service. Must be opened inside a Tokio runtime:
/// the WAL writer, reminder scheduler and compactor are spawned tasks.
pub struct BookingService {
    engine: Arc<Engine>,
    notifier: Arc<ChannelNotifier>,
    wal_path: PathBuf,
}

impl BookingService {
    pub fn open(data_dir: &Path, config: ServiceConfig) -> io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join(WAL_FILE);

        let notifier = Arc::new(ChannelNotifier::new());
        let engine = Arc::new(Engine::new(&wal_path, notifier.clone(), config.engine)?);
        tracing::info!(
            wal = %wal_path.display(),
            slots = engine.slot_count(),
            clients = engine.client_count(),
            services = engine.service_count(),
            "engine recovered"
        );

        tokio::spawn(reminder::run_reminder_loop(
            engine.clone(),
            config.reminder_interval,
        ));
        tokio::spawn(run_compactor(engine.clone(), config.compact_threshold));

        Ok(Self {
            engine,
            notifier,
            wal_path,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn notifier(&self) -> &Arc<ChannelNotifier> {
        &self.notifier
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }
}

/// Compact the WAL whenever enough appends accumulate since the last pass.
async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let appended = engine.wal_appends_since_compact().await;
        if appended < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => tracing::info!(appended, "WAL compacted"),
            Err(e) => tracing::warn!(error = %e, "WAL compaction failed"),
        }
    }
}
