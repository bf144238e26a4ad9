use crate::db::Storage;
use crate::errors::StorageError;
use crate::model::DeviceStatistics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest per-device statistics as published to readers.
#[derive(Debug, Clone, Serialize)]
pub struct RollupSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub total_records: i64,
    pub device_count: usize,
    pub devices: Vec<DeviceStatistics>,
}

impl RollupSnapshot {
    pub fn empty() -> Self {
        Self {
            generated_at: None,
            total_records: 0,
            device_count: 0,
            devices: Vec::new(),
        }
    }
}

pub fn channel() -> (watch::Sender<Arc<RollupSnapshot>>, watch::Receiver<Arc<RollupSnapshot>>) {
    watch::channel(Arc::new(RollupSnapshot::empty()))
}

/// Recomputes device statistics every `period` until `cancel` fires.
/// A failed refresh keeps the previous snapshot.
pub async fn run_rollup_refresher(
    storage: Storage,
    period: Duration,
    tx: watch::Sender<Arc<RollupSnapshot>>,
    cancel: CancellationToken,
) {
    info!("Starting rollup refresher with period={:?}", period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => match refresh(&storage).await {
                Ok(snapshot) => {
                    debug!(
                        "Rollup refreshed: {} records over {} devices",
                        snapshot.total_records, snapshot.device_count
                    );
                    tx.send_replace(Arc::new(snapshot));
                }
                Err(e) => warn!("Rollup refresh failed, keeping previous snapshot: {}", e),
            },
        }
    }

    info!("Rollup refresher stopped");
}

async fn refresh(storage: &Storage) -> Result<RollupSnapshot, StorageError> {
    let devices = storage.device_statistics().await?;
    let total_records = storage.reading_count().await?;

    Ok(RollupSnapshot {
        generated_at: Some(Utc::now()),
        total_records,
        device_count: devices.len(),
        devices,
    })
}
