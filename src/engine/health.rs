use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::MonitoringConfig;
use crate::notifications::{Notifier, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub candles_processed: u64,
    pub errors: u64,
    pub last_candle_at: Option<DateTime<Utc>>,
    pub stale_seconds: Option<i64>,
    pub rss_bytes: Option<u64>,
    pub uptime_seconds: u64,
}

/// Rolling counters for the candle loop plus a periodic checker that alerts
/// on staleness and error rate.
pub struct HealthMonitor {
    started_at: DateTime<Utc>,
    last_candle_at: RwLock<Option<DateTime<Utc>>>,
    candles_processed: AtomicU64,
    errors: AtomicU64,
    config: MonitoringConfig,
}

impl HealthMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            started_at: Utc::now(),
            last_candle_at: RwLock::new(None),
            candles_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            config,
        }
    }

    pub async fn record_candle(&self) {
        self.candles_processed.fetch_add(1, Ordering::Relaxed);
        *self.last_candle_at.write().await = Some(Utc::now());
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let last_candle_at = *self.last_candle_at.read().await;
        let now = Utc::now();
        let stale_seconds = last_candle_at.map(|t| (now - t).num_seconds());

        let candles = self.candles_processed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);

        let stale = stale_seconds
            .map(|s| s > self.config.staleness_alert_secs as i64)
            .unwrap_or(false);
        // More errors than candles means the loop is mostly failing
        let error_heavy = errors > 0 && errors >= candles.max(1);

        let status = if stale && error_heavy {
            HealthStatus::Unhealthy
        } else if stale || error_heavy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            candles_processed: candles,
            errors,
            last_candle_at,
            stale_seconds,
            rss_bytes: read_rss_bytes(),
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Periodic check; warns and alerts when the stream goes stale.
    pub fn spawn_periodic(self: &Arc<Self>, notifier: Arc<Notifier>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = std::time::Duration::from_secs(monitor.config.health_check_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let snapshot = monitor.snapshot().await;
                debug!(
                    "Health: {:?} candles={} errors={} stale={:?}s",
                    snapshot.status,
                    snapshot.candles_processed,
                    snapshot.errors,
                    snapshot.stale_seconds
                );
                if snapshot.status != HealthStatus::Healthy {
                    warn!("Health degraded: {:?}", snapshot);
                    notifier
                        .send_alert(
                            format!(
                                "Health {:?}: {} candles, {} errors, stale {:?}s",
                                snapshot.status,
                                snapshot.candles_processed,
                                snapshot.errors,
                                snapshot.stale_seconds
                            ),
                            Severity::Warning,
                        )
                        .await;
                }
            }
        })
    }
}

/// Resident set size from procfs, when the platform has one.
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}
