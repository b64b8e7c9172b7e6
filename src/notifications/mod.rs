use chrono::{DateTime, Duration, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Alert severity. `Critical` bypasses rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

const QUEUE_CAPACITY: usize = 100;
const QUEUE_TTL_HOURS: i64 = 24;
const ALERTS_PER_MINUTE: u32 = 10;

/// Out-of-band webhook notifier. Best effort by contract: a failed or
/// rate-limited alert never propagates an error into the candle path.
/// Failed posts queue (bounded, 24h TTL) and retry after the next success.
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    queue: Mutex<VecDeque<Alert>>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        if webhook_url.is_none() {
            info!("No alert webhook configured, alerts go to the log only");
        }
        Self {
            client: reqwest::Client::new(),
            webhook_url,
            limiter: RateLimiter::direct(Quota::per_minute(
                NonZeroU32::new(ALERTS_PER_MINUTE).expect("nonzero quota"),
            )),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn send_alert(&self, message: impl Into<String>, severity: Severity) {
        let alert = Alert {
            message: message.into(),
            severity,
            created_at: Utc::now(),
        };

        match severity {
            Severity::Critical => error!("ALERT [critical] {}", alert.message),
            Severity::Error => error!("ALERT [error] {}", alert.message),
            Severity::Warning => warn!("ALERT [warning] {}", alert.message),
            Severity::Info => info!("ALERT [info] {}", alert.message),
        }

        if self.webhook_url.is_none() {
            return;
        }

        if severity != Severity::Critical && self.limiter.check().is_err() {
            debug!("Alert rate limited, dropping: {}", alert.message);
            return;
        }

        match self.post(&alert).await {
            Ok(()) => self.drain_queue().await,
            Err(e) => {
                warn!("Webhook post failed ({}), queueing alert", e);
                self.enqueue(alert).await;
            }
        }
    }

    async fn post(&self, alert: &Alert) -> Result<(), reqwest::Error> {
        let url = self.webhook_url.as_deref().expect("checked by caller");
        self.client
            .post(url)
            .json(&serde_json::json!({
                "text": format!("[{}] {}", alert.severity.as_str(), alert.message),
                "severity": alert.severity,
                "timestamp": alert.created_at.to_rfc3339(),
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn enqueue(&self, alert: Alert) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(alert);
    }

    /// Retry everything still within TTL after a successful post.
    async fn drain_queue(&self) {
        let pending = {
            let mut queue = self.queue.lock().await;
            if queue.is_empty() {
                return;
            }
            let cutoff = Utc::now() - Duration::hours(QUEUE_TTL_HOURS);
            queue
                .drain(..)
                .filter(|a| a.created_at > cutoff)
                .collect::<Vec<_>>()
        };

        info!("Retrying {} queued alerts", pending.len());
        for alert in pending {
            if let Err(e) = self.post(&alert).await {
                warn!("Queued alert retry failed ({}), re-queueing", e);
                self.enqueue(alert).await;
                break;
            }
        }
    }

    #[cfg(test)]
    async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}
