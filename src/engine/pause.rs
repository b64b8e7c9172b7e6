use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StrategyConfig;
use crate::error::{BotError, BotResult};
use crate::exchange::ExchangeClient;
use crate::notifications::{Notifier, Severity};
use crate::persistence::PersistenceStore;
use crate::types::{BotEventType, PauseEntry, PauseReason};

/// Pause state machine. The flag is the single cell every task may read;
/// writes go through `pause`/`resume` only, which keep the persisted
/// `pause_states` row and the event log in step.
pub struct PauseController {
    paused: AtomicBool,
    bot_id: String,
    store: Arc<dyn PersistenceStore>,
    exchange: Arc<dyn ExchangeClient>,
    notifier: Arc<Notifier>,
}

impl PauseController {
    pub fn new(
        bot_id: impl Into<String>,
        store: Arc<dyn PersistenceStore>,
        exchange: Arc<dyn ExchangeClient>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            paused: AtomicBool::new(false),
            bot_id: bot_id.into(),
            store,
            exchange,
            notifier,
        }
    }

    /// Adopt a pause that survived a restart.
    pub async fn init_from_store(&self) -> BotResult<()> {
        if let Some(entry) = self.store.active_pause().await? {
            warn!(
                "Resuming with an active pause from {} ({}): {}",
                entry.paused_at, entry.reason, entry.message
            );
            self.paused.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Idempotent: pausing while paused updates the reason on the active row.
    pub async fn pause(
        &self,
        reason: PauseReason,
        message: &str,
        metadata: serde_json::Value,
    ) -> BotResult<PauseEntry> {
        let already = self.paused.swap(true, Ordering::AcqRel);
        let entry = self.store.pause_upsert(reason, message, &metadata).await?;

        self.store
            .append_event(
                &self.bot_id,
                BotEventType::StrategyPaused,
                &serde_json::json!({
                    "reason": reason.as_str(),
                    "message": message,
                    "metadata": metadata,
                    "already_paused": already,
                }),
            )
            .await?;

        warn!("Strategy paused ({}): {}", reason, message);
        self.notifier
            .send_alert(
                format!("Trading paused ({}): {}", reason, message),
                Severity::Critical,
            )
            .await;

        Ok(entry)
    }

    /// Leave the paused state. Unless `forced`, connectivity, balance and
    /// config are re-verified first; any failed check keeps the pause.
    pub async fn resume(
        &self,
        config: &StrategyConfig,
        required_capital: rust_decimal::Decimal,
        forced: bool,
    ) -> BotResult<Option<PauseEntry>> {
        if !self.is_paused() {
            return Ok(None);
        }

        let mut checks = serde_json::json!({ "forced": forced });
        if !forced {
            self.exchange.ping().await.map_err(|e| {
                BotError::Config(format!("resume check failed: exchange unreachable: {}", e))
            })?;
            self.store.health_check().await.map_err(|e| {
                BotError::Config(format!("resume check failed: store unreachable: {}", e))
            })?;
            if let Err(errors) = config.validate() {
                return Err(BotError::Config(format!(
                    "resume check failed: invalid config: {}",
                    errors.join("; ")
                )));
            }
            let usdt = self.exchange.get_balance("USDT").await?;
            if usdt.free < required_capital {
                return Err(BotError::Config(format!(
                    "resume check failed: USDT balance {} below tracked capital {}",
                    usdt.free, required_capital
                )));
            }
            checks["usdt_free"] = serde_json::json!(usdt.free.to_string());
        }

        let entry = self.store.pause_resolve(&checks).await?;
        self.paused.store(false, Ordering::Release);

        self.store
            .append_event(
                &self.bot_id,
                BotEventType::StrategyResumed,
                &checks,
            )
            .await?;

        info!("Strategy resumed (forced: {})", forced);
        self.notifier
            .send_alert("Trading resumed", Severity::Info)
            .await;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AssetBalance, MockExchangeClient};
    use crate::persistence::MockPersistenceStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn entry(reason: PauseReason) -> PauseEntry {
        PauseEntry {
            id: 1,
            status: "paused".to_string(),
            reason,
            message: "test".to_string(),
            metadata: serde_json::json!({}),
            paused_at: Utc::now(),
            resumed_at: None,
            resume_metadata: None,
        }
    }

    fn controller(
        store: MockPersistenceStore,
        exchange: MockExchangeClient,
    ) -> PauseController {
        PauseController::new(
            "bot-1",
            Arc::new(store),
            Arc::new(exchange),
            Arc::new(Notifier::new(None)),
        )
    }

    #[tokio::test]
    async fn test_pause_sets_flag_and_persists() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_pause_upsert()
            .times(1)
            .returning(|reason, _, _| Ok(entry(reason)));
        store.expect_append_event().returning(|_, _, _| Ok(1));

        let ctl = controller(store, MockExchangeClient::new());
        assert!(!ctl.is_paused());
        ctl.pause(PauseReason::DriftDetected, "drift", serde_json::json!({}))
            .await
            .unwrap();
        assert!(ctl.is_paused());
    }

    #[tokio::test]
    async fn test_pause_twice_updates_reason() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_pause_upsert()
            .times(2)
            .returning(|reason, _, _| Ok(entry(reason)));
        store.expect_append_event().returning(|_, _, _| Ok(1));

        let ctl = controller(store, MockExchangeClient::new());
        let first = ctl
            .pause(PauseReason::DriftDetected, "drift", serde_json::json!({}))
            .await
            .unwrap();
        let second = ctl
            .pause(PauseReason::BalanceMismatch, "btc short", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(ctl.is_paused());
    }

    #[tokio::test]
    async fn test_resume_runs_checks() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_pause_upsert()
            .returning(|reason, _, _| Ok(entry(reason)));
        store.expect_append_event().returning(|_, _, _| Ok(1));
        store.expect_health_check().returning(|| Ok(()));
        store
            .expect_pause_resolve()
            .times(1)
            .returning(|_| Ok(Some(entry(PauseReason::Manual))));

        let mut exchange = MockExchangeClient::new();
        exchange.expect_ping().returning(|| Ok(()));
        exchange.expect_get_balance().returning(|_| {
            Ok(AssetBalance {
                free: dec!(1000),
                locked: dec!(0),
            })
        });

        let ctl = controller(store, exchange);
        ctl.pause(PauseReason::Manual, "operator", serde_json::json!({}))
            .await
            .unwrap();
        ctl.resume(&StrategyConfig::default(), dec!(500), false)
            .await
            .unwrap();
        assert!(!ctl.is_paused());
    }

    #[tokio::test]
    async fn test_resume_rejected_on_low_balance() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_pause_upsert()
            .returning(|reason, _, _| Ok(entry(reason)));
        store.expect_append_event().returning(|_, _, _| Ok(1));
        store.expect_health_check().returning(|| Ok(()));
        store.expect_pause_resolve().times(0);

        let mut exchange = MockExchangeClient::new();
        exchange.expect_ping().returning(|| Ok(()));
        exchange.expect_get_balance().returning(|_| {
            Ok(AssetBalance {
                free: dec!(100),
                locked: dec!(0),
            })
        });

        let ctl = controller(store, exchange);
        ctl.pause(PauseReason::Manual, "operator", serde_json::json!({}))
            .await
            .unwrap();
        let err = ctl
            .resume(&StrategyConfig::default(), dec!(500), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Config(_)));
        assert!(ctl.is_paused());
    }

    #[tokio::test]
    async fn test_forced_resume_skips_checks() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_pause_upsert()
            .returning(|reason, _, _| Ok(entry(reason)));
        store.expect_append_event().returning(|_, _, _| Ok(1));
        store
            .expect_pause_resolve()
            .times(1)
            .returning(|_| Ok(Some(entry(PauseReason::Manual))));

        // No ping/balance expectations: forced resume must not call them
        let ctl = controller(store, MockExchangeClient::new());
        ctl.pause(PauseReason::CriticalError, "boom", serde_json::json!({}))
            .await
            .unwrap();
        ctl.resume(&StrategyConfig::default(), dec!(500), true)
            .await
            .unwrap();
        assert!(!ctl.is_paused());
    }

    #[tokio::test]
    async fn test_init_from_store_adopts_pause() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_active_pause()
            .returning(|| Ok(Some(entry(PauseReason::DriftDetected))));

        let ctl = controller(store, MockExchangeClient::new());
        ctl.init_from_store().await.unwrap();
        assert!(ctl.is_paused());
    }
}
