use std::sync::Arc;
use tracing::{error, info, warn};

use super::PersistenceStore;
use crate::error::{BotError, BotResult};
use crate::types::{CycleState, StateChanges, WalEntry, WalStatus};

/// Outcome of a WAL recovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalRecoveryReport {
    pub recovered: usize,
    pub failed: usize,
    pub total: usize,
}

/// Owns every mutation of `CycleState`. Wraps the store's versioned update
/// routines with write-ahead journaling so a crash between intent and
/// application is replayable on the next boot.
pub struct TransactionManager {
    store: Arc<dyn PersistenceStore>,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    pub async fn update_atomic(
        &self,
        bot_id: &str,
        changes: &StateChanges,
        expected_version: Option<i64>,
    ) -> BotResult<CycleState> {
        self.store
            .update_state_atomic(bot_id, changes, expected_version)
            .await
    }

    /// Journal the intended update, apply it, then close the journal entry.
    /// A failure after the append leaves the entry `pending` (process death)
    /// or `failed` (application error); recovery picks up the former.
    pub async fn execute_with_wal(
        &self,
        bot_id: &str,
        changes: &StateChanges,
        expected_version: Option<i64>,
        operation: serde_json::Value,
    ) -> BotResult<(i64, CycleState)> {
        let wal_id = self
            .store
            .wal_append(bot_id, changes, expected_version, &operation)
            .await?;

        match self
            .store
            .update_state_atomic(bot_id, changes, expected_version)
            .await
        {
            Ok(state) => {
                self.store
                    .wal_mark(wal_id, WalStatus::Completed, None)
                    .await?;
                Ok((wal_id, state))
            }
            Err(e) => {
                // Best effort: the mark itself must not mask the real error
                if let Err(mark_err) = self
                    .store
                    .wal_mark(wal_id, WalStatus::Failed, Some(e.to_string()))
                    .await
                {
                    error!("Failed to mark WAL {} as failed: {}", wal_id, mark_err);
                }
                Err(e)
            }
        }
    }

    /// Replay `pending` WAL entries in append order. Each entry carries the
    /// complete update and the version it expected, which makes replay
    /// idempotent: an entry whose version has already advanced is closed as
    /// recovered without touching state.
    pub async fn recover_incomplete_wal(&self, bot_id: &str) -> BotResult<WalRecoveryReport> {
        let pending = self.store.wal_pending(bot_id).await?;
        let mut report = WalRecoveryReport {
            total: pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            return Ok(report);
        }
        info!(
            "Recovering {} incomplete WAL entries for {}",
            pending.len(),
            bot_id
        );

        for entry in pending {
            match self.replay_entry(bot_id, &entry).await {
                Ok(applied) => {
                    self.store
                        .wal_mark(entry.id, WalStatus::Recovered, None)
                        .await?;
                    report.recovered += 1;
                    if !applied {
                        info!("WAL {} already applied, closed without change", entry.id);
                    }
                }
                Err(e) => {
                    warn!("WAL {} is unrecoverable: {}", entry.id, e);
                    self.store
                        .wal_mark(entry.id, WalStatus::Unrecoverable, Some(e.to_string()))
                        .await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Returns Ok(true) when the update was applied, Ok(false) when the
    /// state's version shows it already was.
    async fn replay_entry(&self, bot_id: &str, entry: &WalEntry) -> BotResult<bool> {
        match entry.expected_version {
            Some(expected) => {
                let state = self
                    .store
                    .load_state(bot_id)
                    .await?
                    .ok_or_else(|| {
                        BotError::InvalidInput(format!("no cycle state for bot {}", bot_id))
                    })?;
                if state.version > expected {
                    return Ok(false);
                }
                self.store
                    .update_state_atomic(bot_id, &entry.update, Some(expected))
                    .await?;
                Ok(true)
            }
            None => {
                self.store
                    .update_state_atomic(bot_id, &entry.update, None)
                    .await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MockPersistenceStore;
    use crate::types::CycleState;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_state(version: i64) -> CycleState {
        let mut state = CycleState::new("bot-1", dec!(1000), 10);
        state.version = version;
        state
    }

    fn sample_changes() -> StateChanges {
        StateChanges {
            capital_available: Some(dec!(900)),
            ..Default::default()
        }
    }

    fn pending_entry(id: i64, expected_version: Option<i64>) -> WalEntry {
        WalEntry {
            id,
            status: WalStatus::Pending,
            bot_id: "bot-1".to_string(),
            update: sample_changes(),
            expected_version,
            operation: serde_json::json!({"op": "buy"}),
            created_at: Utc::now(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_wal_completed_on_success() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_wal_append()
            .returning(|_, _, _, _| Ok(42));
        store
            .expect_update_state_atomic()
            .returning(|_, _, _| Ok(sample_state(2)));
        store
            .expect_wal_mark()
            .withf(|id, status, error| {
                *id == 42 && *status == WalStatus::Completed && error.is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let txn = TransactionManager::new(Arc::new(store));
        let (wal_id, state) = txn
            .execute_with_wal("bot-1", &sample_changes(), Some(1), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(wal_id, 42);
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn test_wal_failed_on_update_error() {
        let mut store = MockPersistenceStore::new();
        store.expect_wal_append().returning(|_, _, _, _| Ok(7));
        store.expect_update_state_atomic().returning(|_, _, _| {
            Err(BotError::VersionConflict {
                bot_id: "bot-1".to_string(),
                expected: 1,
            })
        });
        store
            .expect_wal_mark()
            .withf(|id, status, error| {
                *id == 7 && *status == WalStatus::Failed && error.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let txn = TransactionManager::new(Arc::new(store));
        let err = txn
            .execute_with_wal("bot-1", &sample_changes(), Some(1), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_recovery_reapplies_matching_version() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_wal_pending()
            .returning(|_| Ok(vec![pending_entry(1, Some(3))]));
        store
            .expect_load_state()
            .returning(|_| Ok(Some(sample_state(3))));
        store
            .expect_update_state_atomic()
            .times(1)
            .returning(|_, _, _| Ok(sample_state(4)));
        store
            .expect_wal_mark()
            .withf(|id, status, error| {
                *id == 1 && *status == WalStatus::Recovered && error.is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let txn = TransactionManager::new(Arc::new(store));
        let report = txn.recover_incomplete_wal("bot-1").await.unwrap();
        assert_eq!(
            report,
            WalRecoveryReport {
                recovered: 1,
                failed: 0,
                total: 1
            }
        );
    }

    #[tokio::test]
    async fn test_recovery_skips_already_applied() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_wal_pending()
            .returning(|_| Ok(vec![pending_entry(1, Some(3))]));
        // Version advanced past the journaled expectation
        store
            .expect_load_state()
            .returning(|_| Ok(Some(sample_state(5))));
        store.expect_update_state_atomic().times(0);
        store
            .expect_wal_mark()
            .withf(|id, status, error| {
                *id == 1 && *status == WalStatus::Recovered && error.is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let txn = TransactionManager::new(Arc::new(store));
        let report = txn.recover_incomplete_wal("bot-1").await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_recovery_marks_unrecoverable() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_wal_pending()
            .returning(|_| Ok(vec![pending_entry(1, None), pending_entry(2, None)]));
        let mut call = 0;
        store.expect_update_state_atomic().returning(move |_, _, _| {
            call += 1;
            if call == 1 {
                Ok(sample_state(2))
            } else {
                Err(BotError::InvalidInput("corrupt".to_string()))
            }
        });
        store
            .expect_wal_mark()
            .withf(|id, status, error| {
                *id == 1 && *status == WalStatus::Recovered && error.is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_wal_mark()
            .withf(|id, status, _| *id == 2 && *status == WalStatus::Unrecoverable)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let txn = TransactionManager::new(Arc::new(store));
        let report = txn.recover_incomplete_wal("bot-1").await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total, 2);
    }
}
