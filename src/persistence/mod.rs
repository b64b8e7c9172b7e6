pub mod database;
pub mod txn;

pub use database::*;
pub use txn::*;

use async_trait::async_trait;

use crate::config::StrategyConfig;
use crate::error::BotResult;
use crate::types::{
    BotEventType, CycleState, PauseEntry, PauseReason, StateChanges, TradeRecord, WalEntry,
    WalStatus,
};

/// Storage surface the trading core consumes: cycle state with versioned
/// updates, the append-only trade and event logs, pause rows and the WAL
/// primitives the transaction manager builds on. Mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn health_check(&self) -> BotResult<()>;

    // Strategy config
    async fn load_active_config(&self) -> BotResult<Option<StrategyConfig>>;
    async fn save_config(&self, config: &StrategyConfig) -> BotResult<()>;

    // Cycle state
    async fn load_state(&self, bot_id: &str) -> BotResult<Option<CycleState>>;
    async fn insert_state(&self, state: &CycleState) -> BotResult<()>;

    /// Versioned read-modify-write. A supplied `expected_version` that no
    /// longer matches raises `VersionConflict`; every success bumps the
    /// version and writes a STATE_UPDATE audit event.
    async fn update_state_atomic(
        &self,
        bot_id: &str,
        changes: &StateChanges,
        expected_version: Option<i64>,
    ) -> BotResult<CycleState>;

    /// Like `update_state_atomic` but additionally rejects updates that
    /// would leave capital or purchases negative.
    async fn update_state_critical(
        &self,
        bot_id: &str,
        changes: &StateChanges,
    ) -> BotResult<CycleState>;

    /// All-or-nothing multi-state update in one transaction.
    async fn batch_update_states(
        &self,
        updates: &[(String, StateChanges)],
    ) -> BotResult<Vec<CycleState>>;

    // Trade log
    async fn insert_trade(&self, trade: &TradeRecord) -> BotResult<()>;

    // Event log
    async fn append_event(
        &self,
        bot_id: &str,
        event_type: BotEventType,
        payload: &serde_json::Value,
    ) -> BotResult<i64>;
    async fn cleanup_old_events(&self, retention_days: u32) -> BotResult<u64>;

    // Write-ahead log (stored in the event log under WRITE_AHEAD_LOG)
    async fn wal_append(
        &self,
        bot_id: &str,
        update: &StateChanges,
        expected_version: Option<i64>,
        operation: &serde_json::Value,
    ) -> BotResult<i64>;
    async fn wal_mark(&self, wal_id: i64, status: WalStatus, error: Option<String>)
        -> BotResult<()>;
    /// Pending entries for the bot, oldest first.
    async fn wal_pending(&self, bot_id: &str) -> BotResult<Vec<WalEntry>>;

    // Pause rows
    async fn active_pause(&self) -> BotResult<Option<PauseEntry>>;
    /// Insert an active pause row, or update the reason of the existing one.
    async fn pause_upsert(
        &self,
        reason: PauseReason,
        message: &str,
        metadata: &serde_json::Value,
    ) -> BotResult<PauseEntry>;
    /// Flip the active pause row to resumed; no-op when none is active.
    async fn pause_resolve(
        &self,
        resume_metadata: &serde_json::Value,
    ) -> BotResult<Option<PauseEntry>>;
}
