use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Transaction};
use std::str::FromStr;
use tracing::info;

use super::PersistenceStore;
use crate::config::StrategyConfig;
use crate::error::{BotError, BotResult};
use crate::types::{
    BotEventType, CycleState, CycleStatus, PauseEntry, PauseReason, StateChanges, TimeFrame,
    TradeRecord, WalEntry, WalStatus,
};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate the schema.
    pub async fn new(database_url: &str) -> BotResult<Self> {
        info!("Initializing SQLite database at: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(BotError::Persistence)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Single-connection in-memory database for tests.
    #[cfg(test)]
    pub(crate) async fn in_memory() -> BotResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(BotError::Persistence)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    async fn create_schema(&self) -> BotResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                drop_pct TEXT NOT NULL,
                rise_pct TEXT NOT NULL,
                max_purchases INTEGER NOT NULL,
                min_buy_usdt TEXT NOT NULL,
                initial_capital_usdt TEXT NOT NULL,
                slippage_buy_pct TEXT NOT NULL,
                slippage_sell_pct TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_state (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                capital_available TEXT NOT NULL,
                btc_accumulated TEXT NOT NULL,
                btc_accum_net TEXT NOT NULL,
                purchases_remaining INTEGER NOT NULL,
                cost_accum_usdt TEXT NOT NULL,
                reference_price TEXT,
                ath_price TEXT NOT NULL,
                buy_amount TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                side TEXT NOT NULL,
                order_id INTEGER NOT NULL,
                client_order_id TEXT NOT NULL,
                status TEXT NOT NULL,
                executed_price TEXT NOT NULL,
                executed_qty TEXT NOT NULL,
                quote_qty TEXT NOT NULL,
                fee_asset TEXT NOT NULL,
                fee_amount TEXT NOT NULL,
                raw_fills TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trades_cycle ON trades(cycle_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_bot_type ON bot_events(bot_id, event_type)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_created ON bot_events(created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pause_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                reason TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT NOT NULL,
                paused_at TEXT NOT NULL,
                resumed_at TEXT,
                resume_metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pause_status ON pause_states(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Shared read-modify-write used by atomic, critical and batch updates.
    /// The UPDATE is guarded by the old version so a concurrent writer that
    /// slipped between the SELECT and the UPDATE surfaces as a conflict.
    async fn apply_update_in_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        bot_id: &str,
        changes: &StateChanges,
        expected_version: Option<i64>,
        enforce_invariants: bool,
    ) -> BotResult<CycleState> {
        let row = sqlx::query("SELECT * FROM cycle_state WHERE id = ?")
            .bind(bot_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| {
                BotError::InvalidInput(format!("no cycle state for bot {}", bot_id))
            })?;

        let mut state = state_from_row(&row)?;
        let old_version = state.version;

        if let Some(expected) = expected_version {
            if expected != old_version {
                return Err(BotError::VersionConflict {
                    bot_id: bot_id.to_string(),
                    expected,
                });
            }
        }

        changes.apply_to(&mut state);
        state.version = old_version + 1;
        state.updated_at = Utc::now();

        if enforce_invariants {
            if state.capital_available < Decimal::ZERO {
                return Err(BotError::InvalidInput(format!(
                    "update would leave capital negative: {}",
                    state.capital_available
                )));
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE cycle_state
            SET status = ?, capital_available = ?, btc_accumulated = ?,
                btc_accum_net = ?, purchases_remaining = ?, cost_accum_usdt = ?,
                reference_price = ?, ath_price = ?, buy_amount = ?,
                version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(state.status.as_str())
        .bind(state.capital_available.to_string())
        .bind(state.btc_accumulated.to_string())
        .bind(state.btc_accum_net.to_string())
        .bind(state.purchases_remaining as i64)
        .bind(state.cost_accum_usdt.to_string())
        .bind(state.reference_price.map(|p| p.to_string()))
        .bind(state.ath_price.to_string())
        .bind(state.buy_amount.to_string())
        .bind(state.version)
        .bind(state.updated_at.to_rfc3339())
        .bind(bot_id)
        .bind(old_version)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::VersionConflict {
                bot_id: bot_id.to_string(),
                expected: old_version,
            });
        }

        Ok(state)
    }

    async fn append_event_in_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        bot_id: &str,
        event_type: BotEventType,
        payload: &serde_json::Value,
    ) -> BotResult<i64> {
        let result = sqlx::query(
            "INSERT INTO bot_events (bot_id, event_type, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(bot_id)
        .bind(event_type.as_str())
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl PersistenceStore for Database {
    async fn health_check(&self) -> BotResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn load_active_config(&self) -> BotResult<Option<StrategyConfig>> {
        let row = sqlx::query(
            "SELECT * FROM strategy_config WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| config_from_row(&r)).transpose()
    }

    async fn save_config(&self, config: &StrategyConfig) -> BotResult<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_config (
                symbol, timeframe, drop_pct, rise_pct, max_purchases,
                min_buy_usdt, initial_capital_usdt, slippage_buy_pct,
                slippage_sell_pct, is_active, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.symbol)
        .bind(config.timeframe.as_str())
        .bind(config.drop_pct.to_string())
        .bind(config.rise_pct.to_string())
        .bind(config.max_purchases as i64)
        .bind(config.min_buy_usdt.to_string())
        .bind(config.initial_capital_usdt.to_string())
        .bind(config.slippage_buy_pct.to_string())
        .bind(config.slippage_sell_pct.to_string())
        .bind(config.is_active as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(&self, bot_id: &str) -> BotResult<Option<CycleState>> {
        let row = sqlx::query("SELECT * FROM cycle_state WHERE id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| state_from_row(&r)).transpose()
    }

    async fn insert_state(&self, state: &CycleState) -> BotResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cycle_state (
                id, status, capital_available, btc_accumulated, btc_accum_net,
                purchases_remaining, cost_accum_usdt, reference_price,
                ath_price, buy_amount, version, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(state.status.as_str())
        .bind(state.capital_available.to_string())
        .bind(state.btc_accumulated.to_string())
        .bind(state.btc_accum_net.to_string())
        .bind(state.purchases_remaining as i64)
        .bind(state.cost_accum_usdt.to_string())
        .bind(state.reference_price.map(|p| p.to_string()))
        .bind(state.ath_price.to_string())
        .bind(state.buy_amount.to_string())
        .bind(state.version)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_state_atomic(
        &self,
        bot_id: &str,
        changes: &StateChanges,
        expected_version: Option<i64>,
    ) -> BotResult<CycleState> {
        let mut tx = self.pool.begin().await?;
        let state =
            Self::apply_update_in_tx(&mut tx, bot_id, changes, expected_version, false).await?;
        Self::append_event_in_tx(
            &mut tx,
            bot_id,
            BotEventType::StateUpdate,
            &serde_json::json!({ "changes": changes, "version": state.version }),
        )
        .await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn update_state_critical(
        &self,
        bot_id: &str,
        changes: &StateChanges,
    ) -> BotResult<CycleState> {
        let mut tx = self.pool.begin().await?;
        let state = Self::apply_update_in_tx(&mut tx, bot_id, changes, None, true).await?;
        Self::append_event_in_tx(
            &mut tx,
            bot_id,
            BotEventType::CriticalUpdate,
            &serde_json::json!({ "changes": changes, "version": state.version }),
        )
        .await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn batch_update_states(
        &self,
        updates: &[(String, StateChanges)],
    ) -> BotResult<Vec<CycleState>> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(updates.len());
        for (bot_id, changes) in updates {
            let state = Self::apply_update_in_tx(&mut tx, bot_id, changes, None, false).await?;
            results.push(state);
        }
        if let Some((first_id, _)) = updates.first() {
            Self::append_event_in_tx(
                &mut tx,
                first_id,
                BotEventType::BatchUpdate,
                &serde_json::json!({ "count": updates.len() }),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(results)
    }

    async fn insert_trade(&self, trade: &TradeRecord) -> BotResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                cycle_id, side, order_id, client_order_id, status,
                executed_price, executed_qty, quote_qty, fee_asset, fee_amount,
                raw_fills, executed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.cycle_id)
        .bind(trade.side.as_str())
        .bind(trade.order_id as i64)
        .bind(&trade.client_order_id)
        .bind(&trade.status)
        .bind(trade.executed_price.to_string())
        .bind(trade.executed_qty.to_string())
        .bind(trade.quote_qty.to_string())
        .bind(&trade.fee_asset)
        .bind(trade.fee_amount.to_string())
        .bind(trade.raw_fills.to_string())
        .bind(trade.executed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_event(
        &self,
        bot_id: &str,
        event_type: BotEventType,
        payload: &serde_json::Value,
    ) -> BotResult<i64> {
        let mut tx = self.pool.begin().await?;
        let id = Self::append_event_in_tx(&mut tx, bot_id, event_type, payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn cleanup_old_events(&self, retention_days: u32) -> BotResult<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        // Pending WAL rows are excluded: recovery still needs them.
        let result = sqlx::query(
            r#"
            DELETE FROM bot_events
            WHERE created_at < ?
              AND NOT (event_type = 'WRITE_AHEAD_LOG' AND payload LIKE '%"status":"pending"%')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn wal_append(
        &self,
        bot_id: &str,
        update: &StateChanges,
        expected_version: Option<i64>,
        operation: &serde_json::Value,
    ) -> BotResult<i64> {
        let payload = serde_json::json!({
            "status": WalStatus::Pending,
            "update": update,
            "expected_version": expected_version,
            "operation": operation,
        });
        self.append_event(bot_id, BotEventType::WriteAheadLog, &payload)
            .await
    }

    async fn wal_mark(
        &self,
        wal_id: i64,
        status: WalStatus,
        error: Option<String>,
    ) -> BotResult<()> {
        let row = sqlx::query("SELECT payload FROM bot_events WHERE id = ?")
            .bind(wal_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BotError::InvalidInput(format!("no WAL entry with id {}", wal_id)))?;

        let payload_text: String = row.get("payload");
        let mut payload: serde_json::Value =
            serde_json::from_str(&payload_text).unwrap_or(serde_json::json!({}));
        payload["status"] = serde_json::json!(status);
        if let Some(err) = error {
            payload["error"] = serde_json::json!(err);
        }

        sqlx::query("UPDATE bot_events SET payload = ? WHERE id = ?")
            .bind(payload.to_string())
            .bind(wal_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn wal_pending(&self, bot_id: &str) -> BotResult<Vec<WalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, bot_id, payload, created_at FROM bot_events
            WHERE bot_id = ? AND event_type = 'WRITE_AHEAD_LOG'
            ORDER BY id ASC
            "#,
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::new();
        for row in rows {
            let payload_text: String = row.get("payload");
            let payload: serde_json::Value = serde_json::from_str(&payload_text)
                .map_err(|e| BotError::InvalidInput(format!("corrupt WAL payload: {}", e)))?;
            let status: WalStatus =
                serde_json::from_value(payload["status"].clone()).unwrap_or(WalStatus::Pending);
            if status != WalStatus::Pending {
                continue;
            }
            entries.push(WalEntry {
                id: row.get("id"),
                status,
                bot_id: row.get("bot_id"),
                update: serde_json::from_value(payload["update"].clone())
                    .map_err(|e| BotError::InvalidInput(format!("corrupt WAL update: {}", e)))?,
                expected_version: payload["expected_version"].as_i64(),
                operation: payload["operation"].clone(),
                created_at: parse_timestamp(row.get("created_at"))?,
                error: None,
            });
        }
        Ok(entries)
    }

    async fn active_pause(&self) -> BotResult<Option<PauseEntry>> {
        let row = sqlx::query("SELECT * FROM pause_states WHERE status = 'paused' LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| pause_from_row(&r)).transpose()
    }

    async fn pause_upsert(
        &self,
        reason: PauseReason,
        message: &str,
        metadata: &serde_json::Value,
    ) -> BotResult<PauseEntry> {
        if let Some(existing) = self.active_pause().await? {
            // Idempotent: refresh the reason on the row already in effect
            sqlx::query(
                "UPDATE pause_states SET reason = ?, message = ?, metadata = ? WHERE id = ?",
            )
            .bind(reason.as_str())
            .bind(message)
            .bind(metadata.to_string())
            .bind(existing.id)
            .execute(&self.pool)
            .await?;
            return Ok(PauseEntry {
                reason,
                message: message.to_string(),
                metadata: metadata.clone(),
                ..existing
            });
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO pause_states (status, reason, message, metadata, paused_at)
            VALUES ('paused', ?, ?, ?, ?)
            "#,
        )
        .bind(reason.as_str())
        .bind(message)
        .bind(metadata.to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(PauseEntry {
            id: result.last_insert_rowid(),
            status: "paused".to_string(),
            reason,
            message: message.to_string(),
            metadata: metadata.clone(),
            paused_at: now,
            resumed_at: None,
            resume_metadata: None,
        })
    }

    async fn pause_resolve(
        &self,
        resume_metadata: &serde_json::Value,
    ) -> BotResult<Option<PauseEntry>> {
        let Some(existing) = self.active_pause().await? else {
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE pause_states
            SET status = 'active', resumed_at = ?, resume_metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(resume_metadata.to_string())
        .bind(existing.id)
        .execute(&self.pool)
        .await?;

        Ok(Some(PauseEntry {
            status: "active".to_string(),
            resumed_at: Some(now),
            resume_metadata: Some(resume_metadata.clone()),
            ..existing
        }))
    }
}

fn parse_timestamp(raw: &str) -> BotResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BotError::InvalidInput(format!("bad timestamp {}: {}", raw, e)))
}

fn parse_decimal(raw: &str) -> BotResult<Decimal> {
    Decimal::from_str(raw).map_err(|_| BotError::InvalidInput(format!("not a decimal: {}", raw)))
}

fn state_from_row(row: &SqliteRow) -> BotResult<CycleState> {
    let status_raw: String = row.get("status");
    Ok(CycleState {
        id: row.get("id"),
        status: CycleStatus::from_str(&status_raw)
            .ok_or_else(|| BotError::InvalidInput(format!("unknown status {}", status_raw)))?,
        capital_available: parse_decimal(row.get("capital_available"))?,
        btc_accumulated: parse_decimal(row.get("btc_accumulated"))?,
        btc_accum_net: parse_decimal(row.get("btc_accum_net"))?,
        purchases_remaining: row.get::<i64, _>("purchases_remaining") as u32,
        cost_accum_usdt: parse_decimal(row.get("cost_accum_usdt"))?,
        reference_price: row
            .get::<Option<String>, _>("reference_price")
            .map(|s| parse_decimal(&s))
            .transpose()?,
        ath_price: parse_decimal(row.get("ath_price"))?,
        buy_amount: parse_decimal(row.get("buy_amount"))?,
        version: row.get("version"),
        updated_at: parse_timestamp(row.get("updated_at"))?,
    })
}

fn config_from_row(row: &SqliteRow) -> BotResult<StrategyConfig> {
    let timeframe_raw: String = row.get("timeframe");
    Ok(StrategyConfig {
        symbol: row.get("symbol"),
        timeframe: TimeFrame::from_str(&timeframe_raw).ok_or_else(|| {
            BotError::InvalidInput(format!("unknown timeframe {}", timeframe_raw))
        })?,
        drop_pct: parse_decimal(row.get("drop_pct"))?,
        rise_pct: parse_decimal(row.get("rise_pct"))?,
        max_purchases: row.get::<i64, _>("max_purchases") as u32,
        min_buy_usdt: parse_decimal(row.get("min_buy_usdt"))?,
        initial_capital_usdt: parse_decimal(row.get("initial_capital_usdt"))?,
        slippage_buy_pct: parse_decimal(row.get("slippage_buy_pct"))?,
        slippage_sell_pct: parse_decimal(row.get("slippage_sell_pct"))?,
        is_active: row.get::<i64, _>("is_active") != 0,
    })
}

fn pause_from_row(row: &SqliteRow) -> BotResult<PauseEntry> {
    let reason_raw: String = row.get("reason");
    let metadata_text: String = row.get("metadata");
    Ok(PauseEntry {
        id: row.get("id"),
        status: row.get("status"),
        reason: PauseReason::from_str(&reason_raw)
            .ok_or_else(|| BotError::InvalidInput(format!("unknown pause reason {}", reason_raw)))?,
        message: row.get("message"),
        metadata: serde_json::from_str(&metadata_text).unwrap_or(serde_json::json!({})),
        paused_at: parse_timestamp(row.get("paused_at"))?,
        resumed_at: row
            .get::<Option<String>, _>("resumed_at")
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        resume_metadata: row
            .get::<Option<String>, _>("resume_metadata")
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn seeded_db() -> Database {
        let db = Database::in_memory().await.unwrap();
        let state = CycleState::new("bot-1", dec!(1000), 10);
        db.insert_state(&state).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let db = seeded_db().await;
        let state = db.load_state("bot-1").await.unwrap().unwrap();
        assert_eq!(state.capital_available, dec!(1000));
        assert_eq!(state.version, 1);
        assert_eq!(state.reference_price, None);
    }

    #[tokio::test]
    async fn test_atomic_update_bumps_version() {
        let db = seeded_db().await;
        let changes = StateChanges {
            capital_available: Some(dec!(899.97)),
            purchases_remaining: Some(9),
            ..Default::default()
        };
        let updated = db
            .update_state_atomic("bot-1", &changes, Some(1))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.capital_available, dec!(899.97));

        let reloaded = db.load_state("bot-1").await.unwrap().unwrap();
        assert_eq!(reloaded.version, 2);
    }

    #[tokio::test]
    async fn test_version_conflict_raises() {
        let db = seeded_db().await;
        let changes = StateChanges {
            capital_available: Some(dec!(500)),
            ..Default::default()
        };
        db.update_state_atomic("bot-1", &changes, Some(1))
            .await
            .unwrap();

        let err = db
            .update_state_atomic("bot-1", &changes, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_critical_update_rejects_negative_capital() {
        let db = seeded_db().await;
        let changes = StateChanges {
            capital_available: Some(dec!(-5)),
            ..Default::default()
        };
        let err = db.update_state_critical("bot-1", &changes).await.unwrap_err();
        assert!(matches!(err, BotError::InvalidInput(_)));

        // Rolled back: version unchanged
        let state = db.load_state("bot-1").await.unwrap().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.capital_available, dec!(1000));
    }

    #[tokio::test]
    async fn test_batch_update_all_or_nothing() {
        let db = seeded_db().await;
        let other = CycleState::new("bot-2", dec!(2000), 5);
        db.insert_state(&other).await.unwrap();

        let updates = vec![
            (
                "bot-1".to_string(),
                StateChanges {
                    capital_available: Some(dec!(100)),
                    ..Default::default()
                },
            ),
            (
                "missing".to_string(),
                StateChanges {
                    capital_available: Some(dec!(200)),
                    ..Default::default()
                },
            ),
        ];
        assert!(db.batch_update_states(&updates).await.is_err());

        // First update rolled back with the failed second
        let state = db.load_state("bot-1").await.unwrap().unwrap();
        assert_eq!(state.capital_available, dec!(1000));
    }

    #[tokio::test]
    async fn test_wal_append_and_pending() {
        let db = seeded_db().await;
        let update = StateChanges {
            capital_available: Some(dec!(900)),
            ..Default::default()
        };
        let wal_id = db
            .wal_append("bot-1", &update, Some(1), &serde_json::json!({"op": "buy"}))
            .await
            .unwrap();

        let pending = db.wal_pending("bot-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, wal_id);
        assert_eq!(pending[0].update, update);
        assert_eq!(pending[0].expected_version, Some(1));

        db.wal_mark(wal_id, WalStatus::Completed, None).await.unwrap();
        assert!(db.wal_pending("bot-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wal_mark_failed_keeps_error() {
        let db = seeded_db().await;
        let wal_id = db
            .wal_append(
                "bot-1",
                &StateChanges::default(),
                None,
                &serde_json::json!({}),
            )
            .await
            .unwrap();
        db.wal_mark(wal_id, WalStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        assert!(db.wal_pending("bot-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_idempotent_upsert() {
        let db = seeded_db().await;
        let first = db
            .pause_upsert(
                PauseReason::DriftDetected,
                "drift exceeded",
                &serde_json::json!({"usdt_drift": "0.02"}),
            )
            .await
            .unwrap();
        let second = db
            .pause_upsert(
                PauseReason::BalanceMismatch,
                "btc short",
                &serde_json::json!({}),
            )
            .await
            .unwrap();

        // Same row updated, not a second active pause
        assert_eq!(first.id, second.id);
        assert_eq!(second.reason, PauseReason::BalanceMismatch);

        let active = db.active_pause().await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
        assert_eq!(active.reason, PauseReason::BalanceMismatch);
        assert!(active.resumed_at.is_none());
    }

    #[tokio::test]
    async fn test_pause_resolve() {
        let db = seeded_db().await;
        db.pause_upsert(PauseReason::Manual, "operator", &serde_json::json!({}))
            .await
            .unwrap();
        let resolved = db
            .pause_resolve(&serde_json::json!({"checked": true}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, "active");
        assert!(resolved.resumed_at.is_some());
        assert!(db.active_pause().await.unwrap().is_none());

        // Resolving again is a no-op
        assert!(db
            .pause_resolve(&serde_json::json!({}))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_active_config().await.unwrap().is_none());

        let config = StrategyConfig::default();
        db.save_config(&config).await.unwrap();
        let loaded = db.load_active_config().await.unwrap().unwrap();
        assert_eq!(loaded.symbol, "BTCUSDT");
        assert_eq!(loaded.drop_pct, dec!(0.03));
        assert_eq!(loaded.max_purchases, 10);
        assert!(loaded.is_active);
    }

    #[tokio::test]
    async fn test_cleanup_preserves_pending_wal() {
        let db = seeded_db().await;
        db.wal_append(
            "bot-1",
            &StateChanges::default(),
            None,
            &serde_json::json!({}),
        )
        .await
        .unwrap();
        db.append_event("bot-1", BotEventType::Start, &serde_json::json!({}))
            .await
            .unwrap();

        // Retention of zero days makes everything eligible
        db.cleanup_old_events(0).await.unwrap();
        assert_eq!(db.wal_pending("bot-1").await.unwrap().len(), 1);
    }
}
