use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{HealthMonitor, OrderPlacer, PauseController};
use crate::config::{MonitoringConfig, StrategyConfig};
use crate::error::{BotError, BotResult};
use crate::exchange::{CandleEvent, ExchangeClient, TradingRulesCache};
use crate::notifications::{Notifier, Severity};
use crate::persistence::{PersistenceStore, TransactionManager};
use crate::strategy::{
    apply_buy, apply_sell, check_drift, compute_buy_amount, should_buy, should_sell, DriftStatus,
};
use crate::types::{
    BotEventType, Candle, CandleWindow, CycleState, OrderResult, PauseReason, TradeRecord,
};

const MAX_VERSION_CONFLICTS: u32 = 3;

/// Drives the candle-close protocol: one candle at a time, sells evaluated
/// before buys, ATH refreshed only while flat, and every state transition
/// durable through the WAL before the next candle is touched.
pub struct Orchestrator {
    bot_id: String,
    config: StrategyConfig,
    monitoring: MonitoringConfig,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn PersistenceStore>,
    txn: TransactionManager,
    rules: Arc<TradingRulesCache>,
    placer: OrderPlacer,
    pause: Arc<PauseController>,
    notifier: Arc<Notifier>,
    health: Arc<HealthMonitor>,
    window: CandleWindow,
    queue: VecDeque<Candle>,
    last_processed_close: Option<DateTime<Utc>>,
    stopping: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_id: impl Into<String>,
        config: StrategyConfig,
        monitoring: MonitoringConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn PersistenceStore>,
        rules: Arc<TradingRulesCache>,
        placer: OrderPlacer,
        pause: Arc<PauseController>,
        notifier: Arc<Notifier>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            config,
            monitoring,
            exchange,
            txn: TransactionManager::new(Arc::clone(&store)),
            store,
            rules,
            placer,
            pause,
            notifier,
            health,
            window: CandleWindow::new(CandleWindow::ATH_LOOKBACK),
            queue: VecDeque::new(),
            last_processed_close: None,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Recover journaled updates, prime the ATH window and replay candles
    /// missed while the process was down. Runs before the live stream.
    pub async fn start(&mut self) -> BotResult<()> {
        let report = self.txn.recover_incomplete_wal(&self.bot_id).await?;
        if report.total > 0 {
            info!(
                "WAL recovery: {} recovered, {} unrecoverable of {}",
                report.recovered, report.failed, report.total
            );
        }

        let state = self.load_state().await?;

        let recent = self
            .exchange
            .get_candles(
                &self.config.symbol,
                self.config.timeframe,
                CandleWindow::ATH_LOOKBACK as u32,
            )
            .await?;
        for candle in recent
            .iter()
            .filter(|c| c.is_closed && c.close_time <= state.updated_at)
        {
            self.window.push(candle.clone());
        }
        self.last_processed_close = Some(state.updated_at);

        let missed = self.catch_up(state.updated_at).await?;
        if missed > 0 {
            info!("Caught up {} missed candles", missed);
        }

        self.store
            .append_event(
                &self.bot_id,
                BotEventType::Start,
                &serde_json::json!({ "symbol": self.config.symbol }),
            )
            .await?;
        self.notifier
            .send_alert(
                format!("DCA bot started on {}", self.config.symbol),
                Severity::Info,
            )
            .await;
        Ok(())
    }

    /// Live loop. Candles arriving while one is being processed accumulate
    /// and are drained in `close_time` order; queued candles are dropped on
    /// shutdown, the in-flight one always settles.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<CandleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BotResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown requested, stopping candle intake");
                    self.stopping.store(true, Ordering::Release);
                    break;
                }
                maybe = events.recv() => {
                    match maybe {
                        Some(event) => self.handle_event(event, &mut events).await,
                        None => {
                            warn!("Candle stream ended");
                            break;
                        }
                    }
                }
            }
        }

        let dropped = self.queue.len();
        if dropped > 0 {
            info!("Dropping {} queued candles on shutdown", dropped);
            self.queue.clear();
        }
        self.store
            .append_event(&self.bot_id, BotEventType::Stop, &serde_json::json!({}))
            .await?;
        info!("Orchestrator stopped");
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: CandleEvent,
        events: &mut mpsc::Receiver<CandleEvent>,
    ) {
        self.enqueue_event(event);
        // Drain the burst so ordering holds across simultaneous arrivals
        while let Ok(extra) = events.try_recv() {
            self.enqueue_event(extra);
        }

        while let Some(candle) = self.queue.pop_front() {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            self.process_candle(candle).await;
        }
    }

    fn enqueue_event(&mut self, event: CandleEvent) {
        match event {
            CandleEvent::Candle(candle) if candle.is_closed => self.enqueue_candle(candle),
            CandleEvent::Candle(_) => {}
            CandleEvent::Disconnected => warn!("Candle stream disconnected"),
            CandleEvent::Error(message) => warn!("Candle stream error: {}", message),
        }
    }

    /// Ordered insert by close time; duplicates are dropped.
    fn enqueue_candle(&mut self, candle: Candle) {
        if self
            .queue
            .iter()
            .any(|c| c.close_time == candle.close_time)
        {
            return;
        }
        let at = self
            .queue
            .partition_point(|c| c.close_time < candle.close_time);
        self.queue.insert(at, candle);
    }

    /// The candle-close protocol. Any error is contained here: it becomes an
    /// ERROR event and an error-counter tick, never a crash of the loop.
    pub async fn process_candle(&mut self, candle: Candle) {
        if self.stopping.load(Ordering::Acquire) {
            debug!("Stopping, dropping candle {}", candle.close_time);
            return;
        }
        if self.pause.is_paused() {
            debug!("Paused, dropping candle {}", candle.close_time);
            return;
        }
        if let Some(last) = self.last_processed_close {
            if candle.close_time <= last {
                debug!("Skipping already-processed candle {}", candle.close_time);
                return;
            }
        }
        self.last_processed_close = Some(candle.close_time);

        if let Err(e) = self.process_candle_inner(&candle).await {
            self.health.record_error();
            error!("Candle {} failed: {}", candle.close_time, e);
            let _ = self
                .store
                .append_event(
                    &self.bot_id,
                    BotEventType::Error,
                    &serde_json::json!({
                        "message": e.to_string(),
                        "close_time": candle.close_time.to_rfc3339(),
                    }),
                )
                .await;
        }
        self.health.record_candle().await;
    }

    async fn process_candle_inner(&mut self, candle: &Candle) -> BotResult<()> {
        self.window.push(candle.clone());
        let mut state = self.load_state().await?;

        // ATH re-anchors the reference only while flat; during a hold the
        // reference stays the weighted cost and must not move.
        if !state.is_holding() {
            state = self.refresh_ath(state).await?;
        }

        if state.is_holding() && should_sell(&state, &self.config, candle) {
            let proceed = self.sell_phase(&mut state, candle).await?;
            if !proceed {
                return Ok(());
            }
        }

        if !self.pause.is_paused()
            && state.purchases_remaining > 0
            && should_buy(&state, &self.config, candle)
        {
            self.buy_phase(&state, candle).await?;
        }

        Ok(())
    }

    async fn refresh_ath(&mut self, state: CycleState) -> BotResult<CycleState> {
        let Some(ath) = self.window.calculate_ath() else {
            return Ok(state);
        };
        if state.ath_price == ath && state.reference_price == Some(ath) {
            return Ok(state);
        }

        let changes = crate::types::StateChanges {
            ath_price: Some(ath),
            reference_price: Some(Some(ath)),
            ..Default::default()
        };
        let updated = self
            .txn
            .update_atomic(&self.bot_id, &changes, Some(state.version))
            .await?;
        debug!("ATH updated to {}", ath);
        self.store
            .append_event(
                &self.bot_id,
                BotEventType::AthUpdated,
                &serde_json::json!({ "ath": ath.to_string() }),
            )
            .await?;
        Ok(updated)
    }

    /// Returns Ok(false) when the candle must stop here (pause or terminal
    /// order failure), Ok(true) when the buy phase may still run.
    async fn sell_phase(&mut self, state: &mut CycleState, candle: &Candle) -> BotResult<bool> {
        let btc = self.exchange.get_balance("BTC").await?;
        if btc.free < state.btc_accumulated {
            self.store
                .append_event(
                    &self.bot_id,
                    BotEventType::DriftHalt,
                    &serde_json::json!({
                        "kind": "balance_mismatch",
                        "internal_btc": state.btc_accumulated.to_string(),
                        "exchange_btc": btc.free.to_string(),
                    }),
                )
                .await?;
            self.pause
                .pause(
                    PauseReason::BalanceMismatch,
                    &format!(
                        "exchange BTC {} below tracked {}",
                        btc.free, state.btc_accumulated
                    ),
                    serde_json::json!({
                        "internal": state.btc_accumulated.to_string(),
                        "exchange": btc.free.to_string(),
                    }),
                )
                .await?;
            return Ok(false);
        }

        let usdt = self.exchange.get_balance("USDT").await?;
        if !self
            .drift_gate(state, usdt.free, btc.free)
            .await?
        {
            return Ok(false);
        }

        let result = match self
            .placer
            .place_sell(
                state.btc_accumulated,
                candle.close,
                self.config.slippage_sell_pct,
            )
            .await
        {
            Ok(result) => result,
            Err(BotError::OrderValidation(errors)) => {
                warn!("Sell rejected by filters: {}", errors.join("; "));
                return Ok(true);
            }
            Err(e) => {
                self.record_order_failure("sell", &e).await;
                return Ok(false);
            }
        };

        if !result.is_filled() {
            info!("Sell IOC returned unfilled, re-evaluating next candle");
            return Ok(true);
        }

        let outcome = self.persist_sell(state.clone(), &result).await?;
        *state = outcome;
        Ok(!self.pause.is_paused())
    }

    async fn buy_phase(&mut self, state: &CycleState, candle: &Candle) -> BotResult<()> {
        let rules = self.rules.get_rules(&self.config.symbol, false).await?;
        let Some(amount) = compute_buy_amount(state, &self.config, rules.min_notional) else {
            debug!("Buy amount below minimum, trigger dropped");
            return Ok(());
        };

        let usdt = self.exchange.get_balance("USDT").await?;
        if usdt.free < amount {
            // Not a divergence: the operator may simply have withdrawn funds
            warn!(
                "Insufficient USDT for buy: need {}, exchange has {}",
                amount, usdt.free
            );
            return Ok(());
        }

        let btc = self.exchange.get_balance("BTC").await?;
        if !self.drift_gate(state, usdt.free, btc.free).await? {
            return Ok(());
        }

        let result = match self
            .placer
            .place_buy(amount, candle.close, self.config.slippage_buy_pct)
            .await
        {
            Ok(result) => result,
            Err(BotError::OrderValidation(errors)) => {
                warn!("Buy rejected by filters: {}", errors.join("; "));
                return Ok(());
            }
            Err(e) => {
                self.record_order_failure("buy", &e).await;
                return Ok(());
            }
        };

        if !result.is_filled() {
            info!("Buy IOC returned unfilled");
            return Ok(());
        }

        self.persist_buy(state.clone(), &result, amount).await?;
        Ok(())
    }

    /// Ok(true) to proceed, Ok(false) when drift paused the strategy.
    async fn drift_gate(
        &self,
        state: &CycleState,
        usdt_spot: Decimal,
        btc_spot: Decimal,
    ) -> BotResult<bool> {
        let report = check_drift(
            state.capital_available,
            state.btc_accumulated,
            usdt_spot,
            btc_spot,
            &self.monitoring,
        );

        match report.overall {
            DriftStatus::Ok => Ok(true),
            DriftStatus::Warning => {
                warn!(
                    "Balance drift warning: usdt {} btc {}",
                    report.usdt_drift, report.btc_drift
                );
                self.notifier
                    .send_alert(
                        format!(
                            "Balance drift warning: usdt {} btc {}",
                            report.usdt_drift, report.btc_drift
                        ),
                        Severity::Warning,
                    )
                    .await;
                Ok(true)
            }
            DriftStatus::Exceeded => {
                self.store
                    .append_event(
                        &self.bot_id,
                        BotEventType::DriftHalt,
                        &serde_json::to_value(&report)
                            .unwrap_or(serde_json::json!({})),
                    )
                    .await?;
                self.pause
                    .pause(
                        PauseReason::DriftDetected,
                        &format!(
                            "drift exceeded: usdt {} btc {}",
                            report.usdt_drift, report.btc_drift
                        ),
                        serde_json::to_value(&report).unwrap_or(serde_json::json!({})),
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    async fn persist_buy(
        &self,
        mut state: CycleState,
        result: &OrderResult,
        buy_amount: Decimal,
    ) -> BotResult<CycleState> {
        let mut conflicts = 0;
        loop {
            let mut outcome = apply_buy(&state, result)?;
            outcome.changes.buy_amount = Some(buy_amount);
            let operation = serde_json::json!({
                "operation": "buy",
                "order_id": result.order_id,
                "client_order_id": result.client_order_id,
            });

            match self
                .txn
                .execute_with_wal(&self.bot_id, &outcome.changes, Some(state.version), operation)
                .await
            {
                Ok((_, new_state)) => {
                    self.record_trade(result).await?;
                    self.store
                        .append_event(
                            &self.bot_id,
                            BotEventType::BuyExecuted,
                            &serde_json::json!({
                                "qty": result.executed_qty.to_string(),
                                "cost": outcome.cost_paid.to_string(),
                                "reference": outcome.new_reference.to_string(),
                                "purchases_remaining": new_state.purchases_remaining,
                            }),
                        )
                        .await?;
                    info!(
                        "Buy applied: {} BTC for {} USDT, reference now {}",
                        result.executed_qty, outcome.cost_paid, outcome.new_reference
                    );
                    return Ok(new_state);
                }
                Err(BotError::VersionConflict { .. }) if conflicts + 1 < MAX_VERSION_CONFLICTS => {
                    conflicts += 1;
                    warn!("Version conflict applying buy, reloading ({})", conflicts);
                    state = self.load_state().await?;
                }
                Err(e @ BotError::VersionConflict { .. }) => {
                    self.pause
                        .pause(
                            PauseReason::CriticalError,
                            "repeated version conflicts applying buy",
                            serde_json::json!({ "conflicts": MAX_VERSION_CONFLICTS }),
                        )
                        .await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn persist_sell(&self, mut state: CycleState, result: &OrderResult) -> BotResult<CycleState> {
        let mut conflicts = 0;
        loop {
            let outcome = apply_sell(&state, result, self.config.max_purchases)?;
            let operation = serde_json::json!({
                "operation": "sell",
                "order_id": result.order_id,
                "client_order_id": result.client_order_id,
            });

            match self
                .txn
                .execute_with_wal(&self.bot_id, &outcome.changes, Some(state.version), operation)
                .await
            {
                Ok((_, new_state)) => {
                    self.record_trade(result).await?;
                    self.store
                        .append_event(
                            &self.bot_id,
                            BotEventType::TradeExecuted,
                            &serde_json::json!({
                                "side": "SELL",
                                "qty": result.executed_qty.to_string(),
                                "net_usdt": outcome.net_usdt.to_string(),
                                "profit": outcome.profit.to_string(),
                            }),
                        )
                        .await?;

                    if let Some(shortfall) = outcome.shortfall {
                        // The clamp keeps the books at zero; the divergence
                        // itself halts trading.
                        self.pause
                            .pause(
                                PauseReason::CriticalError,
                                &format!("sell netted {} below principal", shortfall),
                                serde_json::json!({ "shortfall": shortfall.to_string() }),
                            )
                            .await?;
                    } else if outcome.cycle_closed {
                        self.store
                            .append_event(
                                &self.bot_id,
                                BotEventType::CycleComplete,
                                &serde_json::json!({
                                    "profit": outcome.profit.to_string(),
                                    "capital": new_state.capital_available.to_string(),
                                }),
                            )
                            .await?;
                        info!(
                            "Cycle complete: profit {} USDT, capital {}",
                            outcome.profit, new_state.capital_available
                        );
                        self.notifier
                            .send_alert(
                                format!("Cycle closed with profit {} USDT", outcome.profit),
                                Severity::Info,
                            )
                            .await;
                    } else {
                        info!(
                            "Partial sell applied: {} BTC remaining",
                            new_state.btc_accumulated
                        );
                    }
                    return Ok(new_state);
                }
                Err(BotError::VersionConflict { .. }) if conflicts + 1 < MAX_VERSION_CONFLICTS => {
                    conflicts += 1;
                    warn!("Version conflict applying sell, reloading ({})", conflicts);
                    state = self.load_state().await?;
                }
                Err(e @ BotError::VersionConflict { .. }) => {
                    self.pause
                        .pause(
                            PauseReason::CriticalError,
                            "repeated version conflicts applying sell",
                            serde_json::json!({ "conflicts": MAX_VERSION_CONFLICTS }),
                        )
                        .await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_trade(&self, result: &OrderResult) -> BotResult<()> {
        let (fee_asset, fee_amount) = result.primary_fee();
        let trade = TradeRecord {
            cycle_id: self.bot_id.clone(),
            side: result.side,
            order_id: result.order_id,
            client_order_id: result.client_order_id.clone(),
            status: result.status.as_str().to_string(),
            executed_price: result.avg_price(),
            executed_qty: result.executed_qty,
            quote_qty: result.cummulative_quote_qty,
            fee_asset,
            fee_amount,
            raw_fills: serde_json::to_value(&result.fills)
                .unwrap_or(serde_json::json!([])),
            executed_at: result.transact_time,
        };
        self.store.insert_trade(&trade).await
    }

    async fn record_order_failure(&self, side: &str, error: &BotError) {
        self.health.record_error();
        error!("{} order failed: {}", side, error);
        let _ = self
            .store
            .append_event(
                &self.bot_id,
                BotEventType::TradeFailed,
                &serde_json::json!({ "side": side, "error": error.to_string() }),
            )
            .await;
        self.notifier
            .send_alert(format!("{} order failed: {}", side, error), Severity::Error)
            .await;
    }

    async fn catch_up(&mut self, since: DateTime<Utc>) -> BotResult<usize> {
        let candles = self
            .exchange
            .get_candles_since(&self.config.symbol, self.config.timeframe, since)
            .await?;
        let missed: Vec<Candle> = candles
            .into_iter()
            .filter(|c| c.is_closed && c.close_time > since)
            .collect();
        let count = missed.len();
        for candle in missed {
            self.process_candle(candle).await;
        }
        Ok(count)
    }

    async fn load_state(&self) -> BotResult<CycleState> {
        self.store
            .load_state(&self.bot_id)
            .await?
            .ok_or_else(|| {
                BotError::InvalidInput(format!("no cycle state for bot {}", self.bot_id))
            })
    }
}
