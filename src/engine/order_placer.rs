use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{BotError, BotResult};
use crate::exchange::{ExchangeClient, TradingRulesCache};
use crate::numeric::{apply_slippage, round_price_to_tick, round_quantity_to_step};
use crate::types::{new_client_order_id, OrderRequest, OrderResult, Side};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Prepares, validates and submits IOC limit orders.
///
/// The limit price protects against slippage: a buy bids slightly above the
/// candle close, a sell offers slightly below, and IOC guarantees whatever
/// does not fill immediately is cancelled by the venue rather than resting.
pub struct OrderPlacer {
    exchange: Arc<dyn ExchangeClient>,
    rules: Arc<TradingRulesCache>,
    symbol: String,
}

impl OrderPlacer {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        rules: Arc<TradingRulesCache>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            rules,
            symbol: symbol.into(),
        }
    }

    pub async fn place_buy(
        &self,
        buy_usdt: Decimal,
        close_price: Decimal,
        slippage_pct: Decimal,
    ) -> BotResult<OrderResult> {
        let rules = self.rules.get_rules(&self.symbol, false).await?;

        let raw_limit = apply_slippage(close_price, slippage_pct, Side::Buy)?;
        let limit_price = round_price_to_tick(raw_limit, rules.tick_size)?;
        if limit_price <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "buy limit price not positive: {}",
                limit_price
            )));
        }

        let quantity = round_quantity_to_step(buy_usdt / limit_price, rules.step_size)?;
        self.check_filters(quantity, limit_price).await?;

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: Side::Buy,
            quantity,
            price: limit_price,
            client_order_id: new_client_order_id(Side::Buy),
        };
        self.submit_with_retry(request).await
    }

    pub async fn place_sell(
        &self,
        btc_qty: Decimal,
        close_price: Decimal,
        slippage_pct: Decimal,
    ) -> BotResult<OrderResult> {
        let rules = self.rules.get_rules(&self.symbol, false).await?;

        let raw_limit = apply_slippage(close_price, slippage_pct, Side::Sell)?;
        let limit_price = round_price_to_tick(raw_limit, rules.tick_size)?;
        if limit_price <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "sell limit price not positive: {}",
                limit_price
            )));
        }

        let quantity = round_quantity_to_step(btc_qty, rules.step_size)?;
        self.check_filters(quantity, limit_price).await?;

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: Side::Sell,
            quantity,
            price: limit_price,
            client_order_id: new_client_order_id(Side::Sell),
        };
        self.submit_with_retry(request).await
    }

    async fn check_filters(&self, quantity: Decimal, price: Decimal) -> BotResult<()> {
        let verdict = self
            .rules
            .validate_order(&self.symbol, quantity, price)
            .await?;
        if !verdict.valid {
            return Err(BotError::OrderValidation(verdict.errors));
        }
        Ok(())
    }

    /// Submit with up to three attempts. Only the transient class retries;
    /// validation and venue rejections surface immediately.
    async fn submit_with_retry(&self, request: OrderRequest) -> BotResult<OrderResult> {
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                "Order placing: {} {} {} @ {} (attempt {}/{}, id {})",
                request.side,
                request.quantity,
                request.symbol,
                request.price,
                attempt,
                MAX_ATTEMPTS,
                request.client_order_id
            );

            match self.exchange.create_order(&request).await {
                Ok(result) => {
                    if result.is_filled() {
                        info!(
                            "Order executed: {} filled {} of {} at avg {} (order {})",
                            request.side,
                            result.executed_qty,
                            request.quantity,
                            result.avg_price(),
                            result.order_id
                        );
                    } else {
                        info!(
                            "Order completed unfilled: {} {} cancelled by IOC (order {})",
                            request.side, request.quantity, result.order_id
                        );
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        "Order retry: attempt {} failed transiently ({}), backing off {:?}",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(
                        "Order failed: {} {} after {} attempt(s): {}",
                        request.side, request.client_order_id, attempt, e
                    );
                    return Err(e);
                }
            }
        }
    }
}
