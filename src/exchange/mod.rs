#![allow(dead_code)]
pub mod binance;
pub mod rules;
pub mod websocket;

pub use binance::*;
pub use rules::*;
pub use websocket::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::BotResult;
use crate::types::{Candle, OrderRequest, OrderResult, TimeFrame};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Exchange REST surface the trading core consumes. Mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn ping(&self) -> BotResult<()>;

    /// Per-symbol filter snapshots from the exchange-info endpoint.
    async fn get_exchange_info(&self) -> BotResult<Vec<SymbolTradingRules>>;

    /// Submit a LIMIT/IOC order. The venue fills what it can immediately and
    /// cancels the remainder; the result carries executed qty and fills.
    async fn create_order(&self, request: &OrderRequest) -> BotResult<OrderResult>;

    async fn get_order(
        &self,
        symbol: &str,
        order_id: Option<u64>,
        client_order_id: Option<String>,
    ) -> BotResult<OrderResult>;

    async fn get_balance(&self, asset: &str) -> BotResult<AssetBalance>;

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: u32,
    ) -> BotResult<Vec<Candle>>;

    /// Closed candles with `close_time > start`, oldest first. Used for the
    /// missed-candle catch-up on restart.
    async fn get_candles_since(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        start: DateTime<Utc>,
    ) -> BotResult<Vec<Candle>>;
}
