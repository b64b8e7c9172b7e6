use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::binance::{FilterResponse, SymbolInfoResponse};
use super::ExchangeClient;
use crate::error::{BotError, BotResult};
use crate::numeric::{min_quantity_for_notional, round_price_to_tick, round_quantity_to_step};

/// Per-symbol exchange filters: price granularity, quantity granularity and
/// the minimum order value the venue accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTradingRules {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub order_types: Vec<String>,
}

impl SymbolTradingRules {
    pub(super) fn from_symbol_info(info: SymbolInfoResponse) -> BotResult<Self> {
        let mut rules = SymbolTradingRules {
            symbol: info.symbol,
            status: info.status,
            base_asset: info.base_asset,
            quote_asset: info.quote_asset,
            base_precision: info.base_asset_precision,
            quote_precision: info.quote_precision,
            min_price: Decimal::ZERO,
            max_price: Decimal::MAX,
            tick_size: Decimal::ONE,
            min_qty: Decimal::ZERO,
            max_qty: Decimal::MAX,
            step_size: Decimal::ONE,
            min_notional: Decimal::ZERO,
            order_types: info.order_types,
        };

        for filter in info.filters {
            match filter {
                FilterResponse::Price {
                    min_price,
                    max_price,
                    tick_size,
                } => {
                    rules.min_price = parse(&min_price)?;
                    rules.max_price = parse(&max_price)?;
                    rules.tick_size = parse(&tick_size)?;
                }
                FilterResponse::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    rules.min_qty = parse(&min_qty)?;
                    rules.max_qty = parse(&max_qty)?;
                    rules.step_size = parse(&step_size)?;
                }
                FilterResponse::Notional { min_notional }
                | FilterResponse::MinNotional { min_notional } => {
                    rules.min_notional = parse(&min_notional)?;
                }
                FilterResponse::Other => {}
            }
        }

        Ok(rules)
    }

    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

fn parse(s: &str) -> BotResult<Decimal> {
    Decimal::from_str(s).map_err(|_| BotError::InvalidInput(format!("not a decimal: {}", s)))
}

/// Outcome of checking an order against the symbol filters. When invalid the
/// adjusted values show the nearest compliant order, if one exists.
#[derive(Debug, Clone, Default)]
pub struct OrderValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub adjusted_qty: Option<Decimal>,
    pub adjusted_price: Option<Decimal>,
    pub suggested_min_qty: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct CachedRules {
    rules: SymbolTradingRules,
    fetched_at: DateTime<Utc>,
}

/// Cache of symbol filters with a 24h TTL. Refreshing refetches the whole
/// exchange-info snapshot; on refresh failure the stale entry keeps serving.
pub struct TradingRulesCache {
    exchange: Arc<dyn ExchangeClient>,
    cache: Arc<RwLock<HashMap<String, CachedRules>>>,
    ttl: Duration,
}

impl TradingRulesCache {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self {
            exchange,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::hours(24),
        }
    }

    pub fn with_ttl(exchange: Arc<dyn ExchangeClient>, ttl: Duration) -> Self {
        Self {
            exchange,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get_rules(
        &self,
        symbol: &str,
        force_refresh: bool,
    ) -> BotResult<SymbolTradingRules> {
        if !force_refresh {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(symbol) {
                if Utc::now() - entry.fetched_at < self.ttl {
                    return Ok(entry.rules.clone());
                }
            }
        }

        match self.refresh_all().await {
            Ok(()) => {}
            Err(e) => {
                // Stale rules beat no rules
                let cache = self.cache.read().await;
                if let Some(entry) = cache.get(symbol) {
                    warn!(
                        "Rules refresh for {} failed ({}), serving cached snapshot",
                        symbol, e
                    );
                    return Ok(entry.rules.clone());
                }
                return Err(e);
            }
        }

        let cache = self.cache.read().await;
        cache
            .get(symbol)
            .map(|entry| entry.rules.clone())
            .ok_or_else(|| BotError::FatalExchange {
                code: None,
                message: format!("symbol {} not listed by the exchange", symbol),
            })
    }

    /// Check an order against the price, lot-size and notional filters.
    pub async fn validate_order(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> BotResult<OrderValidation> {
        let rules = self.get_rules(symbol, false).await?;
        Ok(validate_against_rules(&rules, qty, price))
    }

    /// Warm the cache with every pair quoted in USDT.
    pub async fn prefetch_all_usdt_pairs(&self) -> BotResult<usize> {
        let all = self.exchange.get_exchange_info().await?;
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        let mut count = 0;
        for rules in all {
            if rules.quote_asset == "USDT" {
                cache.insert(
                    rules.symbol.clone(),
                    CachedRules {
                        rules,
                        fetched_at: now,
                    },
                );
                count += 1;
            }
        }
        info!("Prefetched trading rules for {} USDT pairs", count);
        Ok(count)
    }

    async fn refresh_all(&self) -> BotResult<()> {
        let all = self.exchange.get_exchange_info().await?;
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        for rules in all {
            cache.insert(
                rules.symbol.clone(),
                CachedRules {
                    rules,
                    fetched_at: now,
                },
            );
        }
        debug!("Trading rules cache refreshed ({} symbols)", cache.len());
        Ok(())
    }

    /// Background refresh for one symbol. Failures go to `on_error`; the
    /// cached snapshot stays in place either way.
    pub fn spawn_auto_refresh<F>(
        self: &Arc<Self>,
        symbol: String,
        interval: std::time::Duration,
        on_error: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(BotError) + Send + Sync + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.refresh_all().await {
                    warn!("Scheduled rules refresh for {} failed: {}", symbol, e);
                    on_error(e);
                }
            }
        })
    }
}

fn validate_against_rules(
    rules: &SymbolTradingRules,
    qty: Decimal,
    price: Decimal,
) -> OrderValidation {
    let mut out = OrderValidation {
        valid: true,
        ..Default::default()
    };

    // Price filter
    if price < rules.min_price {
        out.errors
            .push(format!("price {} below minimum {}", price, rules.min_price));
    }
    if price > rules.max_price {
        out.errors
            .push(format!("price {} above maximum {}", price, rules.max_price));
    }
    if let Ok(aligned) = round_price_to_tick(price, rules.tick_size) {
        if aligned != price {
            out.errors.push(format!(
                "price {} not aligned to tick {}",
                price, rules.tick_size
            ));
            out.adjusted_price = Some(aligned);
        }
    }

    // Lot size filter
    if qty < rules.min_qty {
        out.errors
            .push(format!("quantity {} below minimum {}", qty, rules.min_qty));
    }
    if qty > rules.max_qty {
        out.errors
            .push(format!("quantity {} above maximum {}", qty, rules.max_qty));
    }
    if let Ok(aligned) = round_quantity_to_step(qty, rules.step_size) {
        if aligned != qty {
            out.errors.push(format!(
                "quantity {} not aligned to step {}",
                qty, rules.step_size
            ));
            out.adjusted_qty = Some(aligned);
        }
    }

    // Notional filter
    let notional = qty * price;
    if notional < rules.min_notional {
        out.errors.push(format!(
            "notional {} below minimum {}",
            notional, rules.min_notional
        ));
        if price > Decimal::ZERO {
            out.suggested_min_qty =
                min_quantity_for_notional(rules.min_notional, price, rules.step_size).ok();
        }
    }

    out.valid = out.errors.is_empty();
    out
}

/// Standard BTCUSDT filters used across the test suite.
#[cfg(test)]
pub(crate) fn btcusdt_test_rules() -> SymbolTradingRules {
    use rust_decimal_macros::dec;
    SymbolTradingRules {
        symbol: "BTCUSDT".to_string(),
        status: "TRADING".to_string(),
        base_asset: "BTC".to_string(),
        quote_asset: "USDT".to_string(),
        base_precision: 8,
        quote_precision: 8,
        min_price: dec!(0.01),
        max_price: dec!(1000000),
        tick_size: dec!(0.01),
        min_qty: dec!(0.00001),
        max_qty: dec!(9000),
        step_size: dec!(0.00001),
        min_notional: dec!(10),
        order_types: vec!["LIMIT".to_string(), "MARKET".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeClient;
    use rust_decimal_macros::dec;

    fn btcusdt_rules() -> SymbolTradingRules {
        btcusdt_test_rules()
    }

    #[test]
    fn test_valid_order_passes_all_filters() {
        let v = validate_against_rules(&btcusdt_rules(), dec!(0.00205), dec!(48645.50));
        assert!(v.valid, "errors: {:?}", v.errors);
        assert!(v.adjusted_qty.is_none());
        assert!(v.adjusted_price.is_none());
    }

    #[test]
    fn test_misaligned_price_suggests_adjustment() {
        let v = validate_against_rules(&btcusdt_rules(), dec!(0.001), dec!(48645.505));
        assert!(!v.valid);
        assert_eq!(v.adjusted_price, Some(dec!(48645.50)));
    }

    #[test]
    fn test_below_notional_suggests_min_qty() {
        let v = validate_against_rules(&btcusdt_rules(), dec!(0.0001), dec!(48645.50));
        assert!(!v.valid);
        let suggested = v.suggested_min_qty.unwrap();
        assert!(suggested * dec!(48645.50) >= dec!(10));
    }

    #[test]
    fn test_below_min_qty_rejected() {
        let v = validate_against_rules(&btcusdt_rules(), dec!(0.000001), dec!(48645.50));
        assert!(!v.valid);
        assert!(v.errors.iter().any(|e| e.contains("below minimum")));
    }

    #[tokio::test]
    async fn test_cache_serves_fresh_without_refetch() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_exchange_info()
            .times(1)
            .returning(|| Ok(vec![btcusdt_rules()]));
        let cache = TradingRulesCache::new(Arc::new(mock));

        let first = cache.get_rules("BTCUSDT", false).await.unwrap();
        let second = cache.get_rules("BTCUSDT", false).await.unwrap();
        assert_eq!(first.symbol, second.symbol);
    }

    #[tokio::test]
    async fn test_stale_rules_survive_refresh_failure() {
        let mut mock = MockExchangeClient::new();
        let mut calls = 0;
        mock.expect_get_exchange_info().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(vec![btcusdt_rules()])
            } else {
                Err(BotError::TransientExchange {
                    code: None,
                    message: "down".to_string(),
                })
            }
        });
        // Zero TTL forces a refetch on the second call
        let cache = TradingRulesCache::with_ttl(Arc::new(mock), Duration::zero());

        cache.get_rules("BTCUSDT", false).await.unwrap();
        let rules = cache.get_rules("BTCUSDT", false).await.unwrap();
        assert_eq!(rules.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_prefetch_filters_usdt_quote() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_exchange_info().returning(|| {
            let mut btc_eur = btcusdt_rules();
            btc_eur.symbol = "BTCEUR".to_string();
            btc_eur.quote_asset = "EUR".to_string();
            let mut eth = btcusdt_rules();
            eth.symbol = "ETHUSDT".to_string();
            eth.base_asset = "ETH".to_string();
            Ok(vec![btcusdt_rules(), btc_eur, eth])
        });
        let cache = TradingRulesCache::new(Arc::new(mock));

        let count = cache.prefetch_all_usdt_pairs().await.unwrap();
        assert_eq!(count, 2);
    }
}
