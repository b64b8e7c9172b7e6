use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{BotError, BotResult};
use crate::types::TimeFrame;

/// Strategy knobs, persisted in the `strategy_config` row with
/// `is_active = true`. Immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub drop_pct: Decimal,
    pub rise_pct: Decimal,
    pub max_purchases: u32,
    pub min_buy_usdt: Decimal,
    pub initial_capital_usdt: Decimal,
    pub slippage_buy_pct: Decimal,
    pub slippage_sell_pct: Decimal,
    pub is_active: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: TimeFrame::H1,
            drop_pct: dec!(0.03),
            rise_pct: dec!(0.03),
            max_purchases: 10,
            min_buy_usdt: dec!(10),
            initial_capital_usdt: dec!(1000),
            slippage_buy_pct: dec!(0.003),
            slippage_sell_pct: dec!(0.003),
            is_active: true,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbol.is_empty() {
            errors.push("symbol must not be empty".to_string());
        }
        if self.drop_pct < dec!(0.02) || self.drop_pct > dec!(0.08) {
            errors.push(format!(
                "drop_pct must be between 0.02 and 0.08, got {}",
                self.drop_pct
            ));
        }
        if self.rise_pct < dec!(0.02) || self.rise_pct > dec!(0.08) {
            errors.push(format!(
                "rise_pct must be between 0.02 and 0.08, got {}",
                self.rise_pct
            ));
        }
        if self.max_purchases == 0 || self.max_purchases > 30 {
            errors.push(format!(
                "max_purchases must be between 1 and 30, got {}",
                self.max_purchases
            ));
        }
        if self.min_buy_usdt < dec!(10) {
            errors.push(format!(
                "min_buy_usdt must be at least 10, got {}",
                self.min_buy_usdt
            ));
        }
        if self.initial_capital_usdt <= Decimal::ZERO {
            errors.push(format!(
                "initial_capital_usdt must be positive, got {}",
                self.initial_capital_usdt
            ));
        }
        for (name, slip) in [
            ("slippage_buy_pct", self.slippage_buy_pct),
            ("slippage_sell_pct", self.slippage_sell_pct),
        ] {
            if slip < Decimal::ZERO || slip > dec!(0.1) {
                errors.push(format!("{} must be between 0 and 0.1, got {}", name, slip));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Monitoring knobs. Drift thresholds are deliberately configurable; the
/// dust constant doubles as the BTC drift tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub drift_usdt_threshold: Decimal,
    pub drift_btc_dust: Decimal,
    pub health_check_secs: u64,
    pub staleness_alert_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            drift_usdt_threshold: dec!(0.005),
            drift_btc_dust: dec!(0.00000001),
            health_check_secs: 60,
            staleness_alert_secs: 300,
        }
    }
}

/// Process-level configuration sourced from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub api_secret: String,
    pub database_url: String,
    pub initial_capital_usdt: Decimal,
    pub webhook_url: Option<String>,
    pub bot_id: String,
    pub use_testnet: bool,
    pub monitoring: MonitoringConfig,
}

impl AppConfig {
    /// Load from the environment (after dotenvy has populated it).
    pub fn from_env() -> BotResult<Self> {
        let api_key = require_env("BINANCE_API_KEY")?;
        let api_secret = require_env("BINANCE_API_SECRET")?;
        let database_url = require_env("DATABASE_URL")?;
        let capital_raw = require_env("INITIAL_CAPITAL_USDT")?;
        let initial_capital_usdt = capital_raw.parse::<Decimal>().map_err(|_| {
            BotError::Config(format!(
                "INITIAL_CAPITAL_USDT is not a valid decimal: {}",
                capital_raw
            ))
        })?;

        Ok(Self {
            api_key,
            api_secret,
            database_url,
            initial_capital_usdt,
            webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok(),
            bot_id: std::env::var("BOT_ID").unwrap_or_else(|_| "dca-bot".to_string()),
            use_testnet: std::env::var("USE_TESTNET")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            monitoring: MonitoringConfig::default(),
        })
    }
}

fn require_env(key: &str) -> BotResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BotError::Config(format!("missing required environment variable {}", key)))
}
