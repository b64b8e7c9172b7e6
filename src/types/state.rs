use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Side;

/// Below this the position is treated as fully sold and the cycle closes.
pub const DUST_BTC: Decimal = dec!(0.00000001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Ready,
    Holding,
    Paused,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Ready => "READY",
            CycleStatus::Holding => "HOLDING",
            CycleStatus::Paused => "PAUSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(CycleStatus::Ready),
            "HOLDING" => Some(CycleStatus::Holding),
            "PAUSED" => Some(CycleStatus::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Singleton persisted strategy state for one bot. Mutated only through the
/// transaction manager; `version` increases on every write and guards
/// optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    pub id: String,
    pub status: CycleStatus,
    pub capital_available: Decimal,
    pub btc_accumulated: Decimal,
    pub btc_accum_net: Decimal,
    pub purchases_remaining: u32,
    pub cost_accum_usdt: Decimal,
    pub reference_price: Option<Decimal>,
    pub ath_price: Decimal,
    pub buy_amount: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl CycleState {
    pub fn new(id: impl Into<String>, initial_capital: Decimal, max_purchases: u32) -> Self {
        Self {
            id: id.into(),
            status: CycleStatus::Ready,
            capital_available: initial_capital,
            btc_accumulated: Decimal::ZERO,
            btc_accum_net: Decimal::ZERO,
            purchases_remaining: max_purchases,
            cost_accum_usdt: Decimal::ZERO,
            reference_price: None,
            ath_price: Decimal::ZERO,
            buy_amount: Decimal::ZERO,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn is_holding(&self) -> bool {
        self.btc_accumulated > Decimal::ZERO
    }

    /// The trigger pivot: cost-weighted average while holding, ATH when flat.
    pub fn effective_reference(&self) -> Option<Decimal> {
        if self.is_holding() {
            self.reference_price
        } else {
            self.reference_price.or(if self.ath_price > Decimal::ZERO {
                Some(self.ath_price)
            } else {
                None
            })
        }
    }
}

/// Partial update applied to a `CycleState`. Carried as JSON inside WAL
/// entries so that recovery can replay the complete intended change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CycleStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capital_available: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_accumulated: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_accum_net: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchases_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_accum_usdt: Option<Decimal>,
    // Double-Option: outer None = untouched, inner None = cleared. An
    // explicit null in the JSON must come back as Some(None), not None,
    // or a WAL replay would drop the reference clear on cycle close.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub reference_price: Option<Option<Decimal>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_amount: Option<Decimal>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<Decimal>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        *self == StateChanges::default()
    }

    pub fn apply_to(&self, state: &mut CycleState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(capital) = self.capital_available {
            state.capital_available = capital;
        }
        if let Some(btc) = self.btc_accumulated {
            state.btc_accumulated = btc;
        }
        if let Some(net) = self.btc_accum_net {
            state.btc_accum_net = net;
        }
        if let Some(remaining) = self.purchases_remaining {
            state.purchases_remaining = remaining;
        }
        if let Some(cost) = self.cost_accum_usdt {
            state.cost_accum_usdt = cost;
        }
        if let Some(reference) = self.reference_price {
            state.reference_price = reference;
        }
        if let Some(ath) = self.ath_price {
            state.ath_price = ath;
        }
        if let Some(amount) = self.buy_amount {
            state.buy_amount = amount;
        }
    }
}

/// Append-only record of one executed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub cycle_id: String,
    pub side: Side,
    pub order_id: u64,
    pub client_order_id: String,
    pub status: String,
    pub executed_price: Decimal,
    pub executed_qty: Decimal,
    pub quote_qty: Decimal,
    pub fee_asset: String,
    pub fee_amount: Decimal,
    pub raw_fills: serde_json::Value,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    DriftDetected,
    CriticalError,
    BalanceMismatch,
    Manual,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::DriftDetected => "drift_detected",
            PauseReason::CriticalError => "critical_error",
            PauseReason::BalanceMismatch => "balance_mismatch",
            PauseReason::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "drift_detected" => Some(PauseReason::DriftDetected),
            "critical_error" => Some(PauseReason::CriticalError),
            "balance_mismatch" => Some(PauseReason::BalanceMismatch),
            "manual" => Some(PauseReason::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Row in `pause_states`. Status `paused` marks the single active pause;
/// resuming flips it to `active` and stamps the resume metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseEntry {
    pub id: i64,
    pub status: String,
    pub reason: PauseReason,
    pub message: String,
    pub metadata: serde_json::Value,
    pub paused_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub resume_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    Pending,
    Completed,
    Failed,
    Recovered,
    Unrecoverable,
}

impl WalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalStatus::Pending => "pending",
            WalStatus::Completed => "completed",
            WalStatus::Failed => "failed",
            WalStatus::Recovered => "recovered",
            WalStatus::Unrecoverable => "unrecoverable",
        }
    }
}

/// Intended state update, journaled to the event log before application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: i64,
    pub status: WalStatus,
    pub bot_id: String,
    pub update: StateChanges,
    pub expected_version: Option<i64>,
    pub operation: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotEventType {
    Start,
    Stop,
    Error,
    DriftHalt,
    TradeExecuted,
    TradeFailed,
    CycleComplete,
    ConfigUpdated,
    StateUpdate,
    CriticalUpdate,
    BatchUpdate,
    WriteAheadLog,
    StrategyPaused,
    StrategyResumed,
    AthUpdated,
    BuyExecuted,
}

impl BotEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotEventType::Start => "START",
            BotEventType::Stop => "STOP",
            BotEventType::Error => "ERROR",
            BotEventType::DriftHalt => "DRIFT_HALT",
            BotEventType::TradeExecuted => "TRADE_EXECUTED",
            BotEventType::TradeFailed => "TRADE_FAILED",
            BotEventType::CycleComplete => "CYCLE_COMPLETE",
            BotEventType::ConfigUpdated => "CONFIG_UPDATED",
            BotEventType::StateUpdate => "STATE_UPDATE",
            BotEventType::CriticalUpdate => "CRITICAL_UPDATE",
            BotEventType::BatchUpdate => "BATCH_UPDATE",
            BotEventType::WriteAheadLog => "WRITE_AHEAD_LOG",
            BotEventType::StrategyPaused => "STRATEGY_PAUSED",
            BotEventType::StrategyResumed => "STRATEGY_RESUMED",
            BotEventType::AthUpdated => "ATH_UPDATED",
            BotEventType::BuyExecuted => "BUY_EXECUTED",
        }
    }
}

impl fmt::Display for BotEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
