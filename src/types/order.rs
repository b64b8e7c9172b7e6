use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M1 => "1m",
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::H1 => "1h",
            TimeFrame::H4 => "4h",
            TimeFrame::D1 => "1d",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(TimeFrame::M1),
            "5m" => Some(TimeFrame::M5),
            "15m" => Some(TimeFrame::M15),
            "1h" => Some(TimeFrame::H1),
            "4h" => Some(TimeFrame::H4),
            "1d" => Some(TimeFrame::D1),
            _ => None,
        }
    }

    pub fn to_minutes(&self) -> u64 {
        match self {
            TimeFrame::M1 => 1,
            TimeFrame::M5 => 5,
            TimeFrame::M15 => 15,
            TimeFrame::H1 => 60,
            TimeFrame::H4 => 240,
            TimeFrame::D1 => 1440,
        }
    }

    pub fn to_milliseconds(&self) -> u64 {
        self.to_minutes() * 60 * 1000
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_exchange(s: &str) -> Self {
        match s {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Expired,
        }
    }
}

/// One execution of a (possibly partially filled) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub trade_id: Option<u64>,
}

/// A prepared IOC limit order, ready for submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub client_order_id: String,
}

/// Commission totals broken out by asset. BTC-denominated fees shrink the
/// net accumulation; USDT fees are added to the cost basis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub btc: Decimal,
    pub usdt: Decimal,
    pub other: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: u64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub cummulative_quote_qty: Decimal,
    pub fills: Vec<Fill>,
    pub transact_time: DateTime<Utc>,
}

impl OrderResult {
    /// Volume-weighted average fill price; zero when nothing filled.
    pub fn avg_price(&self) -> Decimal {
        if self.executed_qty.is_zero() {
            Decimal::ZERO
        } else {
            self.cummulative_quote_qty / self.executed_qty
        }
    }

    pub fn is_filled(&self) -> bool {
        self.executed_qty > Decimal::ZERO
    }

    pub fn fee_breakdown(&self) -> FeeBreakdown {
        let mut fees = FeeBreakdown::default();
        for fill in &self.fills {
            match fill.commission_asset.as_str() {
                "BTC" => fees.btc += fill.commission,
                "USDT" => fees.usdt += fill.commission,
                _ => fees.other += fill.commission,
            }
        }
        fees
    }

    /// Primary fee for the trade record: the largest single-asset total.
    pub fn primary_fee(&self) -> (String, Decimal) {
        let fees = self.fee_breakdown();
        if fees.btc >= fees.usdt && fees.btc >= fees.other {
            ("BTC".to_string(), fees.btc)
        } else if fees.usdt >= fees.other {
            ("USDT".to_string(), fees.usdt)
        } else {
            ("OTHER".to_string(), fees.other)
        }
    }
}

/// Client order id in the `SIDE_<unixms>_<random>` shape the venue echoes
/// back, used to correlate fills with intents.
pub fn new_client_order_id(side: Side) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("{}_{}_{}", side.as_str(), Utc::now().timestamp_millis(), suffix)
}
