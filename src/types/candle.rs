use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn change_percentage(&self) -> Decimal {
        if self.open.is_zero() {
            return Decimal::ZERO;
        }
        ((self.close - self.open) / self.open) * Decimal::from(100)
    }
}

/// Bounded FIFO window of the most recent candles. The all-time-high used as
/// the buy reference while flat is the max high over the closed subset.
#[derive(Debug, Clone)]
pub struct CandleWindow {
    candles: VecDeque<Candle>,
    max_size: usize,
}

impl CandleWindow {
    pub const ATH_LOOKBACK: usize = 20;

    pub fn new(max_size: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() >= self.max_size {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn last_close_time(&self) -> Option<DateTime<Utc>> {
        self.candles.back().map(|c| c.close_time)
    }

    /// Max high over the window. Unclosed candles are excluded: an in-flight
    /// high can still be retraced and must not anchor the reference.
    pub fn calculate_ath(&self) -> Option<Decimal> {
        self.candles
            .iter()
            .filter(|c| c.is_closed)
            .map(|c| c.high)
            .max()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(high: Decimal, minute: u32, closed: bool) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap();
        Candle {
            open_time,
            close_time: open_time + chrono::Duration::minutes(1),
            open: high - dec!(10),
            high,
            low: high - dec!(20),
            close: high - dec!(5),
            volume: dec!(1.5),
            is_closed: closed,
        }
    }

    #[test]
    fn test_window_evicts_fifo() {
        let mut window = CandleWindow::new(3);
        for i in 0..5 {
            window.push(candle(dec!(50000) + Decimal::from(i), i, true));
        }
        assert_eq!(window.len(), 3);
        // Oldest two evicted; remaining highs are 50002..50004
        assert_eq!(window.calculate_ath(), Some(dec!(50004)));
        let first = window.iter().next().unwrap();
        assert_eq!(first.high, dec!(50002));
    }

    #[test]
    fn test_ath_excludes_unclosed() {
        let mut window = CandleWindow::new(20);
        window.push(candle(dec!(50000), 0, true));
        window.push(candle(dec!(51000), 1, true));
        window.push(candle(dec!(60000), 2, false));
        assert_eq!(window.calculate_ath(), Some(dec!(51000)));
    }

    #[test]
    fn test_ath_empty_window() {
        let window = CandleWindow::new(20);
        assert_eq!(window.calculate_ath(), None);
    }
}
