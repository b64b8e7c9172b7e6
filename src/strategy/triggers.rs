use rust_decimal::Decimal;
use tracing::debug;

use crate::config::StrategyConfig;
use crate::types::{Candle, CycleState, CycleStatus};

/// Buy predicate. Fires when price has dropped `drop_pct` below the
/// reference (weighted cost while holding, ATH while flat). Pure: balance
/// checks and order sizing happen downstream.
pub fn should_buy(state: &CycleState, config: &StrategyConfig, candle: &Candle) -> bool {
    if state.status == CycleStatus::Paused {
        return false;
    }
    if state.purchases_remaining == 0 {
        return false;
    }
    let Some(reference) = state.effective_reference() else {
        return false;
    };
    if reference <= Decimal::ZERO {
        return false;
    }

    let threshold = reference * (Decimal::ONE - config.drop_pct);
    let triggered = candle.close <= threshold;
    if triggered {
        debug!(
            "Buy trigger: close {} <= {} (ref {} - {}%)",
            candle.close,
            threshold,
            reference,
            config.drop_pct * Decimal::from(100)
        );
    }
    triggered
}

/// Sell predicate. Fires when price has risen `rise_pct` above the weighted
/// cost reference and there is anything to sell.
pub fn should_sell(state: &CycleState, config: &StrategyConfig, candle: &Candle) -> bool {
    if state.btc_accumulated <= Decimal::ZERO {
        return false;
    }
    let Some(reference) = state.reference_price else {
        return false;
    };
    if reference <= Decimal::ZERO {
        return false;
    }

    let threshold = reference * (Decimal::ONE + config.rise_pct);
    let triggered = candle.close >= threshold;
    if triggered {
        debug!(
            "Sell trigger: close {} >= {} (ref {} + {}%)",
            candle.close,
            threshold,
            reference,
            config.rise_pct * Decimal::from(100)
        );
    }
    triggered
}

/// USDT slice for the next buy:
/// `min(capital, max(capital / purchases_remaining, min_buy, min_notional))`.
/// Returns None when the result would fall below the effective minimum and
/// the trigger should be dropped for this candle.
pub fn compute_buy_amount(
    state: &CycleState,
    config: &StrategyConfig,
    exchange_min_notional: Decimal,
) -> Option<Decimal> {
    if state.purchases_remaining == 0 {
        return None;
    }

    let slice = state.capital_available / Decimal::from(state.purchases_remaining);
    let floor = config.min_buy_usdt.max(exchange_min_notional);
    let amount = state.capital_available.min(slice.max(floor));

    if amount < floor {
        debug!(
            "Buy amount {} below minimum {}, dropping trigger",
            amount, floor
        );
        return None;
    }
    Some(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn candle_at(close: Decimal) -> Candle {
        Candle {
            open_time: Utc::now(),
            close_time: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            is_closed: true,
        }
    }

    fn flat_state() -> CycleState {
        let mut state = CycleState::new("bot-1", dec!(1000), 10);
        state.ath_price = dec!(50000);
        state
    }

    fn holding_state() -> CycleState {
        let mut state = CycleState::new("bot-1", dec!(899.97), 10);
        state.status = CycleStatus::Holding;
        state.btc_accumulated = dec!(0.00205);
        state.btc_accum_net = dec!(0.00204795);
        state.cost_accum_usdt = dec!(100.03);
        state.reference_price = Some(dec!(48842.77));
        state.purchases_remaining = 9;
        state
    }

    #[test]
    fn test_buy_fires_on_three_percent_drop() {
        let state = flat_state();
        let config = StrategyConfig::default();
        // 3% below ATH 50000 is 48500
        assert!(should_buy(&state, &config, &candle_at(dec!(48500))));
        assert!(should_buy(&state, &config, &candle_at(dec!(48000))));
        assert!(!should_buy(&state, &config, &candle_at(dec!(48500.01))));
    }

    #[test]
    fn test_buy_suppressed_when_paused_or_exhausted() {
        let config = StrategyConfig::default();
        let candle = candle_at(dec!(40000));

        let mut paused = flat_state();
        paused.status = CycleStatus::Paused;
        assert!(!should_buy(&paused, &config, &candle));

        let mut exhausted = flat_state();
        exhausted.purchases_remaining = 0;
        assert!(!should_buy(&exhausted, &config, &candle));
    }

    #[test]
    fn test_buy_needs_a_reference() {
        let config = StrategyConfig::default();
        let state = CycleState::new("bot-1", dec!(1000), 10);
        // No ATH yet, no reference: nothing to measure a drop against
        assert!(!should_buy(&state, &config, &candle_at(dec!(1))));
    }

    #[test]
    fn test_sell_fires_on_three_percent_rise() {
        let state = holding_state();
        let config = StrategyConfig::default();
        // 3% above 48842.77 is 50308.0531
        assert!(should_sell(&state, &config, &candle_at(dec!(50308.06))));
        assert!(!should_sell(&state, &config, &candle_at(dec!(50308.05))));
        assert!(!should_sell(&state, &config, &candle_at(dec!(49000))));
    }

    #[test]
    fn test_sell_needs_holdings() {
        let config = StrategyConfig::default();
        let state = flat_state();
        assert!(!should_sell(&state, &config, &candle_at(dec!(100000))));
    }

    #[test]
    fn test_buy_amount_even_slice() {
        let state = flat_state();
        let config = StrategyConfig::default();
        // 1000 / 10 = 100, above both minimums
        assert_eq!(
            compute_buy_amount(&state, &config, dec!(10)),
            Some(dec!(100))
        );
    }

    #[test]
    fn test_buy_amount_floors_at_minimum() {
        let mut state = flat_state();
        state.capital_available = dec!(50);
        state.purchases_remaining = 10;
        let config = StrategyConfig::default();
        // Slice of 5 lifts to the min_buy floor of 10
        assert_eq!(compute_buy_amount(&state, &config, dec!(5)), Some(dec!(10)));
    }

    #[test]
    fn test_buy_amount_capped_by_capital() {
        let mut state = flat_state();
        state.capital_available = dec!(12);
        state.purchases_remaining = 1;
        let config = StrategyConfig::default();
        assert_eq!(compute_buy_amount(&state, &config, dec!(10)), Some(dec!(12)));
    }

    #[test]
    fn test_buy_amount_dropped_below_minimum() {
        let mut state = flat_state();
        state.capital_available = dec!(8);
        state.purchases_remaining = 3;
        let config = StrategyConfig::default();
        // Capital itself is below the 10 USDT floor
        assert_eq!(compute_buy_amount(&state, &config, dec!(10)), None);
    }

    #[test]
    fn test_buy_amount_respects_exchange_notional() {
        let mut state = flat_state();
        state.capital_available = dec!(100);
        state.purchases_remaining = 10;
        let config = StrategyConfig::default();
        // Slice 10 and min_buy 10, but venue wants 15
        assert_eq!(
            compute_buy_amount(&state, &config, dec!(15)),
            Some(dec!(15))
        );
    }
}
