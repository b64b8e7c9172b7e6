use rust_decimal::Decimal;
use tracing::warn;

use crate::error::{BotError, BotResult};
use crate::types::{CycleState, CycleStatus, OrderResult, StateChanges, DUST_BTC};

/// Result of folding a buy fill into the cycle.
#[derive(Debug, Clone)]
pub struct BuyOutcome {
    pub changes: StateChanges,
    pub cost_paid: Decimal,
    pub btc_net: Decimal,
    pub new_reference: Decimal,
}

/// Result of folding a sell fill into the cycle.
#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub changes: StateChanges,
    pub net_usdt: Decimal,
    pub principal: Decimal,
    /// Clamped at zero for the books; `shortfall` carries the anomaly.
    pub profit: Decimal,
    /// Set when the arithmetic came out negative. The clamp above is only a
    /// display value; a shortfall means internal state has diverged from the
    /// venue and the caller must escalate to a pause.
    pub shortfall: Option<Decimal>,
    pub cycle_closed: bool,
}

/// Fold a filled buy order into the cycle state.
///
/// Gross BTC accumulates as executed; the net column subtracts
/// BTC-denominated commission. USDT commission is part of the cost basis,
/// which keeps `reference = cost_accum / btc_accum_net` the true break-even.
pub fn apply_buy(state: &CycleState, result: &OrderResult) -> BotResult<BuyOutcome> {
    if result.executed_qty <= Decimal::ZERO {
        return Err(BotError::InvalidInput(
            "apply_buy called with no executed quantity".to_string(),
        ));
    }

    let fees = result.fee_breakdown();
    let btc_net = result.executed_qty - fees.btc;
    let cost_paid = result.cummulative_quote_qty + fees.usdt;

    let btc_accumulated = state.btc_accumulated + result.executed_qty;
    let btc_accum_net = state.btc_accum_net + btc_net;
    let cost_accum_usdt = state.cost_accum_usdt + cost_paid;

    let mut capital_available = state.capital_available - cost_paid;
    if capital_available < Decimal::ZERO {
        warn!(
            "Buy cost {} exceeded tracked capital {}, clamping to zero",
            cost_paid, state.capital_available
        );
        capital_available = Decimal::ZERO;
    }

    if btc_accum_net <= Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "net accumulation not positive after buy: {}",
            btc_accum_net
        )));
    }
    let new_reference = cost_accum_usdt / btc_accum_net;

    let changes = StateChanges {
        status: Some(CycleStatus::Holding),
        capital_available: Some(capital_available),
        btc_accumulated: Some(btc_accumulated),
        btc_accum_net: Some(btc_accum_net),
        purchases_remaining: Some(state.purchases_remaining.saturating_sub(1)),
        cost_accum_usdt: Some(cost_accum_usdt),
        reference_price: Some(Some(new_reference)),
        ..Default::default()
    };

    Ok(BuyOutcome {
        changes,
        cost_paid,
        btc_net,
        new_reference,
    })
}

/// Fold a filled sell order into the cycle state.
///
/// A full fill (or a remainder below dust) closes the cycle: accumulation
/// and cost reset, purchases are restored and the proceeds return to
/// capital. A partial IOC fill keeps the cycle holding with the reference
/// untouched so the next candle re-evaluates the sell.
pub fn apply_sell(
    state: &CycleState,
    result: &OrderResult,
    max_purchases: u32,
) -> BotResult<SellOutcome> {
    if result.executed_qty <= Decimal::ZERO {
        return Err(BotError::InvalidInput(
            "apply_sell called with no executed quantity".to_string(),
        ));
    }
    let reference = state.reference_price.ok_or_else(|| {
        BotError::InvalidInput("cannot sell without a reference price".to_string())
    })?;

    let fees = result.fee_breakdown();
    let avg_price = result.avg_price();
    let principal = reference * result.executed_qty;
    let net_usdt = result.cummulative_quote_qty - fees.usdt - fees.btc * avg_price;

    let raw_profit = net_usdt - principal;
    let (profit, shortfall) = if raw_profit < Decimal::ZERO {
        warn!(
            "Sell netted {} against principal {}: shortfall {}",
            net_usdt, principal, -raw_profit
        );
        (Decimal::ZERO, Some(-raw_profit))
    } else {
        (raw_profit, None)
    };

    let remaining = state.btc_accumulated - result.executed_qty;
    let capital_available = state.capital_available + net_usdt;

    let (changes, cycle_closed) = if remaining < DUST_BTC {
        (
            StateChanges {
                status: Some(CycleStatus::Ready),
                capital_available: Some(capital_available),
                btc_accumulated: Some(Decimal::ZERO),
                btc_accum_net: Some(Decimal::ZERO),
                purchases_remaining: Some(max_purchases),
                cost_accum_usdt: Some(Decimal::ZERO),
                reference_price: Some(None),
                ..Default::default()
            },
            true,
        )
    } else {
        (
            StateChanges {
                status: Some(CycleStatus::Holding),
                capital_available: Some(capital_available),
                btc_accumulated: Some(remaining),
                ..Default::default()
            },
            false,
        )
    };

    Ok(SellOutcome {
        changes,
        net_usdt,
        principal,
        profit,
        shortfall,
        cycle_closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fill, OrderStatus, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(
        side: Side,
        qty: Decimal,
        quote: Decimal,
        fee: Decimal,
        fee_asset: &str,
    ) -> OrderResult {
        OrderResult {
            order_id: 1,
            client_order_id: format!("{}_1_123456", side.as_str()),
            symbol: "BTCUSDT".to_string(),
            side,
            status: OrderStatus::Filled,
            executed_qty: qty,
            cummulative_quote_qty: quote,
            fills: vec![Fill {
                price: if qty.is_zero() { Decimal::ZERO } else { quote / qty },
                qty,
                commission: fee,
                commission_asset: fee_asset.to_string(),
                trade_id: Some(1),
            }],
            transact_time: Utc::now(),
        }
    }

    fn fresh_state() -> CycleState {
        let mut state = CycleState::new("bot-1", dec!(1000), 10);
        state.ath_price = dec!(50000);
        state.reference_price = Some(dec!(50000));
        state
    }

    #[test]
    fn test_first_buy_folds_fees_into_reference() {
        let state = fresh_state();
        // 0.00205 BTC at 48645.50, 0.1% fee in BTC
        let result = order(
            Side::Buy,
            dec!(0.00205),
            dec!(99.7232750),
            dec!(0.00000205),
            "BTC",
        );

        let outcome = apply_buy(&state, &result).unwrap();
        assert_eq!(outcome.changes.btc_accumulated, Some(dec!(0.00205)));
        assert_eq!(outcome.changes.btc_accum_net, Some(dec!(0.00204795)));
        assert_eq!(outcome.changes.cost_accum_usdt, Some(dec!(99.7232750)));
        assert_eq!(
            outcome.changes.capital_available,
            Some(dec!(1000) - dec!(99.7232750))
        );
        assert_eq!(outcome.changes.purchases_remaining, Some(9));
        assert_eq!(outcome.changes.status, Some(CycleStatus::Holding));

        // Reference is exactly cost over net accumulation
        let reference = outcome.changes.reference_price.unwrap().unwrap();
        assert_eq!(reference, dec!(99.7232750) / dec!(0.00204795));
    }

    #[test]
    fn test_buy_with_usdt_fee_adds_to_cost() {
        let state = fresh_state();
        let result = order(Side::Buy, dec!(0.002), dec!(100), dec!(0.1), "USDT");

        let outcome = apply_buy(&state, &result).unwrap();
        assert_eq!(outcome.cost_paid, dec!(100.1));
        assert_eq!(outcome.changes.btc_accum_net, Some(dec!(0.002)));
        assert_eq!(outcome.changes.capital_available, Some(dec!(899.9)));
    }

    #[test]
    fn test_buy_reference_matches_cost_over_net_across_sequence() {
        let mut state = fresh_state();
        let buys = [
            (dec!(0.00205), dec!(99.7232750), dec!(0.00000205)),
            (dec!(0.00210), dec!(97.4400000), dec!(0.00000210)),
            (dec!(0.00215), dec!(95.6100000), dec!(0.00000215)),
        ];
        for (qty, quote, fee) in buys {
            let result = order(Side::Buy, qty, quote, fee, "BTC");
            let outcome = apply_buy(&state, &result).unwrap();
            outcome.changes.apply_to(&mut state);

            assert!(state.capital_available >= Decimal::ZERO);
            assert_eq!(
                state.reference_price.unwrap(),
                state.cost_accum_usdt / state.btc_accum_net
            );
        }
        assert_eq!(state.purchases_remaining, 7);
    }

    #[test]
    fn test_buy_rejects_empty_fill() {
        let state = fresh_state();
        let result = order(Side::Buy, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, "BTC");
        assert!(apply_buy(&state, &result).is_err());
    }

    fn holding_state() -> CycleState {
        let mut state = CycleState::new("bot-1", dec!(900.276725), 10);
        state.status = CycleStatus::Holding;
        state.btc_accumulated = dec!(0.00205);
        state.btc_accum_net = dec!(0.00204795);
        state.cost_accum_usdt = dec!(99.7232750);
        state.reference_price = Some(dec!(99.7232750) / dec!(0.00204795));
        state.purchases_remaining = 9;
        state
    }

    #[test]
    fn test_full_sell_closes_cycle() {
        let state = holding_state();
        // Sell all 0.00205 at ~50157, fee in USDT
        let result = order(
            Side::Sell,
            dec!(0.00205),
            dec!(102.82185),
            dec!(0.103),
            "USDT",
        );

        let outcome = apply_sell(&state, &result, 10).unwrap();
        assert!(outcome.cycle_closed);
        assert!(outcome.shortfall.is_none());
        assert!(outcome.profit > Decimal::ZERO);

        let net = dec!(102.82185) - dec!(0.103);
        assert_eq!(outcome.net_usdt, net);
        assert_eq!(
            outcome.changes.capital_available,
            Some(dec!(900.276725) + net)
        );
        assert_eq!(outcome.changes.status, Some(CycleStatus::Ready));
        assert_eq!(outcome.changes.btc_accumulated, Some(Decimal::ZERO));
        assert_eq!(outcome.changes.btc_accum_net, Some(Decimal::ZERO));
        assert_eq!(outcome.changes.cost_accum_usdt, Some(Decimal::ZERO));
        assert_eq!(outcome.changes.purchases_remaining, Some(10));
        assert_eq!(outcome.changes.reference_price, Some(None));
    }

    #[test]
    fn test_partial_sell_keeps_holding() {
        let state = holding_state();
        // IOC filled 0.00100 of the 0.00205 intent at 50150
        let result = order(Side::Sell, dec!(0.00100), dec!(50.150), dec!(0.05), "USDT");

        let outcome = apply_sell(&state, &result, 10).unwrap();
        assert!(!outcome.cycle_closed);
        assert_eq!(outcome.changes.status, Some(CycleStatus::Holding));
        assert_eq!(outcome.changes.btc_accumulated, Some(dec!(0.00105)));
        // Cost basis and reference stay for the next evaluation
        assert_eq!(outcome.changes.btc_accum_net, None);
        assert_eq!(outcome.changes.cost_accum_usdt, None);
        assert_eq!(outcome.changes.reference_price, None);
        assert_eq!(
            outcome.changes.capital_available,
            Some(dec!(900.276725) + outcome.net_usdt)
        );
    }

    #[test]
    fn test_sell_remainder_below_dust_closes() {
        let mut state = holding_state();
        state.btc_accumulated = dec!(0.00205000);
        // Fill leaves 0.000000005 BTC, below the 1e-8 dust line
        let result = order(
            Side::Sell,
            dec!(0.002049995),
            dec!(102.82),
            Decimal::ZERO,
            "USDT",
        );
        let outcome = apply_sell(&state, &result, 10).unwrap();
        assert!(outcome.cycle_closed);
    }

    #[test]
    fn test_sell_shortfall_clamps_and_flags() {
        let state = holding_state();
        // Price collapsed: proceeds below principal
        let result = order(Side::Sell, dec!(0.00205), dec!(90), dec!(0.09), "USDT");

        let outcome = apply_sell(&state, &result, 10).unwrap();
        assert_eq!(outcome.profit, Decimal::ZERO);
        let shortfall = outcome.shortfall.unwrap();
        assert!(shortfall > Decimal::ZERO);
        // Proceeds still return to capital; the pause handles the anomaly
        assert_eq!(
            outcome.changes.capital_available,
            Some(dec!(900.276725) + outcome.net_usdt)
        );
    }

    #[test]
    fn test_sell_with_btc_fee_prices_it_at_avg() {
        let state = holding_state();
        let result = order(
            Side::Sell,
            dec!(0.00205),
            dec!(102.82185),
            dec!(0.00000205),
            "BTC",
        );

        let outcome = apply_sell(&state, &result, 10).unwrap();
        let avg = dec!(102.82185) / dec!(0.00205);
        assert_eq!(outcome.net_usdt, dec!(102.82185) - dec!(0.00000205) * avg);
    }

    #[test]
    fn test_sell_requires_reference() {
        let mut state = holding_state();
        state.reference_price = None;
        let result = order(Side::Sell, dec!(0.001), dec!(50), Decimal::ZERO, "USDT");
        assert!(apply_sell(&state, &result, 10).is_err());
    }
}
