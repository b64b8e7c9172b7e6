#![allow(dead_code)]
use rust_decimal::Decimal;

use crate::error::{BotError, BotResult};
use crate::types::Side;

/// Round a price down to the exchange tick size: `floor(p / tick) * tick`.
pub fn round_price_to_tick(price: Decimal, tick: Decimal) -> BotResult<Decimal> {
    if tick <= Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "tick size must be positive, got {}",
            tick
        )));
    }
    if price < Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "price must be non-negative, got {}",
            price
        )));
    }
    Ok((price / tick).floor() * tick)
}

/// Round a quantity down to the exchange step size: `floor(q / step) * step`.
pub fn round_quantity_to_step(qty: Decimal, step: Decimal) -> BotResult<Decimal> {
    if step <= Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "step size must be positive, got {}",
            step
        )));
    }
    if qty < Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "quantity must be non-negative, got {}",
            qty
        )));
    }
    Ok((qty / step).floor() * step)
}

/// Minimum quantity that satisfies `min_notional` at `price`, rounded **up**
/// to the next step. This is the only place rounding goes up; a floor here
/// would produce an order the venue rejects as below notional.
pub fn min_quantity_for_notional(
    min_notional: Decimal,
    price: Decimal,
    step: Decimal,
) -> BotResult<Decimal> {
    if price <= Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "price must be positive, got {}",
            price
        )));
    }
    if step <= Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "step size must be positive, got {}",
            step
        )));
    }
    let raw = min_notional / price;
    Ok((raw / step).ceil() * step)
}

/// Slippage-adjusted limit price: buys pay up, sells give way.
/// `slippage_pct` is a fraction (0.003 = 0.3%).
pub fn apply_slippage(price: Decimal, slippage_pct: Decimal, side: Side) -> BotResult<Decimal> {
    if slippage_pct < Decimal::ZERO {
        return Err(BotError::InvalidInput(format!(
            "slippage must be non-negative, got {}",
            slippage_pct
        )));
    }
    let adjusted = match side {
        Side::Buy => price * (Decimal::ONE + slippage_pct),
        Side::Sell => price * (Decimal::ONE - slippage_pct),
    };
    Ok(adjusted)
}

pub fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.max(min).min(max)
}
