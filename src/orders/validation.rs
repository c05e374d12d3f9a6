//! Order validation rules (§4.1), run in the documented order. Each rule
//! short-circuits on the first failure; warnings are non-fatal and
//! returned alongside a valid order spec.

use crate::domain::{Holding, OrderSide, OrderType, TimeInForce};
use crate::error::AppError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    LimitFarFromMarket,
    NotionalOverHalfAccountValue,
}

pub struct ValidationContext {
    pub reference_price: Decimal,
    pub buying_power: Decimal,
    pub available_position_quantity: Decimal,
    pub account_value: Decimal,
}

/// Normalizes `spec.symbol` and runs rules (1)-(7) in order. On success,
/// returns the (possibly-normalized) spec plus any non-fatal warnings.
pub fn validate_order(
    mut spec: OrderSpec,
    ctx: &ValidationContext,
) -> Result<(OrderSpec, Vec<ValidationWarning>), AppError> {
    // (1) quantity > 0
    if spec.quantity <= Decimal::ZERO {
        return Err(AppError::InvalidOrder("quantity must be > 0".to_string()));
    }

    // (2) symbol non-empty and normalized
    let symbol = Holding::normalize_symbol(&spec.symbol);
    if symbol.is_empty() {
        return Err(AppError::InvalidOrder("symbol must not be empty".to_string()));
    }
    spec.symbol = symbol;

    // (3) LIMIT/STOP_LIMIT require limit price > 0
    if matches!(spec.order_type, OrderType::Limit | OrderType::StopLimit) {
        match spec.limit_price {
            Some(p) if p > Decimal::ZERO => {}
            _ => {
                return Err(AppError::InvalidOrder(
                    "limit order requires a limit price > 0".to_string(),
                ))
            }
        }
    }

    // (4) STOP/STOP_LIMIT require stop price > 0
    if matches!(spec.order_type, OrderType::Stop | OrderType::StopLimit) {
        match spec.stop_price {
            Some(p) if p > Decimal::ZERO => {}
            _ => {
                return Err(AppError::InvalidOrder(
                    "stop order requires a stop price > 0".to_string(),
                ))
            }
        }
    }

    let estimate_price = spec.limit_price.unwrap_or(ctx.reference_price);
    let notional = spec.quantity * estimate_price;

    // (5) BUY: estimated notional <= buying power
    if spec.side == OrderSide::Buy && notional > ctx.buying_power {
        return Err(AppError::InsufficientFunds {
            need: notional,
            have: ctx.buying_power,
        });
    }

    // (6) SELL: available position quantity >= order quantity
    if spec.side == OrderSide::Sell && ctx.available_position_quantity < spec.quantity {
        return Err(AppError::InsufficientShares {
            need: spec.quantity,
            have: ctx.available_position_quantity,
        });
    }

    // (7) time-in-force compatible with order type
    if matches!(spec.time_in_force, TimeInForce::Ioc | TimeInForce::Fok)
        && !matches!(spec.order_type, OrderType::Limit | OrderType::Market)
    {
        return Err(AppError::InvalidOrder(
            "IOC/FOK require LIMIT or MARKET order type".to_string(),
        ));
    }

    let mut warnings = Vec::new();
    if let Some(limit) = spec.limit_price {
        let deviation = ((limit - ctx.reference_price) / ctx.reference_price).abs();
        if deviation > dec!(0.05) {
            warnings.push(ValidationWarning::LimitFarFromMarket);
        }
    }
    if ctx.account_value > Decimal::ZERO && notional > ctx.account_value * dec!(0.5) {
        warnings.push(ValidationWarning::NotionalOverHalfAccountValue);
    }

    Ok((spec, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ValidationContext {
        ValidationContext {
            reference_price: dec!(150),
            buying_power: dec!(5000),
            available_position_quantity: dec!(100),
            account_value: dec!(10000),
        }
    }

    fn base_spec() -> OrderSpec {
        OrderSpec {
            symbol: "aapl".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
        }
    }

    #[test]
    fn normalizes_symbol_and_passes() {
        let (spec, warnings) = validate_order(base_spec(), &ctx()).unwrap();
        assert_eq!(spec.symbol, "AAPL");
        assert!(warnings.is_empty());
    }

    #[test]
    fn rejects_zero_quantity() {
        let mut spec = base_spec();
        spec.quantity = Decimal::ZERO;
        assert!(validate_order(spec, &ctx()).is_err());
    }

    #[test]
    fn rejects_buy_over_buying_power() {
        let mut spec = base_spec();
        spec.quantity = dec!(1000);
        let err = validate_order(spec, &ctx()).unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));
    }

    #[test]
    fn rejects_sell_over_available_shares() {
        let mut spec = base_spec();
        spec.side = OrderSide::Sell;
        spec.quantity = dec!(1000);
        let err = validate_order(spec, &ctx()).unwrap_err();
        assert!(matches!(err, AppError::InsufficientShares { .. }));
    }

    #[test]
    fn rejects_ioc_stop_order() {
        let mut spec = base_spec();
        spec.order_type = OrderType::Stop;
        spec.stop_price = Some(dec!(140));
        spec.time_in_force = TimeInForce::Ioc;
        assert!(validate_order(spec, &ctx()).is_err());
    }

    #[test]
    fn warns_on_limit_far_from_market() {
        let mut spec = base_spec();
        spec.order_type = OrderType::Limit;
        spec.limit_price = Some(dec!(200));
        let (_, warnings) = validate_order(spec, &ctx()).unwrap();
        assert!(warnings.contains(&ValidationWarning::LimitFarFromMarket));
    }
}
