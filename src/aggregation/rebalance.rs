//! Rebalance recommendations (§4.2, §8 Scenario 5): compares a strategy's
//! target weights against the portfolio's current market-value weights and
//! flags symbols that have drifted past the strategy's threshold.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{OrderSide, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RebalancePriority {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceRecommendation {
    pub symbol: String,
    pub side: OrderSide,
    pub target_weight_pct: Decimal,
    pub current_weight_pct: Decimal,
    pub drift_pct: Decimal,
    pub priority: RebalancePriority,
}

/// Pure drift computation. `drift_pct = current% - target%`; a BUY
/// recommendation means the position is underweight (drift negative), SELL
/// means overweight (drift positive). A symbol only produces a
/// recommendation once its absolute drift exceeds the strategy's
/// threshold; priority is HIGH once the drift exceeds twice the threshold,
/// MEDIUM otherwise.
pub fn compute_recommendations(
    strategy: &Strategy,
    current_weights_pct: &HashMap<String, Decimal>,
) -> Vec<RebalanceRecommendation> {
    let mut out = Vec::new();
    for holding in &strategy.holdings {
        let target_pct = holding.target_weight * dec!(100);
        let current_pct = current_weights_pct
            .get(&holding.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let drift_pct = current_pct - target_pct;
        if drift_pct.abs() <= strategy.drift_threshold_pct {
            continue;
        }
        let side = if drift_pct < Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let priority = if drift_pct.abs() > strategy.drift_threshold_pct * dec!(2) {
            RebalancePriority::High
        } else {
            RebalancePriority::Medium
        };
        out.push(RebalanceRecommendation {
            symbol: holding.symbol.clone(),
            side,
            target_weight_pct: target_pct,
            current_weight_pct: current_pct,
            drift_pct,
            priority,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StrategyHolding;
    use uuid::Uuid;

    fn strategy(threshold: Decimal, holdings: Vec<(&str, Decimal)>) -> Strategy {
        Strategy {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test".to_string(),
            holdings: holdings
                .into_iter()
                .map(|(symbol, target_weight)| StrategyHolding {
                    symbol: symbol.to_string(),
                    target_weight,
                })
                .collect(),
            drift_threshold_pct: threshold,
        }
    }

    #[test]
    fn overweight_past_threshold_recommends_sell() {
        let strat = strategy(dec!(5), vec![("AAPL", dec!(0.60))]);
        let current = HashMap::from([("AAPL".to_string(), dec!(68))]);
        let recs = compute_recommendations(&strat, &current);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].side, OrderSide::Sell);
        assert_eq!(recs[0].drift_pct, dec!(8));
        assert_eq!(recs[0].priority, RebalancePriority::Medium);
    }

    #[test]
    fn drift_past_double_threshold_is_high_priority() {
        let strat = strategy(dec!(5), vec![("AAPL", dec!(0.60))]);
        let current = HashMap::from([("AAPL".to_string(), dec!(75))]);
        let recs = compute_recommendations(&strat, &current);
        assert_eq!(recs[0].priority, RebalancePriority::High);
    }

    #[test]
    fn underweight_past_threshold_recommends_buy() {
        let strat = strategy(dec!(5), vec![("AAPL", dec!(0.60))]);
        let current = HashMap::from([("AAPL".to_string(), dec!(50))]);
        let recs = compute_recommendations(&strat, &current);
        assert_eq!(recs[0].side, OrderSide::Buy);
        assert_eq!(recs[0].drift_pct, dec!(-10));
    }

    #[test]
    fn drift_within_threshold_produces_no_recommendation() {
        let strat = strategy(dec!(5), vec![("AAPL", dec!(0.60))]);
        let current = HashMap::from([("AAPL".to_string(), dec!(63))]);
        assert!(compute_recommendations(&strat, &current).is_empty());
    }

    #[test]
    fn symbol_absent_from_portfolio_is_fully_underweight() {
        let strat = strategy(dec!(5), vec![("MSFT", dec!(0.20))]);
        let recs = compute_recommendations(&strat, &HashMap::new());
        assert_eq!(recs[0].side, OrderSide::Buy);
        assert_eq!(recs[0].drift_pct, dec!(-20));
    }
}
