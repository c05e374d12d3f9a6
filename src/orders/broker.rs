//! Broker adapter contract and a simulated broker used in the absence of
//! a real venue integration (§10 supplemental detail).

use crate::domain::{OrderSide, OrderState, OrderType};
use crate::error::AppError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct BrokerSubmission {
    pub client_idempotency_key: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct BrokerStatusSnapshot {
    pub broker_id: String,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    /// Present only for broker-side rejections, carrying the venue's
    /// reason code (§4.1 "HTTP 4xx from broker ... classified as
    /// REJECTED with the broker reason code captured").
    pub reject_reason: Option<String>,
}

/// Broker contract used by the order engine. A real implementation would
/// speak the venue's REST/FIX surface; `SimBroker` fills at the current
/// reference price to exercise the lifecycle end to end.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Submit a new order, idempotent on `client_idempotency_key`.
    async fn submit(&self, order: &BrokerSubmission) -> Result<BrokerStatusSnapshot, AppError>;
    async fn cancel(&self, broker_id: &str) -> Result<BrokerStatusSnapshot, AppError>;
    async fn poll(&self, broker_id: &str) -> Result<BrokerStatusSnapshot, AppError>;
    fn name(&self) -> &str;
}

struct SimOrder {
    broker_id: String,
    state: OrderState,
    quantity: Decimal,
    filled_quantity: Decimal,
    avg_price: Option<Decimal>,
}

/// Splits a crossing LIMIT order into two clips rather than filling it
/// atomically, the way a resting order bigger than the top of book would
/// fill against a real venue. One share doesn't usefully split.
fn first_clip(quantity: Decimal) -> Decimal {
    if quantity >= dec!(2) {
        (quantity / dec!(2)).floor()
    } else {
        quantity
    }
}

/// In-memory paper broker: fills MARKET orders immediately in full at the
/// reference price; LIMIT orders fill in one or two clips once the
/// reference price crosses the limit (large orders partially fill on
/// submit and clear the remainder on the next poll). This is the seam a
/// real broker integration replaces.
pub struct SimBroker {
    reference_prices: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<HashMap<String, SimOrder>>,
    by_idempotency_key: Mutex<HashMap<String, String>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            reference_prices: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            by_idempotency_key: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_reference_price(&self, symbol: &str, price: Decimal) {
        self.reference_prices
            .lock()
            .insert(symbol.to_uppercase(), price);
    }

    fn reference_price(&self, symbol: &str) -> Decimal {
        self.reference_prices
            .lock()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for SimBroker {
    async fn submit(&self, order: &BrokerSubmission) -> Result<BrokerStatusSnapshot, AppError> {
        if let Some(existing) = self
            .by_idempotency_key
            .lock()
            .get(&order.client_idempotency_key)
            .cloned()
        {
            let orders = self.orders.lock();
            let sim = orders.get(&existing).expect("idempotency map consistent");
            return Ok(BrokerStatusSnapshot {
                broker_id: sim.broker_id.clone(),
                state: sim.state,
                filled_quantity: sim.filled_quantity,
                avg_price: sim.avg_price,
                reject_reason: None,
            });
        }

        let broker_id = uuid::Uuid::new_v4().to_string();
        let price = self.reference_price(&order.symbol);

        let (state, filled, avg_price) = match order.order_type {
            OrderType::Market => (OrderState::Filled, order.quantity, Some(price)),
            OrderType::Limit => {
                let limit = order.limit_price.unwrap_or(price);
                let crosses = match order.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                };
                if crosses {
                    let clip = first_clip(order.quantity);
                    if clip < order.quantity {
                        (OrderState::PartiallyFilled, clip, Some(limit))
                    } else {
                        (OrderState::Filled, order.quantity, Some(limit))
                    }
                } else {
                    (OrderState::Submitted, Decimal::ZERO, None)
                }
            }
            OrderType::Stop | OrderType::StopLimit => (OrderState::Submitted, Decimal::ZERO, None),
        };

        self.orders.lock().insert(
            broker_id.clone(),
            SimOrder {
                broker_id: broker_id.clone(),
                state,
                quantity: order.quantity,
                filled_quantity: filled,
                avg_price,
            },
        );
        self.by_idempotency_key
            .lock()
            .insert(order.client_idempotency_key.clone(), broker_id.clone());

        Ok(BrokerStatusSnapshot {
            broker_id,
            state,
            filled_quantity: filled,
            avg_price,
            reject_reason: None,
        })
    }

    async fn cancel(&self, broker_id: &str) -> Result<BrokerStatusSnapshot, AppError> {
        let mut orders = self.orders.lock();
        let sim = orders
            .get_mut(broker_id)
            .ok_or_else(|| AppError::NotFound(format!("broker order {broker_id}")))?;
        if !sim.state.is_terminal() {
            sim.state = OrderState::Cancelled;
        }
        Ok(BrokerStatusSnapshot {
            broker_id: sim.broker_id.clone(),
            state: sim.state,
            filled_quantity: sim.filled_quantity,
            avg_price: sim.avg_price,
            reject_reason: None,
        })
    }

    async fn poll(&self, broker_id: &str) -> Result<BrokerStatusSnapshot, AppError> {
        let mut orders = self.orders.lock();
        let sim = orders
            .get_mut(broker_id)
            .ok_or_else(|| AppError::NotFound(format!("broker order {broker_id}")))?;
        if sim.state == OrderState::PartiallyFilled {
            // Resting liquidity for the remainder clears on the next poll.
            sim.filled_quantity = sim.quantity;
            sim.state = OrderState::Filled;
        }
        Ok(BrokerStatusSnapshot {
            broker_id: sim.broker_id.clone(),
            state: sim.state,
            filled_quantity: sim.filled_quantity,
            avg_price: sim.avg_price,
            reject_reason: None,
        })
    }

    fn name(&self) -> &str {
        "sim-broker"
    }
}
