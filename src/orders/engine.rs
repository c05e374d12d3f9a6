//! Order Lifecycle Engine (§4.1): validates, routes, tracks, retries,
//! reconciles, and expires orders against a broker adapter.

use super::broker::{BrokerAdapter, BrokerStatusSnapshot, BrokerSubmission};
use super::validation::{validate_order, OrderSpec, ValidationContext, ValidationWarning};
use crate::concurrency::KeyedLocks;
use crate::domain::{Holding, Order, OrderSide, OrderState, TimeInForce};
use crate::error::AppError;
use crate::events::{DomainEvent, EventBus};
use crate::market_data::MarketDataCache;
use crate::reliability::{retry, BreakerRegistry, RetryPolicy};
use crate::store::orders::OrderFilters;
use crate::store::Store;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct OrderEngine {
    store: Store,
    bus: EventBus,
    broker: Arc<dyn BrokerAdapter>,
    breakers: BreakerRegistry,
    retry_policy: RetryPolicy,
    market_data: Arc<MarketDataCache>,
    order_locks: KeyedLocks<Uuid>,
    account_locks: Arc<KeyedLocks<Uuid>>,
}

pub struct SubmitOutcome {
    pub order: Order,
    pub warnings: Vec<ValidationWarning>,
}

impl OrderEngine {
    pub fn new(
        store: Store,
        bus: EventBus,
        broker: Arc<dyn BrokerAdapter>,
        breakers: BreakerRegistry,
        market_data: Arc<MarketDataCache>,
    ) -> Self {
        Self {
            store,
            bus,
            broker,
            breakers,
            retry_policy: RetryPolicy::default(),
            market_data,
            order_locks: KeyedLocks::new(),
            account_locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub async fn submit_order(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        spec: OrderSpec,
        idempotency_key: Option<String>,
    ) -> Result<SubmitOutcome, AppError> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.store.get_order_by_idempotency_key(key).await? {
                info!(order_id = %existing.id, "idempotent resubmit returned existing order");
                return Ok(SubmitOutcome {
                    order: existing,
                    warnings: Vec::new(),
                });
            }
        }

        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {account_id}")))?;
        if account.user_id != user_id {
            return Err(AppError::NotFound(format!("account {account_id}")));
        }

        let symbol = Holding::normalize_symbol(&spec.symbol);
        let reference_price = self
            .market_data
            .get(&symbol)
            .or(spec.limit_price)
            .unwrap_or(Decimal::ZERO);

        let holdings = self.store.list_holdings_for_account(account_id).await?;
        let position_qty = holdings
            .iter()
            .find(|h| h.symbol == symbol)
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO);
        let reserved = self
            .store
            .reserved_sell_quantity(account_id, &symbol, None)
            .await?;

        let ctx = ValidationContext {
            reference_price,
            buying_power: account.available_balance,
            available_position_quantity: position_qty - reserved,
            account_value: account.current_balance,
        };

        let (spec, warnings) = validate_order(spec, &ctx)?;

        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4(),
            user_id,
            account_id,
            symbol: spec.symbol.clone(),
            side: spec.side,
            quantity: spec.quantity,
            order_type: spec.order_type,
            limit_price: spec.limit_price,
            stop_price: spec.stop_price,
            time_in_force: spec.time_in_force,
            state: OrderState::Pending,
            broker_id: None,
            client_idempotency_key: key,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            submitted_at: None,
            last_updated_at: now,
            retry_count: 0,
            last_error: None,
        };

        // Persisted before the broker call so a retried or adopted submit
        // never duplicates (§4.1 partial-failure contract).
        self.store.insert_order(&order).await?;

        self.attempt_broker_submit(&mut order).await;
        self.store.save_order(&order).await?;

        Ok(SubmitOutcome { order, warnings })
    }

    async fn attempt_broker_submit(&self, order: &mut Order) {
        let breaker = self.breakers.get(self.broker.name());
        if !breaker.allow_request() {
            order.last_error = Some("broker circuit open".to_string());
            warn!(order_id = %order.id, "broker circuit open, order remains PENDING");
            return;
        }

        let submission = BrokerSubmission {
            client_idempotency_key: order.client_idempotency_key.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            order_type: order.order_type,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
        };

        let broker = self.broker.clone();
        let result = retry(&self.retry_policy, || {
            let submission = submission.clone();
            let broker = broker.clone();
            async move { broker.submit(&submission).await }
        })
        .await;

        match result {
            Ok(snapshot) => {
                breaker.record_success();
                order.submitted_at = Some(Utc::now());
                self.apply_snapshot(order, snapshot);
            }
            Err(err) => {
                breaker.record_failure();
                order.retry_count += 1;
                order.last_error = Some(err.to_string());
                if !err.is_retriable() {
                    order.state = OrderState::Rejected;
                }
            }
        }
    }

    /// Applies a broker snapshot to an order in place, per the idempotent
    /// ingest contract in §4.1: `Δfilled` drives the balance adjustment and
    /// duplicate/regressed snapshots are no-ops.
    fn apply_snapshot(&self, order: &mut Order, snapshot: BrokerStatusSnapshot) {
        if order.broker_id.is_none() {
            order.broker_id = Some(snapshot.broker_id);
        }

        if order.state.is_terminal() {
            return;
        }

        let delta = snapshot.filled_quantity - order.filled_quantity;
        if delta < Decimal::ZERO {
            warn!(
                order_id = %order.id,
                recorded = %order.filled_quantity,
                snapshot = %snapshot.filled_quantity,
                "broker reported lower filled quantity than recorded; protocol violation, ignoring"
            );
            return;
        }

        let mut next_state = snapshot.state;
        if matches!(order.time_in_force, TimeInForce::Ioc | TimeInForce::Fok)
            && next_state == OrderState::Submitted
        {
            // must terminate within one round trip (§4.1)
            next_state = OrderState::Rejected;
        }

        if delta > Decimal::ZERO {
            order.filled_quantity += delta;
            order.avg_fill_price = snapshot.avg_price;
            let fill_price = snapshot.avg_price.unwrap_or(Decimal::ZERO);
            let notional = delta * fill_price;
            let account_delta = match order.side {
                OrderSide::Buy => -notional,
                OrderSide::Sell => notional,
            };
            self.schedule_balance_adjustment(order.account_id, account_delta);
            let _ = self.bus.send(DomainEvent::OrderFilled {
                order: Box::new(order.clone()),
                delta_filled: delta,
                fill_price,
            });
        }

        if let Some(reason) = snapshot.reject_reason.as_deref() {
            if reason == "LIMIT_UNREACHABLE" {
                order.last_error = Some(reason.to_string());
                order.state = OrderState::Rejected;
                return;
            }
        }

        if next_state != order.state {
            order.state = next_state;
            order.last_error = snapshot.reject_reason.or(order.last_error.take());
        }
        order.last_updated_at = Utc::now();
    }

    /// Balance mutation fire-and-forget: the caller (apply_snapshot) holds
    /// the order lock, not the account lock, so this spawns onto its own
    /// task rather than nesting locks. The account lock is acquired inside
    /// the spawned task itself, held for the duration of the DB write, so
    /// two fills against the same account still serialize even though
    /// neither caller blocks waiting for the other.
    fn schedule_balance_adjustment(&self, account_id: Uuid, delta: Decimal) {
        let store = self.store.clone();
        let account_locks = self.account_locks.clone();
        tokio::spawn(async move {
            let _guard = account_locks.lock(&account_id).await;
            if let Err(err) = store.adjust_available_balance(account_id, delta).await {
                tracing::error!(%account_id, error = %err, "failed to adjust account balance after fill");
            }
        });
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        let _guard = self.order_locks.lock(&order_id).await;
        let mut order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;

        if !order.state.cancellable() {
            return Err(AppError::IllegalTransition {
                from: format!("{:?}", order.state),
                to: "CANCELLED".to_string(),
            });
        }

        if let Some(broker_id) = order.broker_id.clone() {
            let breaker = self.breakers.get(self.broker.name());
            if breaker.allow_request() {
                let broker = self.broker.clone();
                let result = retry(&self.retry_policy, || {
                    let broker_id = broker_id.clone();
                    let broker = broker.clone();
                    async move { broker.cancel(&broker_id).await }
                })
                .await;
                match result {
                    Ok(snapshot) => {
                        breaker.record_success();
                        self.apply_snapshot(&mut order, snapshot);
                    }
                    Err(err) => {
                        breaker.record_failure();
                        order.last_error = Some(err.to_string());
                    }
                }
            }
        }

        if order.state.cancellable() {
            order.state = OrderState::Cancelled;
            order.last_updated_at = Utc::now();
        }

        self.store.save_order(&order).await?;
        let _ = self.bus.send(DomainEvent::OrderStateChanged {
            order_id: order.id,
            user_id: order.user_id,
            state: order.state,
        });
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        self.store.get_order(order_id).await
    }

    pub async fn list_orders(&self, filters: OrderFilters) -> Result<Vec<Order>, AppError> {
        self.store.list_orders(&filters).await
    }

    /// Forces a broker poll for one order. Used by the scheduler and by
    /// manual ops (§4.1).
    pub async fn reconcile_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        let _guard = self.order_locks.lock(&order_id).await;
        let mut order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;

        if order.state.is_terminal() {
            return Ok(order);
        }

        let breaker = self.breakers.get(self.broker.name());
        if !breaker.allow_request() {
            return Ok(order);
        }

        if let Some(broker_id) = order.broker_id.clone() {
            let broker = self.broker.clone();
            match broker.poll(&broker_id).await {
                Ok(snapshot) => {
                    breaker.record_success();
                    self.apply_snapshot(&mut order, snapshot);
                }
                Err(err) => {
                    breaker.record_failure();
                    order.last_error = Some(err.to_string());
                }
            }
        } else {
            // Partial-failure adoption: resubmitting with the same
            // idempotency key either adopts the broker's existing order
            // or genuinely places it for the first time.
            self.attempt_broker_submit(&mut order).await;
        }

        self.store.save_order(&order).await?;
        Ok(order)
    }

    /// DAY orders not terminal by session close expire (with a cancel
    /// attempt first); GTC never auto-expires (§4.1).
    pub async fn expire_day_orders(&self) -> Result<usize, AppError> {
        let open = self
            .store
            .list_orders(&OrderFilters {
                state: None,
                ..Default::default()
            })
            .await?;
        let mut expired = 0;
        for order in open {
            if order.state.is_terminal() || order.time_in_force != TimeInForce::Day {
                continue;
            }
            let _guard = self.order_locks.lock(&order.id).await;
            let mut order = self
                .store
                .get_order(order.id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("order {}", order.id)))?;
            if order.state.is_terminal() {
                continue;
            }
            if let Some(broker_id) = order.broker_id.clone() {
                let breaker = self.breakers.get(self.broker.name());
                if breaker.allow_request() {
                    if let Ok(snapshot) = self.broker.cancel(&broker_id).await {
                        breaker.record_success();
                        self.apply_snapshot(&mut order, snapshot);
                    }
                }
            }
            if !order.state.is_terminal() {
                order.state = OrderState::Expired;
                order.last_updated_at = Utc::now();
            }
            self.store.save_order(&order).await?;
            let _ = self.bus.send(DomainEvent::OrderStateChanged {
                order_id: order.id,
                user_id: order.user_id,
                state: order.state,
            });
            expired += 1;
        }
        Ok(expired)
    }
}
