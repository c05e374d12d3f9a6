//! Order lifecycle engine integration tests (§4.1 happy path, partial
//! fill, and broker outage scenarios).

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use vp_core::domain::{Account, AccountKind, Order, OrderSide, OrderState, OrderType, TimeInForce};
use vp_core::events;
use vp_core::market_data::MarketDataCache;
use vp_core::orders::{OrderEngine, OrderSpec, SimBroker};
use vp_core::reliability::{BreakerConfig, BreakerRegistry};
use vp_core::store::Store;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("core.db");
    let store = Store::open(db_path.to_str().unwrap()).expect("store opens");
    (dir, store)
}

async fn seeded_account(store: &Store, balance: Decimal) -> (Uuid, Uuid) {
    let user_id = Uuid::new_v4();
    store
        .ensure_user(user_id, "trader")
        .await
        .expect("ensure_user");
    let account = Account {
        id: Uuid::new_v4(),
        user_id,
        portfolio_id: None,
        custodian_id: None,
        kind: AccountKind::Investment,
        external_id: None,
        access_token_handle: None,
        current_balance: balance,
        available_balance: balance,
        currency: "USD".to_string(),
        is_manual: true,
        is_active: true,
        last_synced_at: None,
        last_sync_status: None,
    };
    store.create_account(&account).await.expect("create_account");
    (user_id, account.id)
}

fn engine(store: Store, broker: Arc<SimBroker>) -> OrderEngine {
    let bus = events::new_bus(16);
    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let market_data = Arc::new(MarketDataCache::new());
    OrderEngine::new(store, bus, broker, breakers, market_data)
}

fn market_buy(quantity: Decimal) -> OrderSpec {
    OrderSpec {
        symbol: "AAPL".to_string(),
        side: OrderSide::Buy,
        quantity,
        order_type: OrderType::Market,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Day,
    }
}

#[tokio::test]
async fn market_buy_fills_immediately_and_debits_available_balance() {
    let (_dir, store) = temp_store();
    let (user_id, account_id) = seeded_account(&store, dec!(10000)).await;

    let broker = Arc::new(SimBroker::new());
    broker.set_reference_price("AAPL", dec!(150));
    let eng = engine(store.clone(), broker);

    let outcome = eng
        .submit_order(user_id, account_id, market_buy(dec!(10)), None)
        .await
        .expect("submit succeeds");

    assert_eq!(outcome.order.state, OrderState::Filled);
    assert_eq!(outcome.order.filled_quantity, dec!(10));
    assert_eq!(outcome.order.avg_fill_price, Some(dec!(150)));

    // Balance adjustment is dispatched on a detached task; give it a tick.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let account = store.get_account(account_id).await.unwrap().unwrap();
    assert_eq!(account.available_balance, dec!(10000) - dec!(1500));
}

#[tokio::test]
async fn resubmitting_with_same_idempotency_key_returns_existing_order() {
    let (_dir, store) = temp_store();
    let (user_id, account_id) = seeded_account(&store, dec!(10000)).await;

    let broker = Arc::new(SimBroker::new());
    broker.set_reference_price("AAPL", dec!(150));
    let eng = engine(store.clone(), broker);

    let key = "client-key-1".to_string();
    let first = eng
        .submit_order(user_id, account_id, market_buy(dec!(5)), Some(key.clone()))
        .await
        .unwrap();
    let second = eng
        .submit_order(user_id, account_id, market_buy(dec!(5)), Some(key))
        .await
        .unwrap();

    assert_eq!(first.order.id, second.order.id);
    let all = store
        .list_orders(&vp_core::store::orders::OrderFilters {
            account_id: Some(account_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1, "idempotent resubmit must not duplicate the order");
}

#[tokio::test]
async fn limit_order_stays_submitted_until_price_crosses_then_cancel_keeps_it_unfilled() {
    let (_dir, store) = temp_store();
    let (user_id, account_id) = seeded_account(&store, dec!(10000)).await;

    let broker = Arc::new(SimBroker::new());
    broker.set_reference_price("AAPL", dec!(160)); // above the limit, so a buy limit won't cross
    let eng = engine(store.clone(), broker);

    let spec = OrderSpec {
        order_type: OrderType::Limit,
        limit_price: Some(dec!(150)),
        ..market_buy(dec!(10))
    };
    let outcome = eng.submit_order(user_id, account_id, spec, None).await.unwrap();
    assert_eq!(outcome.order.state, OrderState::Submitted);
    assert_eq!(outcome.order.filled_quantity, Decimal::ZERO);

    let cancelled = eng.cancel_order(outcome.order.id).await.unwrap();
    assert_eq!(cancelled.state, OrderState::Cancelled);
    assert_eq!(cancelled.filled_quantity, Decimal::ZERO);

    // Cancelling again must be rejected: CANCELLED is terminal.
    let err = eng.cancel_order(cancelled.id).await.unwrap_err();
    assert!(matches!(err, vp_core::error::AppError::IllegalTransition { .. }));
}

#[tokio::test]
async fn large_crossing_limit_order_partially_fills_then_completes_on_reconcile() {
    let (_dir, store) = temp_store();
    let (user_id, account_id) = seeded_account(&store, dec!(10000)).await;

    let broker = Arc::new(SimBroker::new());
    broker.set_reference_price("AAPL", dec!(150)); // at the limit, so the buy crosses
    let eng = engine(store.clone(), broker);

    let spec = OrderSpec {
        order_type: OrderType::Limit,
        limit_price: Some(dec!(150)),
        ..market_buy(dec!(10))
    };
    let outcome = eng.submit_order(user_id, account_id, spec, None).await.unwrap();
    assert_eq!(outcome.order.state, OrderState::PartiallyFilled);
    assert_eq!(outcome.order.filled_quantity, dec!(5));
    assert!(outcome.order.filled_quantity < outcome.order.quantity);

    // Reconcile polls the broker again; the resting remainder clears.
    let reconciled = eng.reconcile_order(outcome.order.id).await.unwrap();
    assert_eq!(reconciled.state, OrderState::Filled);
    assert_eq!(reconciled.filled_quantity, dec!(10));
}

/// A broker whose `submit` always errors, to exercise the circuit breaker
/// and the order staying PENDING instead of panicking or silently
/// dropping the attempt (§4.4).
struct AlwaysDownBroker;

#[async_trait::async_trait]
impl vp_core::orders::BrokerAdapter for AlwaysDownBroker {
    async fn submit(
        &self,
        _order: &vp_core::orders::BrokerSubmission,
    ) -> Result<vp_core::orders::BrokerStatusSnapshot, vp_core::error::AppError> {
        Err(vp_core::error::AppError::BrokerUnavailable { broker: "always-down".to_string() })
    }
    async fn cancel(
        &self,
        _broker_id: &str,
    ) -> Result<vp_core::orders::BrokerStatusSnapshot, vp_core::error::AppError> {
        Err(vp_core::error::AppError::BrokerUnavailable { broker: "always-down".to_string() })
    }
    async fn poll(
        &self,
        _broker_id: &str,
    ) -> Result<vp_core::orders::BrokerStatusSnapshot, vp_core::error::AppError> {
        Err(vp_core::error::AppError::BrokerUnavailable { broker: "always-down".to_string() })
    }
    fn name(&self) -> &str {
        "always-down"
    }
}

#[tokio::test]
async fn broker_outage_leaves_order_pending_and_opens_the_breaker() {
    let (_dir, store) = temp_store();
    let (user_id, account_id) = seeded_account(&store, dec!(10000)).await;

    let bus = events::new_bus(16);
    let breakers = BreakerRegistry::new(BreakerConfig {
        consecutive_failure_threshold: 1,
        ..BreakerConfig::default()
    });
    let market_data = Arc::new(MarketDataCache::new());
    let eng = OrderEngine::new(
        store.clone(),
        bus,
        Arc::new(AlwaysDownBroker),
        breakers.clone(),
        market_data,
    );

    let outcome = eng
        .submit_order(user_id, account_id, market_buy(dec!(1)), None)
        .await
        .unwrap();

    assert_eq!(outcome.order.state, OrderState::Pending);
    assert!(outcome.order.last_error.is_some());
    assert_eq!(breakers.get("always-down").state(), vp_core::reliability::BreakerState::Open);
}

#[tokio::test]
async fn expire_day_orders_cancels_open_day_orders_but_leaves_gtc_alone() {
    let (_dir, store) = temp_store();
    let (user_id, account_id) = seeded_account(&store, dec!(10000)).await;

    let broker = Arc::new(SimBroker::new());
    broker.set_reference_price("AAPL", dec!(160));
    let eng = engine(store.clone(), broker);

    let day_spec = OrderSpec {
        order_type: OrderType::Limit,
        limit_price: Some(dec!(100)),
        time_in_force: TimeInForce::Day,
        ..market_buy(dec!(1))
    };
    let gtc_spec = OrderSpec {
        order_type: OrderType::Limit,
        limit_price: Some(dec!(100)),
        time_in_force: TimeInForce::Gtc,
        ..market_buy(dec!(1))
    };

    let day_order = eng.submit_order(user_id, account_id, day_spec, None).await.unwrap().order;
    let gtc_order = eng.submit_order(user_id, account_id, gtc_spec, None).await.unwrap().order;
    assert_eq!(day_order.state, OrderState::Submitted);
    assert_eq!(gtc_order.state, OrderState::Submitted);

    let expired = eng.expire_day_orders().await.unwrap();
    assert_eq!(expired, 1);

    let day_after: Order = store.get_order(day_order.id).await.unwrap().unwrap();
    let gtc_after: Order = store.get_order(gtc_order.id).await.unwrap().unwrap();
    assert_eq!(day_after.state, OrderState::Expired);
    assert_eq!(gtc_after.state, OrderState::Submitted);
}
