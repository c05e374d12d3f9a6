//! Account aggregation / reconciliation integration tests (§4.2): sync
//! applies the remote snapshot, a resync with the same external
//! transaction id doesn't duplicate, and a failed fetch marks the
//! account PARTIAL rather than losing the last known good snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use vp_core::aggregation::custodian::{RemoteAccount, RemoteHolding, RemoteTransaction};
use vp_core::aggregation::{AggregationEngine, CustodianAdapter, LinkSession};
use vp_core::domain::{Account, AccountKind, Custodian, CustodianCapabilities, SyncStatus};
use vp_core::error::AppError;
use vp_core::events;
use vp_core::reliability::{BreakerConfig, BreakerRegistry};
use vp_core::store::Store;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("core.db");
    let store = Store::open(db_path.to_str().unwrap()).expect("store opens");
    (dir, store)
}

/// A custodian whose remote holdings/transactions can be swapped between
/// sync calls, so tests can drive drift and duplicate-transaction
/// scenarios deterministically without touching the network.
struct FakeCustodian {
    holdings: Mutex<Vec<RemoteHolding>>,
    transactions: Mutex<Vec<RemoteTransaction>>,
    fail_holdings: Mutex<bool>,
}

impl FakeCustodian {
    fn new() -> Self {
        Self {
            holdings: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            fail_holdings: Mutex::new(false),
        }
    }

    fn set_holdings(&self, holdings: Vec<RemoteHolding>) {
        *self.holdings.lock() = holdings;
    }

    fn set_transactions(&self, txs: Vec<RemoteTransaction>) {
        *self.transactions.lock() = txs;
    }

    fn set_fail_holdings(&self, fail: bool) {
        *self.fail_holdings.lock() = fail;
    }
}

#[async_trait::async_trait]
impl CustodianAdapter for FakeCustodian {
    fn name(&self) -> &str {
        "fake"
    }

    async fn link_flow(&self, user_id: &str) -> Result<LinkSession, AppError> {
        Ok(LinkSession {
            session_token: format!("session-{user_id}"),
        })
    }

    async fn exchange_public_credential(
        &self,
        _session: &LinkSession,
        public_token: &str,
    ) -> Result<String, AppError> {
        Ok(format!("handle-{public_token}"))
    }

    async fn list_accounts(&self, access_handle: &str) -> Result<Vec<RemoteAccount>, AppError> {
        Ok(vec![RemoteAccount {
            external_id: format!("{access_handle}-acct"),
            current_balance: dec!(5000),
            available_balance: dec!(5000),
            currency: "USD".to_string(),
        }])
    }

    async fn list_holdings(
        &self,
        _access_handle: &str,
        _external_account_id: &str,
    ) -> Result<Vec<RemoteHolding>, AppError> {
        if *self.fail_holdings.lock() {
            return Err(AppError::Network("holdings feed timed out".to_string()));
        }
        Ok(self.holdings.lock().clone())
    }

    async fn list_transactions(
        &self,
        _access_handle: &str,
        _external_account_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTransaction>, AppError> {
        Ok(self.transactions.lock().clone())
    }
}

async fn linked_account(store: &Store, custodian_id: Uuid) -> Account {
    let user_id = Uuid::new_v4();
    store.ensure_user(user_id, "trader").await.unwrap();
    let account = Account {
        id: Uuid::new_v4(),
        user_id,
        portfolio_id: None,
        custodian_id: Some(custodian_id),
        kind: AccountKind::Investment,
        external_id: Some("ext-1".to_string()),
        access_token_handle: Some("handle-1".to_string()),
        current_balance: Decimal::ZERO,
        available_balance: Decimal::ZERO,
        currency: "USD".to_string(),
        is_manual: false,
        is_active: true,
        last_synced_at: None,
        last_sync_status: None,
    };
    store.create_account(&account).await.unwrap();
    account
}

async fn seeded_custodian(store: &Store) -> Custodian {
    let custodian = Custodian {
        id: Uuid::new_v4(),
        name: "fake".to_string(),
        capabilities: CustodianCapabilities {
            read_balance: true,
            read_holdings: true,
            read_transactions: true,
            trade: false,
        },
        healthy: true,
    };
    store.create_custodian(&custodian).await.unwrap();
    custodian
}

fn engine(store: Store, fake: Arc<FakeCustodian>) -> AggregationEngine {
    let bus = events::new_bus(16);
    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let mut custodians: HashMap<String, Arc<dyn CustodianAdapter>> = HashMap::new();
    custodians.insert("fake".to_string(), fake);
    AggregationEngine::new(store, bus, custodians, breakers)
}

#[tokio::test]
async fn sync_applies_remote_holdings_and_detects_drift_across_syncs() {
    let (_dir, store) = temp_store();
    let custodian = seeded_custodian(&store).await;
    let account = linked_account(&store, custodian.id).await;

    let fake = Arc::new(FakeCustodian::new());
    fake.set_holdings(vec![RemoteHolding {
        symbol: "aapl".to_string(),
        quantity: dec!(10),
        unit_price: dec!(150),
        cost_basis: dec!(1400),
    }]);
    let agg = engine(store.clone(), fake.clone());

    let status = agg.sync_account(account.id).await.unwrap();
    assert_eq!(status, SyncStatus::Ok);

    let holdings = store.list_holdings_for_account(account.id).await.unwrap();
    assert_eq!(holdings.len(), 1);
    assert_eq!(holdings[0].symbol, "AAPL");
    assert_eq!(holdings[0].quantity, dec!(10));

    // Drift: the custodian reports a different quantity on the next sync.
    fake.set_holdings(vec![RemoteHolding {
        symbol: "aapl".to_string(),
        quantity: dec!(7),
        unit_price: dec!(150),
        cost_basis: dec!(1400),
    }]);
    agg.sync_account(account.id).await.unwrap();
    let holdings = store.list_holdings_for_account(account.id).await.unwrap();
    assert_eq!(holdings[0].quantity, dec!(7), "a re-sync must overwrite stale quantity, not add to it");

    // A position dropped entirely from the remote snapshot is removed, not left stale.
    fake.set_holdings(vec![]);
    agg.sync_account(account.id).await.unwrap();
    let holdings = store.list_holdings_for_account(account.id).await.unwrap();
    assert!(holdings.is_empty());
}

#[tokio::test]
async fn resyncing_the_same_external_transaction_id_does_not_duplicate() {
    let (_dir, store) = temp_store();
    let custodian = seeded_custodian(&store).await;
    let account = linked_account(&store, custodian.id).await;

    let fake = Arc::new(FakeCustodian::new());
    fake.set_transactions(vec![RemoteTransaction {
        external_id: Some("tx-external-1".to_string()),
        date: Utc::now(),
        amount: dec!(-500),
        description: "buy 5 AAPL".to_string(),
        symbol: Some("AAPL".to_string()),
        quantity: Some(dec!(5)),
        unit_price: Some(dec!(100)),
        fee: None,
    }]);
    let agg = engine(store.clone(), fake.clone());

    agg.sync_account(account.id).await.unwrap();
    agg.sync_account(account.id).await.unwrap();

    let txs = store.list_transactions_for_account(account.id).await.unwrap();
    assert_eq!(txs.len(), 1, "the same external_id must resolve to one stored transaction");
}

#[tokio::test]
async fn holdings_fetch_failure_marks_partial_and_keeps_last_known_good_snapshot() {
    let (_dir, store) = temp_store();
    let custodian = seeded_custodian(&store).await;
    let account = linked_account(&store, custodian.id).await;

    let fake = Arc::new(FakeCustodian::new());
    fake.set_holdings(vec![RemoteHolding {
        symbol: "aapl".to_string(),
        quantity: dec!(10),
        unit_price: dec!(150),
        cost_basis: dec!(1400),
    }]);
    let agg = engine(store.clone(), fake.clone());
    agg.sync_account(account.id).await.unwrap();

    fake.set_fail_holdings(true);
    let status = agg.sync_account(account.id).await.unwrap();
    assert_eq!(status, SyncStatus::Partial);

    let holdings = store.list_holdings_for_account(account.id).await.unwrap();
    assert_eq!(holdings.len(), 1, "a failed fetch keeps the prior snapshot instead of wiping it");
    assert_eq!(holdings[0].quantity, dec!(10));
}

#[tokio::test]
async fn sync_all_active_skips_manual_accounts_and_continues_past_a_failing_one() {
    let (_dir, store) = temp_store();
    let custodian = seeded_custodian(&store).await;
    let account = linked_account(&store, custodian.id).await;

    let manual_user = Uuid::new_v4();
    store.ensure_user(manual_user, "manual-user").await.unwrap();
    let manual_account = Account {
        id: Uuid::new_v4(),
        user_id: manual_user,
        portfolio_id: None,
        custodian_id: None,
        kind: AccountKind::Checking,
        external_id: None,
        access_token_handle: None,
        current_balance: dec!(100),
        available_balance: dec!(100),
        currency: "USD".to_string(),
        is_manual: true,
        is_active: true,
        last_synced_at: None,
        last_sync_status: None,
    };
    store.create_account(&manual_account).await.unwrap();

    let fake = Arc::new(FakeCustodian::new());
    let agg = engine(store.clone(), fake);

    let results = agg.sync_all_active().await;
    // Only the non-manual account is swept; the manual one never appears.
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, account.id);
    assert!(results[0].1.is_ok());
}
