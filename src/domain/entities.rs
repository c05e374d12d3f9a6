//! Canonical data model (§3). Every monetary or quantity field is an exact
//! decimal; floats never cross into persisted state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Checking,
    Savings,
    Investment,
    Credit,
    Loan,
    Mortgage,
    Retirement,
}

impl AccountKind {
    /// Per §9 open question (a): only investment accounts get their
    /// `current_balance` refreshed straight from a custodian snapshot.
    pub fn balance_refreshed_on_sync(&self) -> bool {
        matches!(self, AccountKind::Investment | AccountKind::Retirement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Custodian {
    pub id: Uuid,
    pub name: String,
    pub capabilities: CustodianCapabilities,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CustodianCapabilities {
    pub read_balance: bool,
    pub read_holdings: bool,
    pub read_transactions: bool,
    pub trade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub portfolio_id: Option<Uuid>,
    pub custodian_id: Option<Uuid>,
    pub kind: AccountKind,
    pub external_id: Option<String>,
    #[serde(skip_serializing)]
    pub access_token_handle: Option<String>,
    pub current_balance: Decimal,
    pub available_balance: Decimal,
    pub currency: String,
    pub is_manual: bool,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncStatus>,
}

impl Account {
    /// Invariant from §3: non-manual accounts must have a custodian.
    pub fn validate_invariants(&self) -> Result<(), String> {
        if !self.is_manual && self.custodian_id.is_none() {
            return Err("non-manual account must have a custodian".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub account_id: Uuid,
    pub symbol: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub cost_basis: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Holding {
    pub fn normalize_symbol(symbol: &str) -> String {
        symbol.trim().to_uppercase()
    }

    pub fn market_value(&self) -> Decimal {
        self.quantity * self.unit_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.market_value() - self.cost_basis
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Transfer,
    Purchase,
    Sale,
    Dividend,
    Interest,
    Fee,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionKind,
    /// Signed; credits positive.
    pub amount: Decimal,
    pub date: DateTime<Utc>,
    pub symbol: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub external_id: Option<String>,
    pub content_hash: Option<String>,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }

    /// Legal to cancel from PENDING, SUBMITTED, PARTIALLY_FILLED (§4.1).
    pub fn cancellable(&self) -> bool {
        matches!(
            self,
            OrderState::Pending | OrderState::Submitted | OrderState::PartiallyFilled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub state: OrderState,
    pub broker_id: Option<String>,
    pub client_idempotency_key: String,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Order {
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyHolding {
    pub symbol: String,
    /// Target weight in [0, 1].
    pub target_weight: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub holdings: Vec<StrategyHolding>,
    /// Drift threshold in percentage points.
    pub drift_threshold_pct: Decimal,
}
