//! Custodian adapter contract (§4.2). Adapters are stateless w.r.t. the
//! core: every call takes the opaque `access_handle` the link flow minted
//! and returns a plain snapshot for the sync engine to diff against the
//! store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct LinkSession {
    pub session_token: String,
}

#[derive(Debug, Clone)]
pub struct RemoteAccount {
    pub external_id: String,
    pub current_balance: Decimal,
    pub available_balance: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct RemoteHolding {
    pub symbol: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub cost_basis: Decimal,
}

#[derive(Debug, Clone)]
pub struct RemoteTransaction {
    pub external_id: Option<String>,
    pub date: DateTime<Utc>,
    pub amount: Decimal,
    pub description: String,
    pub symbol: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub fee: Option<Decimal>,
}

/// Implemented once per custodian shape. `PlaidLikeCustodian` models an
/// aggregator that can read balances/holdings/transactions; `ManualCustodian`
/// backs accounts the user maintains by hand and never syncs.
#[async_trait]
pub trait CustodianAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn link_flow(&self, user_id: &str) -> Result<LinkSession, AppError>;

    async fn exchange_public_credential(
        &self,
        session: &LinkSession,
        public_token: &str,
    ) -> Result<String, AppError>;

    async fn list_accounts(&self, access_handle: &str) -> Result<Vec<RemoteAccount>, AppError>;

    async fn list_holdings(
        &self,
        access_handle: &str,
        external_account_id: &str,
    ) -> Result<Vec<RemoteHolding>, AppError>;

    async fn list_transactions(
        &self,
        access_handle: &str,
        external_account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTransaction>, AppError>;
}

/// Investment/bank aggregator shape: balances, holdings, and transactions,
/// simulated in memory so the sync engine exercises the full pipeline
/// without a live external dependency.
pub struct PlaidLikeCustodian {
    name: String,
}

impl PlaidLikeCustodian {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl CustodianAdapter for PlaidLikeCustodian {
    fn name(&self) -> &str {
        &self.name
    }

    async fn link_flow(&self, user_id: &str) -> Result<LinkSession, AppError> {
        Ok(LinkSession {
            session_token: format!("link-{user_id}-{}", uuid::Uuid::new_v4()),
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
            external_id: format!("{access_handle}-acct-1"),
            current_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            currency: "USD".to_string(),
        }])
    }

    async fn list_holdings(
        &self,
        _access_handle: &str,
        _external_account_id: &str,
    ) -> Result<Vec<RemoteHolding>, AppError> {
        Ok(Vec::new())
    }

    async fn list_transactions(
        &self,
        _access_handle: &str,
        _external_account_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTransaction>, AppError> {
        Ok(Vec::new())
    }
}

/// Backs `is_manual` accounts. Sync never dispatches to this adapter (the
/// engine filters manual accounts out before syncing) but it exists so the
/// adapter trait has more than one implementor to route over.
pub struct ManualCustodian;

#[async_trait]
impl CustodianAdapter for ManualCustodian {
    fn name(&self) -> &str {
        "manual"
    }

    async fn link_flow(&self, _user_id: &str) -> Result<LinkSession, AppError> {
        Err(AppError::Validation(
            "manual accounts do not support linking".to_string(),
        ))
    }

    async fn exchange_public_credential(
        &self,
        _session: &LinkSession,
        _public_token: &str,
    ) -> Result<String, AppError> {
        Err(AppError::Validation(
            "manual accounts do not support linking".to_string(),
        ))
    }

    async fn list_accounts(&self, _access_handle: &str) -> Result<Vec<RemoteAccount>, AppError> {
        Ok(Vec::new())
    }

    async fn list_holdings(
        &self,
        _access_handle: &str,
        _external_account_id: &str,
    ) -> Result<Vec<RemoteHolding>, AppError> {
        Ok(Vec::new())
    }

    async fn list_transactions(
        &self,
        _access_handle: &str,
        _external_account_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteTransaction>, AppError> {
        Ok(Vec::new())
    }
}
