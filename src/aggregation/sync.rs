//! Sync operation (§4.2 steps 1-5) and in-flight coalescing: at most one
//! sync runs per account at a time, and callers that arrive while one is
//! running share its result rather than queuing a second round trip.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{FutureExt, Shared};
use futures_util::Future;
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use uuid::Uuid;

use super::custodian::{CustodianAdapter, LinkSession};
use super::rebalance::{compute_recommendations, RebalanceRecommendation};
use crate::domain::{Holding, SyncStatus, Transaction, TransactionKind};
use crate::error::AppError;
use crate::events::DomainEvent;
use crate::events::EventBus;
use crate::reliability::{retry, BreakerRegistry, RetryPolicy};
use crate::store::portfolio::transaction_content_hash;
use crate::store::Store;

type SharedSync = Shared<Pin<Box<dyn Future<Output = Result<SyncStatus, String>> + Send>>>;

pub struct AggregationEngine {
    store: Store,
    bus: EventBus,
    custodians: HashMap<String, Arc<dyn CustodianAdapter>>,
    breakers: BreakerRegistry,
    retry_policy: RetryPolicy,
    inflight: SyncMutex<HashMap<Uuid, SharedSync>>,
}

impl AggregationEngine {
    pub fn new(
        store: Store,
        bus: EventBus,
        custodians: HashMap<String, Arc<dyn CustodianAdapter>>,
        breakers: BreakerRegistry,
    ) -> Self {
        Self {
            store,
            bus,
            custodians,
            breakers,
            retry_policy: RetryPolicy::default(),
            inflight: SyncMutex::new(HashMap::new()),
        }
    }

    fn custodian(&self, name: &str) -> Result<Arc<dyn CustodianAdapter>, AppError> {
        self.custodians
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Validation(format!("unknown custodian '{name}'")))
    }

    /// Step 1 of the link flow (§6 "POST /portfolio/link/token"): mints a
    /// custodian-scoped session the client hands back after the user
    /// authorizes access.
    pub async fn begin_link(&self, custodian_name: &str, user_id: Uuid) -> Result<LinkSession, AppError> {
        self.custodian(custodian_name)?
            .link_flow(&user_id.to_string())
            .await
    }

    /// Step 2 of the link flow (§6 "POST /portfolio/link/exchange"):
    /// exchanges the custodian's public token for the opaque access
    /// handle the core stores against the new account.
    pub async fn complete_link(
        &self,
        custodian_name: &str,
        session: &LinkSession,
        public_token: &str,
    ) -> Result<String, AppError> {
        self.custodian(custodian_name)?
            .exchange_public_credential(session, public_token)
            .await
    }

    /// Syncs one account, coalescing concurrent callers onto the same
    /// in-flight future (§4.2 "Concurrency rule").
    pub async fn sync_account(&self, account_id: Uuid) -> Result<SyncStatus, AppError> {
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&account_id) {
                existing.clone()
            } else {
                let fut = self.run_sync(account_id);
                let shared: SharedSync = (Box::pin(fut)
                    as Pin<Box<dyn Future<Output = Result<SyncStatus, String>> + Send>>)
                    .shared();
                inflight.insert(account_id, shared.clone());
                shared
            }
        };

        let result = shared.await;
        self.inflight.lock().remove(&account_id);
        result.map_err(AppError::Internal)
    }

    async fn run_sync(&self, account_id: Uuid) -> Result<SyncStatus, String> {
        self.run_sync_inner(account_id).await.map_err(|e| e.to_string())
    }

    async fn run_sync_inner(&self, account_id: Uuid) -> Result<SyncStatus, AppError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {account_id}")))?;

        if account.is_manual || !account.is_active {
            return Ok(SyncStatus::Ok);
        }

        let custodian_id = account
            .custodian_id
            .ok_or_else(|| AppError::Validation("non-manual account missing custodian".to_string()))?;
        let custodian = self
            .store
            .get_custodian(custodian_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("custodian {custodian_id}")))?;
        let adapter = self
            .custodians
            .get(&custodian.name)
            .ok_or_else(|| AppError::Validation(format!("no adapter registered for '{}'", custodian.name)))?
            .clone();
        let access_handle = account
            .access_token_handle
            .clone()
            .ok_or_else(|| AppError::Validation("account missing access handle".to_string()))?;
        let external_id = account
            .external_id
            .clone()
            .unwrap_or_else(|| account.id.to_string());

        let breaker = self.breakers.get(&custodian.name);
        if !breaker.allow_request() {
            self.store
                .apply_sync_result(account_id, None, SyncStatus::Failed, Utc::now())
                .await?;
            return Ok(SyncStatus::Failed);
        }

        let mut status = SyncStatus::Ok;

        // step 1: fetch balances/holdings/transactions, retry-wrapped.
        let remote_accounts = {
            let adapter = adapter.clone();
            let handle = access_handle.clone();
            retry(&self.retry_policy, || {
                let adapter = adapter.clone();
                let handle = handle.clone();
                async move { adapter.list_accounts(&handle).await }
            })
            .await
        };

        let remote_accounts = match remote_accounts {
            Ok(v) => {
                breaker.record_success();
                v
            }
            Err(err) => {
                breaker.record_failure();
                warn!(%account_id, error = %err, "account balance fetch failed");
                self.store
                    .apply_sync_result(account_id, None, SyncStatus::Failed, Utc::now())
                    .await?;
                return Ok(SyncStatus::Failed);
            }
        };

        let refresh_balance = remote_accounts
            .into_iter()
            .find(|r| r.external_id == external_id)
            .filter(|_| account.kind.balance_refreshed_on_sync())
            .map(|r| (r.current_balance, r.available_balance));

        // step 2: upsert holdings by (account, symbol); delete the ones
        // missing from the fresh snapshot.
        match adapter.list_holdings(&access_handle, &external_id).await {
            Ok(remote_holdings) => {
                let existing = self.store.list_holdings_for_account(account_id).await?;
                let seen: std::collections::HashSet<String> = remote_holdings
                    .iter()
                    .map(|h| Holding::normalize_symbol(&h.symbol))
                    .collect();
                for stale in existing {
                    if !seen.contains(&stale.symbol) {
                        self.store.delete_holding(account_id, &stale.symbol).await?;
                    }
                }
                for remote in remote_holdings {
                    let symbol = Holding::normalize_symbol(&remote.symbol);
                    self.store
                        .upsert_holding(&Holding {
                            account_id,
                            symbol: symbol.clone(),
                            quantity: remote.quantity,
                            unit_price: remote.unit_price,
                            cost_basis: remote.cost_basis,
                            last_updated: Utc::now(),
                        })
                        .await?;
                    let _ = self.bus.send(DomainEvent::HoldingUpdated {
                        account_id,
                        user_id: account.user_id,
                        symbol,
                    });
                }
            }
            Err(err) => {
                warn!(%account_id, error = %err, "holdings fetch failed, keeping last known good snapshot");
                status = SyncStatus::Partial;
            }
        }

        // step 3: upsert transactions, idempotent on external_id or a
        // content-hash dedup key when absent.
        match adapter
            .list_transactions(&access_handle, &external_id, account.last_synced_at)
            .await
        {
            Ok(remote_txs) => {
                for remote in remote_txs {
                    let kind = infer_transaction_kind(remote.amount, remote.symbol.is_some());
                    let content_hash = if remote.external_id.is_none() {
                        Some(transaction_content_hash(
                            account_id,
                            remote.date,
                            remote.amount,
                            &remote.description,
                        ))
                    } else {
                        None
                    };
                    let tx = Transaction {
                        id: Uuid::new_v4(),
                        account_id,
                        user_id: account.user_id,
                        kind,
                        amount: remote.amount,
                        date: remote.date,
                        symbol: remote.symbol,
                        quantity: remote.quantity,
                        unit_price: remote.unit_price,
                        fee: remote.fee,
                        external_id: remote.external_id,
                        content_hash,
                        pending: false,
                    };
                    self.store.upsert_transaction(&tx).await?;
                }
            }
            Err(err) => {
                warn!(%account_id, error = %err, "transaction fetch failed, keeping last known good snapshot");
                status = SyncStatus::Partial;
            }
        }

        // step 4: balances + sync bookkeeping.
        self.store
            .apply_sync_result(account_id, refresh_balance, status, Utc::now())
            .await?;

        // step 5: account.updated event.
        let _ = self.bus.send(DomainEvent::AccountUpdated {
            account_id,
            user_id: account.user_id,
            sync_status: status,
        });

        info!(%account_id, ?status, "account sync complete");
        Ok(status)
    }

    /// Daily full reconcile (§4.2 "Scheduling"): syncs every active,
    /// non-manual account. One custodian failing doesn't stop the rest.
    pub async fn sync_all_active(&self) -> Vec<(Uuid, Result<SyncStatus, AppError>)> {
        let accounts = match self.store.list_active_non_manual_accounts().await {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "failed to list accounts for full reconcile");
                return Vec::new();
            }
        };
        let mut results = Vec::with_capacity(accounts.len());
        for account in accounts {
            let result = self.sync_account(account.id).await;
            results.push((account.id, result));
        }
        results
    }

    /// Unified view (§4.2 "Unified view"): total value, per-symbol
    /// aggregation, and custodian breakdown across every account the user
    /// owns.
    pub async fn unified_view(&self, user_id: Uuid) -> Result<UnifiedView, AppError> {
        let accounts = self.store.list_accounts_for_user(user_id).await?;
        let total_value: Decimal = accounts.iter().map(|a| a.current_balance).sum();

        let mut custodian_breakdown: HashMap<Option<Uuid>, Decimal> = HashMap::new();
        for account in &accounts {
            *custodian_breakdown.entry(account.custodian_id).or_insert(Decimal::ZERO) +=
                account.current_balance;
        }
        let mut custodian_names = HashMap::new();
        for (custodian_id, value) in &custodian_breakdown {
            let name = match custodian_id {
                Some(id) => self
                    .store
                    .get_custodian(*id)
                    .await?
                    .map(|c| c.name)
                    .unwrap_or_else(|| "unknown".to_string()),
                None => "manual".to_string(),
            };
            custodian_names.insert(name, *value);
        }

        let holdings = self.store.list_holdings_for_user(user_id).await?;
        let mut per_symbol: HashMap<String, AggregatedHolding> = HashMap::new();
        for h in &holdings {
            let entry = per_symbol.entry(h.symbol.clone()).or_insert(AggregatedHolding {
                symbol: h.symbol.clone(),
                quantity: Decimal::ZERO,
                market_value: Decimal::ZERO,
                cost_basis: Decimal::ZERO,
                allocation_pct: Decimal::ZERO,
            });
            entry.quantity += h.quantity;
            entry.market_value += h.market_value();
            entry.cost_basis += h.cost_basis;
        }
        let invested_total: Decimal = per_symbol.values().map(|h| h.cost_basis).sum();
        for holding in per_symbol.values_mut() {
            if invested_total > Decimal::ZERO {
                holding.allocation_pct = (holding.cost_basis / invested_total) * dec!(100);
            }
        }

        Ok(UnifiedView {
            user_id,
            total_value,
            holdings: per_symbol.into_values().collect(),
            custodian_breakdown: custodian_names,
        })
    }

    /// Rebalance recommendations (§4.2, §8 Scenario 5). Current weights
    /// here are market-value based, unlike `unified_view`'s cost-basis
    /// `allocation_pct`, since drift against a target allocation has to be
    /// measured against what the position is worth now.
    pub async fn rebalance_recommendations(
        &self,
        strategy_id: Uuid,
    ) -> Result<Vec<RebalanceRecommendation>, AppError> {
        let strategy = self
            .store
            .get_strategy(strategy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("strategy {strategy_id}")))?;

        let holdings = self.store.list_holdings_for_user(strategy.user_id).await?;
        let mut by_symbol: HashMap<String, Decimal> = HashMap::new();
        for h in &holdings {
            *by_symbol.entry(h.symbol.clone()).or_insert(Decimal::ZERO) += h.market_value();
        }
        let total_value: Decimal = by_symbol.values().sum();

        let mut current_weights_pct: HashMap<String, Decimal> = HashMap::new();
        if total_value > Decimal::ZERO {
            for (symbol, value) in by_symbol {
                current_weights_pct.insert(symbol, (value / total_value) * dec!(100));
            }
        }

        Ok(compute_recommendations(&strategy, &current_weights_pct))
    }
}

fn infer_transaction_kind(amount: Decimal, has_symbol: bool) -> TransactionKind {
    if has_symbol {
        if amount < Decimal::ZERO {
            TransactionKind::Purchase
        } else {
            TransactionKind::Sale
        }
    } else if amount < Decimal::ZERO {
        TransactionKind::Withdrawal
    } else {
        TransactionKind::Deposit
    }
}

#[derive(Debug, Clone)]
pub struct AggregatedHolding {
    pub symbol: String,
    pub quantity: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub allocation_pct: Decimal,
}

#[derive(Debug, Clone)]
pub struct UnifiedView {
    pub user_id: Uuid,
    pub total_value: Decimal,
    pub holdings: Vec<AggregatedHolding>,
    pub custodian_breakdown: HashMap<String, Decimal>,
}
