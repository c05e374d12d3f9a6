//! Custodian linking, account listing, and reconcile triggers (§6, §4.2).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use axum::extract::Path;

use super::error_response::to_response;
use super::state::ApiState;
use crate::aggregation::RebalanceRecommendation;
use crate::auth::models::Claims;
use crate::domain::{Account, AccountKind, Custodian, CustodianCapabilities, Strategy, StrategyHolding};
use crate::error::AppError;
use crate::telemetry::CorrelationId;

fn user_id_of(claims: &Claims) -> Result<Uuid, AppError> {
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::Authentication)
}

#[derive(Debug, Deserialize)]
pub struct LinkTokenRequest {
    pub custodian: String,
}

#[derive(Debug, Serialize)]
pub struct LinkTokenResponse {
    pub custodian: String,
    pub session_token: String,
}

pub async fn begin_link(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Json(req): Json<LinkTokenRequest>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    match state.aggregation.begin_link(&req.custodian, user_id).await {
        Ok(session) => Json(LinkTokenResponse {
            custodian: req.custodian,
            session_token: session.session_token,
        })
        .into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkExchangeRequest {
    pub custodian: String,
    pub session_token: String,
    pub public_token: String,
    #[serde(default = "default_account_kind")]
    pub account_kind: AccountKind,
}

fn default_account_kind() -> AccountKind {
    AccountKind::Investment
}

pub async fn complete_link(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Json(req): Json<LinkExchangeRequest>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };

    let session = crate::aggregation::LinkSession {
        session_token: req.session_token,
    };
    let access_handle = match state
        .aggregation
        .complete_link(&req.custodian, &session, &req.public_token)
        .await
    {
        Ok(handle) => handle,
        Err(err) => return to_response(err, &cid.0),
    };

    let custodian = match ensure_custodian(&state, &req.custodian).await {
        Ok(c) => c,
        Err(err) => return to_response(err, &cid.0),
    };

    if let Err(err) = state.store.ensure_user(user_id, &claims.username).await {
        return to_response(err, &cid.0);
    }

    let account = Account {
        id: Uuid::new_v4(),
        user_id,
        portfolio_id: None,
        custodian_id: Some(custodian.id),
        kind: req.account_kind,
        external_id: None,
        access_token_handle: Some(access_handle),
        current_balance: Decimal::ZERO,
        available_balance: Decimal::ZERO,
        currency: "USD".to_string(),
        is_manual: false,
        is_active: true,
        last_synced_at: None,
        last_sync_status: None,
    };
    if let Err(err) = state.store.create_account(&account).await {
        return to_response(err, &cid.0);
    }

    // Best-effort initial sync; failures surface on the next scheduled
    // reconcile rather than blocking link completion.
    let _ = state.aggregation.sync_account(account.id).await;

    match state.store.list_accounts_for_user(user_id).await {
        Ok(accounts) => Json(accounts).into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}

async fn ensure_custodian(state: &ApiState, name: &str) -> Result<Custodian, AppError> {
    if let Some(existing) = state.store.get_custodian_by_name(name).await? {
        return Ok(existing);
    }
    let custodian = Custodian {
        id: Uuid::new_v4(),
        name: name.to_string(),
        capabilities: CustodianCapabilities {
            read_balance: true,
            read_holdings: true,
            read_transactions: true,
            trade: false,
        },
        healthy: true,
    };
    state.store.create_custodian(&custodian).await?;
    Ok(custodian)
}

pub async fn list_accounts(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    match state.store.list_accounts_for_user(user_id).await {
        Ok(accounts) => Json(accounts).into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ReconcileRequest {
    pub account_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: Uuid,
}

pub async fn reconcile(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Json(req): Json<ReconcileRequest>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };

    if let Some(account_id) = req.account_id {
        match state.store.get_account(account_id).await {
            Ok(Some(account)) if account.user_id == user_id => {}
            Ok(_) => return to_response(AppError::NotFound(format!("account {account_id}")), &cid.0),
            Err(err) => return to_response(err, &cid.0),
        }

        let run = match state.store.create_job_run("reconcile_account").await {
            Ok(run) => run,
            Err(err) => return to_response(err, &cid.0),
        };
        let aggregation = state.aggregation.clone();
        let store = state.store.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            let _ = store
                .update_job_run(run_id, crate::store::jobs::JobState::Running, None, None)
                .await;
            let result = aggregation.sync_account(account_id).await;
            match result {
                Ok(status) => {
                    let _ = store
                        .update_job_run(
                            run_id,
                            crate::store::jobs::JobState::Succeeded,
                            Some(format!("{status:?}")),
                            None,
                        )
                        .await;
                }
                Err(err) => {
                    let _ = store
                        .update_job_run(
                            run_id,
                            crate::store::jobs::JobState::Failed,
                            None,
                            Some(err.to_string()),
                        )
                        .await;
                }
            }
        });
        return (StatusCode::ACCEPTED, Json(TaskAccepted { task_id: run_id })).into_response();
    }

    match state.scheduler.submit_on_demand("reconcile_all_accounts").await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(TaskAccepted { task_id })).into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateStrategyRequest {
    pub name: String,
    pub holdings: Vec<StrategyHolding>,
    pub drift_threshold_pct: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CreateStrategyResponse {
    pub id: Uuid,
}

pub async fn create_strategy(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Json(req): Json<CreateStrategyRequest>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    let strategy = Strategy {
        id: Uuid::new_v4(),
        user_id,
        name: req.name,
        holdings: req.holdings,
        drift_threshold_pct: req.drift_threshold_pct,
    };
    match state.store.create_strategy(&strategy).await {
        Ok(()) => (StatusCode::CREATED, Json(CreateStrategyResponse { id: strategy.id })).into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}

#[derive(Debug, Serialize)]
pub struct RebalanceResponse {
    pub strategy_id: Uuid,
    pub recommendations: Vec<RebalanceRecommendation>,
}

pub async fn rebalance_strategy(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Path(strategy_id): Path<Uuid>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    match state.store.get_strategy(strategy_id).await {
        Ok(Some(s)) if s.user_id == user_id => {}
        Ok(Some(_)) | Ok(None) => {
            return to_response(AppError::NotFound(format!("strategy {strategy_id}")), &cid.0)
        }
        Err(err) => return to_response(err, &cid.0),
    }
    match state.aggregation.rebalance_recommendations(strategy_id).await {
        Ok(recommendations) => Json(RebalanceResponse { strategy_id, recommendations }).into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}
