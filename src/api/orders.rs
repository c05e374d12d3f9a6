//! Order submission, lookup, and cancellation (§6, §4.1).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error_response::to_response;
use super::state::ApiState;
use crate::auth::models::Claims;
use crate::domain::{Order, OrderSide, OrderType, TimeInForce};
use crate::error::AppError;
use crate::orders::OrderSpec;
use crate::telemetry::CorrelationId;

#[derive(Debug, Deserialize)]
pub struct SubmitOrderRequest {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitOrderResponse {
    pub order: Order,
    pub warnings: Vec<String>,
}

fn user_id_of(claims: &Claims) -> Result<Uuid, AppError> {
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::Authentication)
}

pub async fn submit_order(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Json(req): Json<SubmitOrderRequest>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    if let Err(err) = state.store.ensure_user(user_id, &claims.username).await {
        return to_response(err, &cid.0);
    }

    let spec = OrderSpec {
        symbol: req.symbol,
        side: req.side,
        quantity: req.quantity,
        order_type: req.order_type,
        limit_price: req.limit_price,
        stop_price: req.stop_price,
        time_in_force: req.time_in_force,
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    match state
        .orders
        .submit_order(user_id, req.account_id, spec, req.idempotency_key)
        .await
    {
        Ok(outcome) => {
            state.metrics.counter("orders.submitted", now_ms);
            (
                StatusCode::CREATED,
                Json(SubmitOrderResponse {
                    order: outcome.order,
                    warnings: outcome.warnings.into_iter().map(|w| format!("{w:?}")).collect(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            state.metrics.counter("orders.rejected", now_ms);
            to_response(err, &cid.0)
        }
    }
}

pub async fn get_order(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Path(order_id): Path<Uuid>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    match state.orders.get_order(order_id).await {
        Ok(Some(order)) if order.user_id == user_id => Json(order).into_response(),
        Ok(_) => to_response(AppError::NotFound(format!("order {order_id}")), &cid.0),
        Err(err) => to_response(err, &cid.0),
    }
}

pub async fn cancel_order(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Extension(cid): Extension<CorrelationId>,
    Path(order_id): Path<Uuid>,
) -> Response {
    let user_id = match user_id_of(&claims) {
        Ok(id) => id,
        Err(err) => return to_response(err, &cid.0),
    };
    match state.orders.get_order(order_id).await {
        Ok(Some(order)) if order.user_id == user_id => {}
        Ok(_) => return to_response(AppError::NotFound(format!("order {order_id}")), &cid.0),
        Err(err) => return to_response(err, &cid.0),
    }

    match state.orders.cancel_order(order_id).await {
        Ok(order) => Json(order).into_response(),
        Err(err) => to_response(err, &cid.0),
    }
}
