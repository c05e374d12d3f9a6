//! `POST /webhooks/{custodian}` (§6): inbound custodian events, HMAC
//! verified over the raw body with the per-custodian shared secret.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use super::error_response::to_response;
use super::state::ApiState;
use crate::error::AppError;

const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

type HmacSha256 = Hmac<Sha256>;

fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected_bytes).is_ok()
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    account_id: Uuid,
}

pub async fn handle_webhook(
    State(state): State<ApiState>,
    Path(custodian): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let secret = match state.webhook_secrets.get(&custodian) {
        Some(secret) => secret,
        None => {
            // A missing secret is a configuration error, not a bypass (§6).
            return to_response(
                AppError::Internal(format!("no webhook secret configured for '{custodian}'")),
                &request_id,
            );
        }
    };

    let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(s) => s,
        None => return to_response(AppError::InvalidSignature, &request_id),
    };

    if !verify_signature(secret, &body, signature) {
        return to_response(AppError::InvalidSignature, &request_id);
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return to_response(AppError::Validation(e.to_string()), &request_id),
    };

    match state.store.get_account(payload.account_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return to_response(AppError::NotFound(format!("account {}", payload.account_id)), &request_id)
        }
        Err(err) => return to_response(err, &request_id),
    }

    let aggregation = state.aggregation.clone();
    let account_id = payload.account_id;
    tokio::spawn(async move {
        let _ = aggregation.sync_account(account_id).await;
    });

    StatusCode::ACCEPTED.into_response()
}
