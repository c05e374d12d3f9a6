//! Maps `AppError` onto the HTTP error envelope from §6:
//! `{error: {code, message, category, severity, request_id}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{AppError, ErrorBody, ErrorCategory, ErrorPayload};
use crate::telemetry::logging::redact_message;

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidOrder(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::InsufficientFunds { .. } | AppError::InsufficientShares { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        AppError::IllegalTransition { .. } => StatusCode::CONFLICT,
        AppError::StopLimitUnreachable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::BrokerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Authentication | AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
        AppError::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::ExternalApi { .. } => StatusCode::BAD_GATEWAY,
        AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the response body a handler returns on error. Takes the
/// correlation id explicitly rather than re-deriving it, since
/// `IntoResponse::into_response` has no access to the inbound request.
pub fn to_response(err: AppError, request_id: &str) -> Response {
    let status = status_for(&err);
    let logged_message = redact_message(&err.to_string());
    if matches!(err.category(), ErrorCategory::Database | ErrorCategory::System) {
        tracing::error!(error = %logged_message, request_id, "request failed");
    } else {
        tracing::warn!(error = %logged_message, request_id, "request rejected");
    }
    let body = ErrorBody {
        error: ErrorPayload {
            code: err.code().to_string(),
            message: redact_message(&err.user_message()),
            category: err.category(),
            severity: err.severity(),
            request_id: request_id.to_string(),
        },
    };
    (status, Json(body)).into_response()
}
