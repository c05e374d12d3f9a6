//! Error taxonomy
//! Mission: give every fallible operation a stable, categorized error so
//! logging, alert routing, and retry decisions share one vocabulary.

use serde::Serialize;
use std::fmt;

/// Top-level error category. Drives log level, alert routing, and whether
/// the reliability substrate considers an error retriable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Database,
    Authentication,
    Validation,
    BusinessLogic,
    ExternalApi,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The single error type that crosses every fallible boundary in the core.
///
/// Every variant carries enough context to build a `{code, message,
/// category, severity}` payload without re-deriving it elsewhere.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("insufficient buying power: need {need}, have {have}")]
    InsufficientFunds {
        need: rust_decimal::Decimal,
        have: rust_decimal::Decimal,
    },

    #[error("insufficient shares: need {need}, have {have}")]
    InsufficientShares {
        need: rust_decimal::Decimal,
        have: rust_decimal::Decimal,
    },

    #[error("illegal order transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("broker circuit open for '{broker}'")]
    BrokerUnavailable { broker: String },

    #[error("stop-limit order {order_id} triggered but limit {limit_price} unreachable at stop {stop_price}")]
    StopLimitUnreachable {
        order_id: String,
        stop_price: rust_decimal::Decimal,
        limit_price: rust_decimal::Decimal,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed")]
    Authentication,

    #[error("network error: {0}")]
    Network(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("external API error ({source}): {message}")]
    ExternalApi { source: String, message: String },

    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        use AppError::*;
        match self {
            InvalidOrder(_) | Validation(_) => ErrorCategory::Validation,
            InsufficientFunds { .. }
            | InsufficientShares { .. }
            | IllegalTransition { .. }
            | StopLimitUnreachable { .. } => ErrorCategory::BusinessLogic,
            BrokerUnavailable { .. } | ExternalApi { .. } => ErrorCategory::ExternalApi,
            NotFound(_) => ErrorCategory::BusinessLogic,
            Authentication | InvalidSignature => ErrorCategory::Authentication,
            Network(_) => ErrorCategory::Network,
            Database(_) => ErrorCategory::Database,
            Internal(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> Severity {
        use AppError::*;
        match self {
            Validation(_) | InvalidOrder(_) => Severity::Low,
            InsufficientFunds { .. } | InsufficientShares { .. } | NotFound(_) => Severity::Low,
            IllegalTransition { .. } | StopLimitUnreachable { .. } => Severity::Medium,
            BrokerUnavailable { .. } | ExternalApi { .. } | Network(_) => Severity::High,
            Authentication | InvalidSignature => Severity::Medium,
            Database(_) | Internal(_) => Severity::Critical,
        }
    }

    /// Stable machine-readable code, stripped of interpolated details.
    pub fn code(&self) -> &'static str {
        use AppError::*;
        match self {
            InvalidOrder(_) => "INVALID_ORDER",
            InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            BrokerUnavailable { .. } => "BROKER_UNAVAILABLE",
            StopLimitUnreachable { .. } => "STOP_LIMIT_UNREACHABLE",
            NotFound(_) => "NOT_FOUND",
            Validation(_) => "VALIDATION_ERROR",
            Authentication => "AUTHENTICATION_FAILED",
            Network(_) => "NETWORK_ERROR",
            Database(_) => "DATABASE_ERROR",
            ExternalApi { .. } => "EXTERNAL_API_ERROR",
            InvalidSignature => "INVALID_SIGNATURE",
            Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the reliability substrate should retry an operation that
    /// failed with this error (network timeouts / 5xx-shaped errors only).
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::ExternalApi { .. })
    }

    /// Short, non-technical message safe to show a caller. Diagnostic
    /// detail stays in logs, keyed by correlation id.
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::Authentication => "Authentication failed.".to_string(),
            ErrorCategory::Database | ErrorCategory::System => {
                "An internal error occurred. Please try again.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            AppError::Network(e.to_string())
        } else {
            AppError::ExternalApi {
                source: e.url().map(|u| u.to_string()).unwrap_or_default(),
                message: e.to_string(),
            }
        }
    }
}

/// HTTP-facing error envelope, see §6: `{error: {code, message, category,
/// severity, request_id}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub request_id: String,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
