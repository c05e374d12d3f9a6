//! HTTP and WebSocket surface (§6): routes compose public, authenticated,
//! admin-only, and webhook sub-routers under one correlation-id + CORS +
//! request-logging + rate-limit layer stack.

pub mod error_response;
pub mod health;
pub mod jobs;
pub mod orders;
pub mod portfolio;
pub mod state;
pub mod webhooks;
pub mod ws;

pub use state::ApiState;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::auth::{self, AuthState, JwtHandler};
use crate::middleware::{rate_limit_middleware, request_logging, RateLimitConfig, RateLimitLayer};
use crate::telemetry::correlation_id;

pub fn build_router(
    api_state: ApiState,
    auth_state: AuthState,
    jwt_handler: Arc<JwtHandler>,
    cors_origins: &[String],
    metrics_handle: PrometheusHandle,
) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .with_state(api_state.clone());

    let auth_routes = Router::new()
        .route("/auth/login", post(auth::api::login))
        .with_state(auth_state.clone());

    let admin_routes = Router::new()
        .route("/auth/me", get(auth::api::get_current_user))
        .route("/admin/users", get(auth::api::list_users).post(auth::api::create_user))
        .route("/admin/users/:id", delete(auth::api::delete_user))
        .route_layer(middleware::from_fn_with_state(
            jwt_handler.clone(),
            auth::auth_middleware,
        ))
        .with_state(auth_state);

    let protected = Router::new()
        .route("/orders", post(orders::submit_order))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/cancel", post(orders::cancel_order))
        .route("/portfolio/link/token", post(portfolio::begin_link))
        .route("/portfolio/link/exchange", post(portfolio::complete_link))
        .route("/portfolio/accounts", get(portfolio::list_accounts))
        .route("/portfolio/strategies", post(portfolio::create_strategy))
        .route("/portfolio/strategies/:id/rebalance", get(portfolio::rebalance_strategy))
        .route("/reconcile", post(portfolio::reconcile))
        .route("/tasks/:id", get(jobs::get_task))
        .route("/ws/portfolio/:user", get(ws::ws_portfolio))
        .route_layer(middleware::from_fn_with_state(jwt_handler, auth::auth_middleware))
        .with_state(api_state.clone());

    let webhooks = Router::new()
        .route("/webhooks/:custodian", post(webhooks::handle_webhook))
        .with_state(api_state);

    let cors = if cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());
    {
        let cleanup_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                cleanup_limiter.cleanup();
            }
        });
    }

    Router::new()
        .merge(public)
        .merge(auth_routes)
        .merge(admin_routes)
        .merge(protected)
        .merge(webhooks)
        .layer(middleware::from_fn(correlation_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors)
        .layer(middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
}
