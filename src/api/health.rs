//! Liveness and dependency health endpoints (§6).

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use super::state::ApiState;
use crate::reliability::BreakerState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct DependencyHealth {
    name: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct DetailedHealth {
    status: &'static str,
    dependencies: Vec<DependencyHealth>,
}

fn breaker_label(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "ok",
        BreakerState::HalfOpen => "degraded",
        BreakerState::Open => "down",
    }
}

/// Per-dependency snapshot: database reachability plus every circuit
/// breaker's current state, named after the target it guards.
pub async fn health_detailed(State(state): State<ApiState>) -> Json<DetailedHealth> {
    let mut dependencies = vec![DependencyHealth {
        name: "database".to_string(),
        status: match state.store.ping().await {
            Ok(()) => "ok",
            Err(_) => "down",
        },
    }];

    dependencies.push(DependencyHealth {
        name: "broker:sim-broker".to_string(),
        status: breaker_label(state.breakers.get("sim-broker").state()),
    });
    for custodian in &state.custodian_names {
        dependencies.push(DependencyHealth {
            name: format!("custodian:{custodian}"),
            status: breaker_label(state.breakers.get(custodian).state()),
        });
    }

    let overall = if dependencies.iter().all(|d| d.status == "ok") {
        "ok"
    } else {
        "degraded"
    };

    Json(DetailedHealth {
        status: overall,
        dependencies,
    })
}
