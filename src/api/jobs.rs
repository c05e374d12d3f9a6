//! `GET /tasks/{id}` (§6): poll an on-demand or scheduled job run.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use uuid::Uuid;

use super::error_response::to_response;
use super::state::ApiState;
use crate::error::AppError;
use crate::telemetry::CorrelationId;

pub async fn get_task(
    State(state): State<ApiState>,
    Extension(cid): Extension<CorrelationId>,
    Path(task_id): Path<Uuid>,
) -> Response {
    match state.scheduler.get_run(task_id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => to_response(AppError::NotFound(format!("task {task_id}")), &cid.0),
        Err(err) => to_response(err, &cid.0),
    }
}
