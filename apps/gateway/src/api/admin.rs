//! Operator endpoints: queue depth, breaker state, dead letters.
//!
//! These routes carry no authentication and no rate limiting. Resetting
//! breakers and deleting or requeueing dead letters change shared state, so
//! `/admin` must only be reachable from the internal network. Block the
//! prefix at the ingress or load balancer that exposes `/api/v1`.

use super::queue_error;
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use axum_helpers::AppError;
use resilience::BreakerStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stream_queue::{DeadLetter, QueueStats};
use tracing::info;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queues/stats", get(queue_stats))
        .route("/breakers/stats", get(breaker_stats))
        .route("/breakers/reset", post(reset_breakers))
        .route("/queues/{stream}/dlq", get(list_dead_letters))
        .route("/queues/{stream}/dlq/{id}", delete(delete_dead_letter))
        .route("/queues/{stream}/dlq/{id}/requeue", post(requeue_dead_letter))
}

async fn queue_stats(State(state): State<AppState>) -> Json<BTreeMap<String, QueueStats>> {
    Json(state.queue.get_stats().await)
}

async fn breaker_stats(State(state): State<AppState>) -> Json<BTreeMap<String, BreakerStats>> {
    Json(state.breakers.get_all_stats())
}

async fn reset_breakers(State(state): State<AppState>) -> StatusCode {
    state.breakers.reset_all();
    info!("All circuit breakers reset by operator");
    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub count: Option<usize>,
    /// Exclusive lower bound: the last id of the previous page
    pub after: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterPage {
    pub stream: String,
    pub total: u64,
    pub entries: Vec<DeadLetter>,
    /// Pass as `after` to fetch the next page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<DeadLetterPage>, AppError> {
    let count = params.count.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let dlq = state.queue.dead_letters(&stream).map_err(queue_error)?;

    let entries = dlq
        .list(count, params.after.as_deref())
        .await
        .map_err(queue_error)?;
    let total = dlq.len().await.map_err(queue_error)?;
    let next = (entries.len() == count)
        .then(|| entries.last().map(|e| e.id.clone()))
        .flatten();

    Ok(Json(DeadLetterPage {
        stream,
        total,
        entries,
        next,
    }))
}

async fn delete_dead_letter(
    State(state): State<AppState>,
    Path((stream, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let dlq = state.queue.dead_letters(&stream).map_err(queue_error)?;
    if dlq.delete(&id).await.map_err(queue_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("dead letter '{id}' not found")))
    }
}

#[derive(Debug, Serialize)]
pub struct Requeued {
    pub id: String,
    pub stream: String,
}

async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path((stream, id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Requeued>), AppError> {
    let dlq = state.queue.dead_letters(&stream).map_err(queue_error)?;
    match dlq.requeue(&id).await.map_err(queue_error)? {
        Some(new_id) => Ok((
            StatusCode::ACCEPTED,
            Json(Requeued { id: new_id, stream }),
        )),
        None => Err(AppError::NotFound(format!("dead letter '{id}' not found"))),
    }
}
