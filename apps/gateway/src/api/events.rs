//! Event publishing

use super::{guarded_queue_call, queue_error};
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::post,
};
use axum_helpers::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stream_queue::message::due_after;
use stream_queue::{MAX_DELAY, Payload, StreamError};
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new().route("/{stream}", post(publish))
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishParams {
    /// Deliver after this many seconds; 0 or absent publishes immediately
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Published {
    pub id: String,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed_until: Option<DateTime<Utc>>,
}

async fn publish(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Query(params): Query<PublishParams>,
    body: Result<Json<Payload>, JsonRejection>,
) -> Result<(StatusCode, Json<Published>), AppError> {
    let Json(payload) = body?;

    if state.queue.stream_config(&stream).is_none() {
        return Err(queue_error(StreamError::UnknownStream(stream)));
    }
    if payload.is_empty() {
        return Err(AppError::BadRequest(
            "event body must be a non-empty JSON object".to_string(),
        ));
    }

    let delay = params
        .delay_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    if delay.is_some_and(|delay| delay > MAX_DELAY) {
        return Err(AppError::BadRequest(format!(
            "delay_secs must not exceed {}",
            MAX_DELAY.as_secs()
        )));
    }
    let delayed_until = delay.map(due_after).transpose().map_err(queue_error)?;

    let queue = state.queue.clone();
    let id = guarded_queue_call(&state, || async {
        match delay {
            Some(delay) => queue.publish_delayed(&stream, &payload, delay).await,
            None => queue.publish(&stream, &payload).await,
        }
    })
    .await?;

    info!(stream = %stream, message_id = %id, delayed = delayed_until.is_some(), "Event accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(Published {
            id,
            stream,
            delayed_until,
        }),
    ))
}
