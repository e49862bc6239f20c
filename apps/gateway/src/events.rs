//! Streams consumed by the gateway itself.

use core_config::queue::QueueSettings;
use std::time::Duration;
use stream_queue::{Message, StreamConfig, StreamError, StreamQueueManager, handler_fn};
use tracing::info;

pub const USER_EVENTS: &str = "user_events";

fn user_events_config(settings: &QueueSettings) -> StreamConfig {
    StreamConfig::new(USER_EVENTS, settings.consumer_group.clone())
        .with_consumer_name(settings.consumer_name.clone())
        .with_max_retries(3)
        .with_retry_delay(Duration::from_secs(30))
        .with_batch_size(10)
}

async fn log_user_event(message: Message) -> Result<(), StreamError> {
    info!(
        stream = %message.stream,
        message_id = %message.id,
        attempt = message.attempts,
        event_type = message.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
        "Processing user event"
    );
    Ok(())
}

/// Register every stream the gateway consumes. Consumers are not started.
pub async fn register_streams(
    queue: &StreamQueueManager,
    settings: &QueueSettings,
) -> Result<(), StreamError> {
    queue
        .register_stream(
            user_events_config(settings),
            handler_fn("user_events_logger", log_user_event),
        )
        .await?;
    Ok(())
}
