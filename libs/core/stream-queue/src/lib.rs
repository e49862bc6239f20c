//! Stream Queue
//!
//! A consumer-group message queue over Redis Streams with delayed retries
//! and dead-lettering.
//!
//! ## Features
//!
//! - **Consumer groups**: each entry is pending for exactly one consumer until acknowledged
//! - **Delayed delivery**: `publish_delayed` stages entries in `<stream>_delayed`
//! - **Bounded retries**: failed messages are republished after `retry_delay`, up to `max_retries`
//! - **Dead Letter Queue**: exhausted messages land in `<stream>_dlq` with the final error
//! - **Reclamation**: entries abandoned by a crashed consumer are claimed and reprocessed
//! - **Prometheus metrics**: published/processed/retried/dead-lettered counters
//!
//! ## Example
//!
//! ```ignore
//! use stream_queue::{RedisStreamStore, StreamConfig, StreamQueueManager, handler_fn};
//!
//! let store = Arc::new(RedisStreamStore::connect(client).await?);
//! let queue = Arc::new(StreamQueueManager::new(store));
//!
//! queue
//!     .register_stream(
//!         StreamConfig::new("user_events", "gateway_consumers"),
//!         handler_fn("audit", |msg| async move {
//!             tracing::info!(id = %msg.id, "user event");
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!
//! queue.start_all_consumers()?;
//! queue.publish_json("user_events", &event).await?;
//!
//! // on shutdown
//! queue.stop().await;
//! ```

mod config;
mod consumer;
mod dlq;
mod error;
mod handler;
mod manager;
pub mod message;
pub mod metrics;
pub mod store;

pub use config::{
    DELAYED_SUFFIX, DLQ_SUFFIX, MAX_DELAY, StreamConfig, delayed_stream_name, dlq_stream_name,
};
pub use consumer::StreamConsumer;
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use error::StreamError;
pub use handler::{FnHandler, MessageHandler, handler_fn};
pub use manager::{QueueStats, StreamQueueManager};
pub use message::{Message, Payload, payload_from};
pub use metrics::{QueueMetrics, init_metrics, render_metrics};
pub use store::{
    GroupCreation, MemoryStreamStore, PendingEntry, PendingSummary, RedisStreamStore, StreamEntry,
    StreamStore,
};
