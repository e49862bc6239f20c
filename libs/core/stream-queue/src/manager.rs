//! Stream queue manager
//!
//! Owns the stream registry and supervises one `StreamConsumer` per stream.
//! Constructed explicitly and shared via `Arc`; `stop()` is the single
//! shutdown path.

use crate::config::StreamConfig;
use crate::consumer::StreamConsumer;
use crate::dlq::DeadLetterQueue;
use crate::error::StreamError;
use crate::handler::MessageHandler;
use crate::message::{
    Fields, Payload, due_after, encode_payload, fields, format_timestamp, payload_from,
};
use crate::metrics::QueueMetrics;
use crate::store::StreamStore;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-stream statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub stream_name: String,
    pub length: u64,
    pub consumer_group: String,
    pub pending_messages: u64,
    pub consumers: u64,
}

#[derive(Clone)]
struct Registration {
    config: Arc<StreamConfig>,
    handler: Arc<dyn MessageHandler>,
}

struct RunningConsumer {
    consumer: Arc<StreamConsumer>,
    tasks: Vec<JoinHandle<()>>,
}

/// Registry and supervisor for stream consumers
pub struct StreamQueueManager {
    store: Arc<dyn StreamStore>,
    streams: RwLock<HashMap<String, Registration>>,
    consumers: Mutex<HashMap<String, RunningConsumer>>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamQueueManager {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            streams: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn store(&self) -> Arc<dyn StreamStore> {
        self.store.clone()
    }

    /// Register a stream and its handler.
    ///
    /// Applies defaults to zero-valued config fields and creates the consumer
    /// group (and the stream) if missing. Registering the same stream again
    /// replaces its config and handler; a running consumer keeps the old ones
    /// until restarted.
    pub async fn register_stream<H>(
        &self,
        config: StreamConfig,
        handler: H,
    ) -> Result<Arc<StreamConfig>, StreamError>
    where
        H: MessageHandler + 'static,
    {
        self.register_stream_arc(config, Arc::new(handler)).await
    }

    /// Same as [`register_stream`](Self::register_stream) for a shared handler.
    pub async fn register_stream_arc(
        &self,
        config: StreamConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<StreamConfig>, StreamError> {
        let config = config.with_defaults();
        config.validate()?;

        let created = self
            .store
            .create_group(&config.stream_name, &config.consumer_group)
            .await?;

        let config = Arc::new(config);
        let previous = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                config.stream_name.clone(),
                Registration {
                    config: config.clone(),
                    handler: handler.clone(),
                },
            );

        info!(
            stream = %config.stream_name,
            group = %config.consumer_group,
            consumer = %config.consumer_name,
            handler = %handler.name(),
            group_created = ?created,
            replaced = previous.is_some(),
            "Registered stream"
        );

        Ok(config)
    }

    /// Names of all registered streams, sorted.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stream_config(&self, name: &str) -> Option<Arc<StreamConfig>> {
        self.registry().get(name).map(|r| r.config.clone())
    }

    /// Spawn the consumer for a registered stream.
    ///
    /// Does nothing if that consumer is already running.
    pub fn start_consumer(&self, name: &str) -> Result<(), StreamError> {
        if *self.shutdown_tx.borrow() {
            return Err(StreamError::config("queue manager has been stopped"));
        }

        let registration = self.registration(name)?;
        let mut consumers = self.running();

        if consumers.contains_key(name) {
            debug!(stream = %name, "Consumer already running");
            return Ok(());
        }

        let consumer = Arc::new(StreamConsumer::new(
            self.store.clone(),
            registration.config,
            registration.handler,
        ));
        let tasks = consumer.start(self.shutdown_tx.subscribe());

        consumers.insert(name.to_string(), RunningConsumer { consumer, tasks });
        Ok(())
    }

    /// Spawn consumers for every registered stream.
    pub fn start_all_consumers(&self) -> Result<(), StreamError> {
        for name in self.stream_names() {
            self.start_consumer(&name)?;
        }
        Ok(())
    }

    /// The running consumer for a stream, if started.
    pub fn consumer(&self, name: &str) -> Option<Arc<StreamConsumer>> {
        self.running().get(name).map(|r| r.consumer.clone())
    }

    /// Append a message to a registered stream.
    ///
    /// Every field is JSON-encoded on its own; `published_at` and
    /// `attempts=0` are stamped. The stream is approximately trimmed to
    /// `max_len`. Returns the new entry ID.
    pub async fn publish(&self, name: &str, data: &Payload) -> Result<String, StreamError> {
        let config = self.registration(name)?.config;

        let mut record = encode_payload(data)?;
        stamp(&mut record);

        let id = self
            .store
            .append(&config.stream_name, &record, Some(config.max_len))
            .await?;

        QueueMetrics::published(name, "immediate");
        debug!(stream = %name, message_id = %id, "Published message");
        Ok(id)
    }

    /// Publish any value that serializes to a JSON object.
    pub async fn publish_json<T: Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<String, StreamError> {
        self.publish(name, &payload_from(value)?).await
    }

    /// Stage a message in `<name>_delayed`, due after `delay`.
    ///
    /// The promotion loop of the stream's consumer moves it to `<name>` once
    /// due. Returns the entry ID in the delayed stream.
    pub async fn publish_delayed(
        &self,
        name: &str,
        data: &Payload,
        delay: Duration,
    ) -> Result<String, StreamError> {
        let config = self.registration(name)?.config;

        let scheduled_for = due_after(delay)?;

        let mut record = encode_payload(data)?;
        stamp(&mut record);
        record.push((
            fields::SCHEDULED_FOR.to_string(),
            format_timestamp(scheduled_for),
        ));
        record.push((fields::DELAYED.to_string(), "true".to_string()));

        let id = self
            .store
            .append(&config.delayed_stream(), &record, None)
            .await?;

        QueueMetrics::published(name, "delayed");
        debug!(
            stream = %name,
            message_id = %id,
            scheduled_for = %format_timestamp(scheduled_for),
            "Published delayed message"
        );
        Ok(id)
    }

    /// Dead letter queue handle for a registered stream.
    pub fn dead_letters(&self, name: &str) -> Result<DeadLetterQueue, StreamError> {
        let config = self.registration(name)?.config;
        Ok(DeadLetterQueue::new(self.store.clone(), config))
    }

    /// Length, pending count and consumer count per registered stream.
    ///
    /// Best effort: a failing lookup reports zero.
    pub async fn get_stats(&self) -> BTreeMap<String, QueueStats> {
        let configs: Vec<Arc<StreamConfig>> =
            self.registry().values().map(|r| r.config.clone()).collect();

        let mut stats = BTreeMap::new();
        for config in configs {
            let length = match self.store.len(&config.stream_name).await {
                Ok(length) => length,
                Err(e) => {
                    debug!(stream = %config.stream_name, error = %e, "Stream length unavailable");
                    0
                }
            };
            let pending = match self
                .store
                .pending_summary(&config.stream_name, &config.consumer_group)
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    debug!(stream = %config.stream_name, error = %e, "Pending summary unavailable");
                    Default::default()
                }
            };

            QueueMetrics::depth(&config.stream_name, length, pending.count);
            stats.insert(
                config.stream_name.clone(),
                QueueStats {
                    stream_name: config.stream_name.clone(),
                    length,
                    consumer_group: config.consumer_group.clone(),
                    pending_messages: pending.count,
                    consumers: pending.consumers,
                },
            );
        }
        stats
    }

    /// Stop every consumer and wait for their loops to exit. Idempotent.
    pub async fn stop(&self) {
        let already_stopped = self.shutdown_tx.send_replace(true);

        let running: Vec<RunningConsumer> = self.running().drain().map(|(_, r)| r).collect();
        if already_stopped && running.is_empty() {
            return;
        }

        info!(consumers = running.len(), "Stopping stream consumers");
        for entry in &running {
            entry.consumer.stop();
        }

        for entry in running {
            for task in entry.tasks {
                if let Err(e) = task.await {
                    warn!(stream = %entry.consumer.stream_name(), error = %e, "Consumer task ended abnormally");
                }
            }
        }

        info!("Stream queue manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registration(&self, name: &str) -> Result<Registration, StreamError> {
        self.registry()
            .get(name)
            .cloned()
            .ok_or_else(|| StreamError::UnknownStream(name.to_string()))
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningConsumer>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stamp(record: &mut Fields) {
    record.push((
        fields::PUBLISHED_AT.to_string(),
        format_timestamp(Utc::now()),
    ));
    record.push((fields::ATTEMPTS.to_string(), "0".to_string()));
}
