//! Stream consumer
//!
//! One `StreamConsumer` per registered stream runs three independent loops:
//!
//! - **consume**: blocking group reads of undelivered entries
//! - **reclaim**: claims entries left pending longer than `retry_delay`
//! - **promote**: moves due entries from `<stream>_delayed` back to `<stream>`
//!
//! Every delivery is acknowledged after the handler attempt, success or not.
//! Retries are driven by the delayed-stream republish, never by leaving the
//! entry pending. A crash between a failed attempt and the republish loses
//! the message.

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::handler::MessageHandler;
use crate::message::{
    Fields, Message, due_after, field, fields, format_timestamp, parse_timestamp,
};
use crate::metrics::QueueMetrics;
use crate::store::{GroupCreation, StreamEntry, StreamStore};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Pending entries inspected per reclamation pass
const RECLAIM_BATCH: usize = 100;

/// Back-off after a failed read
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer for a single stream and consumer group
pub struct StreamConsumer {
    store: Arc<dyn StreamStore>,
    config: Arc<StreamConfig>,
    handler: Arc<dyn MessageHandler>,
    metrics: QueueMetrics,
    stop_tx: watch::Sender<bool>,
}

impl StreamConsumer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        config: Arc<StreamConfig>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let metrics = QueueMetrics::new(&config.stream_name, handler.name());
        let (stop_tx, _) = watch::channel(false);

        Self {
            store,
            config,
            handler,
            metrics,
            stop_tx,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    /// Spawn the consume, reclaim and promote loops.
    ///
    /// The loops exit when `shutdown` flips to `true` (or its sender is
    /// dropped) or when [`stop`](Self::stop) is called.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            stream = %self.config.stream_name,
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            handler = %self.handler.name(),
            "Starting stream consumer"
        );

        let signal = StopSignal {
            shutdown,
            stop: self.stop_tx.subscribe(),
        };

        vec![
            tokio::spawn(self.clone().consume_loop(signal.clone())),
            tokio::spawn(self.clone().reclaim_loop(signal.clone())),
            tokio::spawn(self.clone().promote_loop(signal)),
        ]
    }

    /// Signal this consumer's loops to exit. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    async fn consume_loop(self: Arc<Self>, mut signal: StopSignal) {
        while !signal.is_set() {
            let read = tokio::select! {
                _ = signal.wait() => break,
                read = self.read_batch() => read,
            };

            match read {
                Ok(entries) => {
                    // An in-flight batch is always finished so nothing is left half-handled.
                    for entry in entries {
                        self.process_entry(entry).await;
                    }
                }
                Err(e) => {
                    if e.is_nogroup() {
                        warn!(stream = %self.config.stream_name, "Consumer group missing, recreating");
                        if let Err(create_err) = self.ensure_group().await {
                            error!(error = %create_err, "Failed to recreate consumer group");
                        }
                    } else {
                        warn!(
                            stream = %self.config.stream_name,
                            error = %e,
                            "Failed to read from stream, backing off"
                        );
                    }

                    tokio::select! {
                        _ = signal.wait() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        debug!(stream = %self.config.stream_name, "Consume loop stopped");
    }

    async fn reclaim_loop(self: Arc<Self>, mut signal: StopSignal) {
        let period = self.config.claim_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.reclaim_pending().await {
                warn!(stream = %self.config.stream_name, error = %e, "Failed to reclaim pending messages");
            }
        }

        debug!(stream = %self.config.stream_name, "Reclaim loop stopped");
    }

    async fn promote_loop(self: Arc<Self>, mut signal: StopSignal) {
        let period = self.config.promote_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.promote_delayed().await {
                warn!(stream = %self.config.stream_name, error = %e, "Failed to promote delayed messages");
            }
        }

        debug!(stream = %self.config.stream_name, "Promote loop stopped");
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn ensure_group(&self) -> Result<(), StreamError> {
        match self
            .store
            .create_group(&self.config.stream_name, &self.config.consumer_group)
            .await?
        {
            GroupCreation::Created => info!(
                stream = %self.config.stream_name,
                group = %self.config.consumer_group,
                "Created consumer group"
            ),
            GroupCreation::AlreadyExists => debug!(
                stream = %self.config.stream_name,
                group = %self.config.consumer_group,
                "Consumer group already exists"
            ),
        }
        Ok(())
    }

    async fn read_batch(&self) -> Result<Vec<StreamEntry>, StreamError> {
        self.store
            .read_group(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_name,
                self.config.batch_size,
                Some(self.config.block_duration),
            )
            .await
    }

    /// Read one batch of new entries and process it.
    ///
    /// Returns the number of entries handled.
    pub async fn consume_once(&self) -> Result<usize, StreamError> {
        let entries = self.read_batch().await?;
        let count = entries.len();
        for entry in entries {
            self.process_entry(entry).await;
        }
        Ok(count)
    }

    /// Claim this consumer's entries that have been pending longer than
    /// `retry_delay` and process them again.
    pub async fn reclaim_pending(&self) -> Result<usize, StreamError> {
        let pending = self
            .store
            .pending(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_name,
                RECLAIM_BATCH,
            )
            .await?;

        let stale: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle > self.config.retry_delay)
            .map(|p| p.id)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let claimed = self
            .store
            .claim(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.config.consumer_name,
                self.config.retry_delay,
                &stale,
            )
            .await?;

        let count = claimed.len();
        if count > 0 {
            warn!(stream = %self.config.stream_name, count, "Reclaimed stale pending messages");
            self.metrics.reclaimed(count);
        }

        for entry in claimed {
            self.process_entry(entry).await;
        }

        Ok(count)
    }

    /// Move every due entry of `<stream>_delayed` back to `<stream>`.
    ///
    /// The delayed stream is scanned from the start in pages of
    /// `promote_batch`. Returns the number of promoted entries.
    pub async fn promote_delayed(&self) -> Result<usize, StreamError> {
        let delayed = self.config.delayed_stream();
        let now = Utc::now();
        let mut after: Option<String> = None;
        let mut promoted = 0;

        loop {
            let page = self
                .store
                .range(&delayed, after.as_deref(), self.config.promote_batch)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let full_page = page.len() == self.config.promote_batch;

            for entry in page {
                if !self.is_due(&entry, now) {
                    continue;
                }

                let promoted_fields: Fields = entry
                    .fields
                    .into_iter()
                    .filter(|(key, _)| !fields::DELAY_METADATA.contains(&key.as_str()))
                    .collect();

                let new_id = self
                    .store
                    .append(&self.config.stream_name, &promoted_fields, Some(self.config.max_len))
                    .await?;
                self.store.delete(&delayed, &[entry.id.clone()]).await?;

                debug!(
                    stream = %self.config.stream_name,
                    delayed_id = %entry.id,
                    message_id = %new_id,
                    "Promoted delayed message"
                );
                promoted += 1;
            }

            if !full_page {
                break;
            }
        }

        if promoted > 0 {
            info!(stream = %self.config.stream_name, count = promoted, "Promoted delayed messages");
            self.metrics.promoted(promoted);
        }

        Ok(promoted)
    }

    fn is_due(&self, entry: &StreamEntry, now: DateTime<Utc>) -> bool {
        let due_at = field(&entry.fields, fields::SCHEDULED_FOR)
            .or_else(|| field(&entry.fields, fields::RETRY_AT));

        match due_at.map(|raw| (raw, parse_timestamp(raw))) {
            Some((_, Some(due))) => due <= now,
            Some((raw, None)) => {
                warn!(
                    stream = %self.config.stream_name,
                    entry_id = %entry.id,
                    due_at = %raw,
                    "Unparseable due time on delayed message, promoting now"
                );
                true
            }
            None => {
                warn!(
                    stream = %self.config.stream_name,
                    entry_id = %entry.id,
                    "Delayed message has no due time, promoting now"
                );
                true
            }
        }
    }

    /// Run the handler for one delivered entry, then retry or dead-letter on
    /// failure, then acknowledge.
    pub async fn process_entry(&self, entry: StreamEntry) {
        let message = Message::from_entry(&self.config.stream_name, &entry);
        let started = Instant::now();

        match self.run_handler(&message).await {
            Ok(()) => {
                self.metrics.processed(started.elapsed());
                debug!(
                    stream = %self.config.stream_name,
                    message_id = %message.id,
                    attempts = message.attempts,
                    "Processed message"
                );
            }
            Err(e) => {
                self.metrics.failed(started.elapsed());
                if let Err(store_err) = self.handle_failure(&message, &e).await {
                    error!(
                        stream = %self.config.stream_name,
                        message_id = %message.id,
                        error = %store_err,
                        handler_error = %e,
                        "Failed to record failed message, it will not be retried"
                    );
                }
            }
        }

        if let Err(e) = self
            .store
            .ack(&self.config.stream_name, &self.config.consumer_group, &entry.id)
            .await
        {
            warn!(
                stream = %self.config.stream_name,
                message_id = %entry.id,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }

    async fn run_handler(&self, message: &Message) -> Result<(), StreamError> {
        let timeout = self.config.handler_timeout;
        let guarded = AssertUnwindSafe(self.handler.handle(message)).catch_unwind();

        match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(StreamError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(StreamError::Timeout(timeout)),
        }
    }

    async fn handle_failure(&self, message: &Message, err: &StreamError) -> Result<(), StreamError> {
        if message.previous_failures() < self.config.max_retries {
            self.schedule_retry(message, err).await
        } else {
            self.dead_letter(message, err).await
        }
    }

    async fn schedule_retry(&self, message: &Message, err: &StreamError) -> Result<(), StreamError> {
        let retry_at = due_after(self.config.retry_delay)?;

        let mut record = message.encoded_payload()?;
        record.push((
            fields::PUBLISHED_AT.to_string(),
            format_timestamp(message.timestamp),
        ));
        record.push((fields::ATTEMPTS.to_string(), message.attempts.to_string()));
        record.push((fields::LAST_ERROR.to_string(), err.to_string()));
        record.push((fields::RETRY_AT.to_string(), format_timestamp(retry_at)));

        let retry_id = self
            .store
            .append(&self.config.delayed_stream(), &record, None)
            .await?;

        self.metrics.retried();
        warn!(
            stream = %self.config.stream_name,
            message_id = %message.id,
            retry_id = %retry_id,
            attempts = message.attempts,
            max_retries = self.config.max_retries,
            error = %err,
            "Message failed, scheduled for retry"
        );
        Ok(())
    }

    async fn dead_letter(&self, message: &Message, err: &StreamError) -> Result<(), StreamError> {
        let mut record = message.encoded_payload()?;
        record.push((
            fields::PUBLISHED_AT.to_string(),
            format_timestamp(message.timestamp),
        ));
        record.push((fields::ORIGINAL_MESSAGE_ID.to_string(), message.id.clone()));
        record.push((fields::FAILED_AT.to_string(), format_timestamp(Utc::now())));
        record.push((fields::ERROR.to_string(), err.to_string()));
        record.push((fields::ATTEMPTS.to_string(), message.attempts.to_string()));

        let dlq_id = self
            .store
            .append(&self.config.dlq_stream(), &record, None)
            .await?;

        self.metrics.dead_lettered();
        error!(
            stream = %self.config.stream_name,
            message_id = %message.id,
            dlq_id = %dlq_id,
            attempts = message.attempts,
            error = %err,
            "Message exhausted retries, moved to dead letter queue"
        );
        Ok(())
    }
}

/// Shutdown from the manager or a stop request for this consumer.
#[derive(Clone)]
struct StopSignal {
    shutdown: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
}

impl StopSignal {
    fn is_set(&self) -> bool {
        *self.shutdown.borrow() || *self.stop.borrow()
    }

    /// Resolves once either side is set or its sender is gone.
    async fn wait(&mut self) {
        while !self.is_set() {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
