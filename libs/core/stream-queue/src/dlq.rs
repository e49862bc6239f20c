//! Dead letter queue inspection
//!
//! `<stream>_dlq` is a plain stream without a consumer group. Operators read
//! it page by page, delete entries, or requeue them onto the primary stream.

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::message::{Payload, encode_payload, field, fields, format_timestamp, parse_timestamp};
use crate::metrics::QueueMetrics;
use crate::store::{StreamEntry, StreamStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Fields written by the consumer on dead-lettering; not part of the payload.
const DLQ_METADATA: [&str; 6] = [
    fields::ORIGINAL_MESSAGE_ID,
    fields::FAILED_AT,
    fields::ERROR,
    fields::ATTEMPTS,
    fields::PUBLISHED_AT,
    fields::LAST_ERROR,
];

/// A dead-lettered message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    /// Entry ID in the DLQ stream
    pub id: String,

    /// Entry ID of the last failed delivery on the primary stream
    pub original_message_id: Option<String>,

    /// Error of the final attempt
    pub error: Option<String>,

    /// Total deliveries before giving up
    pub attempts: u32,

    pub failed_at: Option<DateTime<Utc>>,

    /// Decoded application payload
    pub data: Payload,
}

impl DeadLetter {
    pub fn from_entry(entry: &StreamEntry) -> Self {
        let data = entry
            .fields
            .iter()
            .filter(|(key, _)| !DLQ_METADATA.contains(&key.as_str()))
            .map(|(key, value)| {
                let decoded = serde_json::from_str::<Value>(value)
                    .unwrap_or_else(|_| Value::String(value.clone()));
                (key.clone(), decoded)
            })
            .collect();

        Self {
            id: entry.id.clone(),
            original_message_id: field(&entry.fields, fields::ORIGINAL_MESSAGE_ID)
                .map(str::to_string),
            error: field(&entry.fields, fields::ERROR).map(str::to_string),
            attempts: field(&entry.fields, fields::ATTEMPTS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            failed_at: field(&entry.fields, fields::FAILED_AT).and_then(parse_timestamp),
            data,
        }
    }
}

/// Handle over one stream's dead letter queue
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn StreamStore>,
    config: Arc<StreamConfig>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn StreamStore>, config: Arc<StreamConfig>) -> Self {
        Self { store, config }
    }

    /// Name of the DLQ stream
    pub fn stream_name(&self) -> String {
        self.config.dlq_stream()
    }

    pub async fn len(&self) -> Result<u64, StreamError> {
        self.store.len(&self.stream_name()).await
    }

    pub async fn is_empty(&self) -> Result<bool, StreamError> {
        Ok(self.len().await? == 0)
    }

    /// List up to `count` dead letters, oldest first, starting after `after`.
    pub async fn list(
        &self,
        count: usize,
        after: Option<&str>,
    ) -> Result<Vec<DeadLetter>, StreamError> {
        let entries = self.store.range(&self.stream_name(), after, count).await?;
        Ok(entries.iter().map(DeadLetter::from_entry).collect())
    }

    /// Remove a single dead letter. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, StreamError> {
        let deleted = self
            .store
            .delete(&self.stream_name(), &[id.to_string()])
            .await?;
        Ok(deleted > 0)
    }

    /// Drop every dead letter. Returns the number removed.
    pub async fn purge(&self) -> Result<u64, StreamError> {
        let purged = self.store.trim(&self.stream_name(), 0).await?;
        info!(stream = %self.config.stream_name, purged, "Purged dead letter queue");
        Ok(purged)
    }

    /// Publish a dead letter's payload to the primary stream as a fresh
    /// message (`attempts=0`) and remove it from the DLQ.
    ///
    /// Returns the new entry ID, or `None` if no such dead letter exists.
    pub async fn requeue(&self, id: &str) -> Result<Option<String>, StreamError> {
        let dlq = self.stream_name();
        let Some(entry) = self.store.get(&dlq, id).await? else {
            return Ok(None);
        };

        let letter = DeadLetter::from_entry(&entry);
        let mut record = encode_payload(&letter.data)?;
        record.push((
            fields::PUBLISHED_AT.to_string(),
            format_timestamp(Utc::now()),
        ));
        record.push((fields::ATTEMPTS.to_string(), "0".to_string()));

        let new_id = self
            .store
            .append(&self.config.stream_name, &record, Some(self.config.max_len))
            .await?;
        self.store.delete(&dlq, &[entry.id.clone()]).await?;

        QueueMetrics::published(&self.config.stream_name, "requeued");
        info!(
            stream = %self.config.stream_name,
            dlq_id = %entry.id,
            message_id = %new_id,
            "Requeued dead letter"
        );
        Ok(Some(new_id))
    }
}
