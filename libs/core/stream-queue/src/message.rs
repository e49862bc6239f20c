//! Message envelope and log-entry field encoding
//!
//! Every application field is stored as its own JSON-encoded string value.
//! Reserved fields carry queue metadata and are written as plain strings.

use crate::config::MAX_DELAY;
use crate::error::StreamError;
use crate::store::StreamEntry;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Ordered application payload.
pub type Payload = BTreeMap<String, Value>;

/// Raw field/value pairs as stored in a log entry.
pub type Fields = Vec<(String, String)>;

/// Reserved field names.
pub mod fields {
    pub const PUBLISHED_AT: &str = "published_at";
    pub const ATTEMPTS: &str = "attempts";
    pub const SCHEDULED_FOR: &str = "scheduled_for";
    pub const DELAYED: &str = "delayed";
    pub const LAST_ERROR: &str = "last_error";
    pub const RETRY_AT: &str = "retry_at";
    pub const ORIGINAL_MESSAGE_ID: &str = "original_message_id";
    pub const FAILED_AT: &str = "failed_at";
    pub const ERROR: &str = "error";

    /// Fields that only steer delayed delivery and are dropped on promotion.
    pub const DELAY_METADATA: [&str; 3] = [SCHEDULED_FOR, DELAYED, RETRY_AT];
}

/// A message delivered to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Log entry ID (e.g. "1700000000000-0")
    pub id: String,

    /// Primary stream the message belongs to
    pub stream: String,

    /// Decoded application fields
    pub data: Payload,

    /// When the message was first published (delivery time if unknown)
    pub timestamp: DateTime<Utc>,

    /// Delivery number of this attempt, starting at 1
    pub attempts: u32,

    /// Error of the previous failed attempt, if this is a retry
    pub last_error: Option<String>,
}

impl Message {
    /// Build a message from a delivered log entry.
    ///
    /// Non-JSON values are kept as plain strings.
    pub fn from_entry(stream: &str, entry: &StreamEntry) -> Self {
        let mut message = Message {
            id: entry.id.clone(),
            stream: stream.to_string(),
            data: Payload::new(),
            timestamp: Utc::now(),
            attempts: 1,
            last_error: None,
        };

        for (key, value) in &entry.fields {
            match key.as_str() {
                fields::PUBLISHED_AT => {
                    if let Some(ts) = parse_timestamp(value) {
                        message.timestamp = ts;
                    }
                }
                fields::ATTEMPTS => {
                    message.attempts = parse_attempts(value).saturating_add(1);
                }
                fields::LAST_ERROR => {
                    message.last_error = Some(value.clone());
                }
                fields::SCHEDULED_FOR | fields::DELAYED | fields::RETRY_AT => {}
                _ => {
                    let decoded = serde_json::from_str::<Value>(value)
                        .unwrap_or_else(|_| Value::String(value.clone()));
                    message.data.insert(key.clone(), decoded);
                }
            }
        }

        message
    }

    /// Failed deliveries that happened before this one.
    pub fn previous_failures(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Get a single decoded field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Reassemble the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        let object: serde_json::Map<String, Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Re-encode the application payload for republishing.
    pub fn encoded_payload(&self) -> Result<Fields, StreamError> {
        encode_payload(&self.data)
    }
}

/// Split a serializable struct into a payload of its top-level fields.
pub fn payload_from<T: Serialize>(value: &T) -> Result<Payload, StreamError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(StreamError::Serialization(format!(
            "payload must serialize to a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// JSON-encode every application field individually.
pub fn encode_payload(data: &Payload) -> Result<Fields, StreamError> {
    data.iter()
        .map(|(key, value)| {
            serde_json::to_string(value)
                .map(|json| (key.clone(), json))
                .map_err(|e| StreamError::Serialization(format!("failed to marshal field {key}: {e}")))
        })
        .collect()
}

/// RFC3339 with millisecond precision, UTC.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `now + delay`, rejecting delays above `MAX_DELAY` or past the calendar range.
pub fn due_after(delay: Duration) -> Result<DateTime<Utc>, StreamError> {
    if delay > MAX_DELAY {
        return Err(StreamError::config(format!(
            "delay out of range: {}s exceeds {}s",
            delay.as_secs(),
            MAX_DELAY.as_secs()
        )));
    }

    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or_else(|| StreamError::config("delay out of range"))
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim_matches('"'))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_attempts(value: &str) -> u32 {
    value.trim_matches('"').parse().unwrap_or(0)
}

/// Look up a field in raw entry fields.
pub fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
