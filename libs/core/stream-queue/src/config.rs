//! Stream configuration
//!
//! One `StreamConfig` per registered stream. Zero-valued fields are replaced
//! by defaults at registration time and the config is read-only afterwards.

use crate::error::StreamError;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_LEN: u64 = 10_000;
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROMOTE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PROMOTE_BATCH: usize = 100;

/// Longest accepted publish delay or retry delay (365 days)
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Suffix of the retry/schedule staging stream.
pub const DELAYED_SUFFIX: &str = "_delayed";
/// Suffix of the dead-letter stream.
pub const DLQ_SUFFIX: &str = "_dlq";

/// Configuration for one stream and its consumer group
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamConfig {
    /// Primary stream name
    pub stream_name: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Consumer name inside the group (generated if empty)
    pub consumer_name: String,

    /// Delayed re-publications before a message is dead-lettered
    pub max_retries: u32,

    /// Delay before a failed message is retried; also the idle threshold for reclaiming
    #[serde(with = "millis")]
    pub retry_delay: Duration,

    /// Blocking read timeout
    #[serde(with = "millis")]
    pub block_duration: Duration,

    /// Entries fetched per read
    pub batch_size: usize,

    /// Approximate MAXLEN applied on append
    pub max_len: u64,

    /// Time budget for a single handler invocation
    #[serde(with = "millis")]
    pub handler_timeout: Duration,

    /// How often pending entries are inspected for reclamation
    #[serde(with = "millis")]
    pub claim_interval: Duration,

    /// How often the delayed stream is scanned for due entries
    #[serde(with = "millis")]
    pub promote_interval: Duration,

    /// Page size used when scanning the delayed stream
    pub promote_batch: usize,
}

impl StreamConfig {
    /// Create a config for a stream and group; everything else defaults.
    pub fn new(stream_name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
            ..Self::default()
        }
        .with_defaults()
    }

    /// Set the consumer name
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the blocking read timeout
    pub fn with_block_duration(mut self, block: Duration) -> Self {
        self.block_duration = block;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the maximum stream length
    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = max_len;
        self
    }

    /// Set the handler timeout
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the pending-reclamation interval
    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    /// Set the delayed-promotion interval
    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    /// Replace zero-valued fields with defaults.
    ///
    /// `max_retries == 0` is treated as unset, so a stream always gets at least one retry.
    pub fn with_defaults(mut self) -> Self {
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        if self.block_duration.is_zero() {
            self.block_duration = DEFAULT_BLOCK_DURATION;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.max_len == 0 {
            self.max_len = DEFAULT_MAX_LEN;
        }
        if self.handler_timeout.is_zero() {
            self.handler_timeout = DEFAULT_HANDLER_TIMEOUT;
        }
        if self.claim_interval.is_zero() {
            self.claim_interval = DEFAULT_CLAIM_INTERVAL;
        }
        if self.promote_interval.is_zero() {
            self.promote_interval = DEFAULT_PROMOTE_INTERVAL;
        }
        if self.promote_batch == 0 {
            self.promote_batch = DEFAULT_PROMOTE_BATCH;
        }
        if self.consumer_name.is_empty() {
            self.consumer_name = format!("consumer-{}", Uuid::new_v4());
        }
        self
    }

    /// Reject configs that cannot address a stream.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.stream_name.trim().is_empty() {
            return Err(StreamError::config("stream name must not be empty"));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(StreamError::config(format!(
                "consumer group for stream {} must not be empty",
                self.stream_name
            )));
        }
        if self.retry_delay > MAX_DELAY {
            return Err(StreamError::config(format!(
                "retry delay for stream {} exceeds {}s",
                self.stream_name,
                MAX_DELAY.as_secs()
            )));
        }
        Ok(())
    }

    /// `<stream>_delayed`
    pub fn delayed_stream(&self) -> String {
        delayed_stream_name(&self.stream_name)
    }

    /// `<stream>_dlq`
    pub fn dlq_stream(&self) -> String {
        dlq_stream_name(&self.stream_name)
    }
}

pub fn delayed_stream_name(stream: &str) -> String {
    format!("{stream}{DELAYED_SUFFIX}")
}

pub fn dlq_stream_name(stream: &str) -> String {
    format!("{stream}{DLQ_SUFFIX}")
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
