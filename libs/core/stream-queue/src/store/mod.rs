//! Append-only log primitive with consumer-group semantics.
//!
//! `StreamStore` is the only shared mutable resource the queue touches. It must
//! provide the consumer-group guarantees of Redis Streams: an entry delivered
//! with `>` is pending for exactly one consumer until acknowledged or claimed.

mod memory;
mod redis_streams;

pub use self::memory::MemoryStreamStore;
pub use self::redis_streams::RedisStreamStore;

use crate::error::StreamError;
use crate::message::Fields;
use async_trait::async_trait;
use std::time::Duration;

/// A log entry: ID plus raw field/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Fields,
}

/// An entry delivered to a consumer but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// Pending-entries summary for a consumer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub consumers: u64,
}

/// Outcome of creating a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// XGROUP CREATE <stream> <group> 0 MKSTREAM
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, StreamError>;

    /// XADD <stream> [MAXLEN ~ n] * fields...
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<String, StreamError>;

    /// XREADGROUP GROUP <group> <consumer> [BLOCK ms] COUNT n STREAMS <stream> >
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// XPENDING <stream> <group> - + <count> <consumer>
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError>;

    /// XCLAIM <stream> <group> <consumer> <min-idle> ids...
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// XACK <stream> <group> <id>
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// XRANGE <stream> (after|- + COUNT n
    async fn range(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// XRANGE <stream> <id> <id> COUNT 1
    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>, StreamError>;

    /// XDEL <stream> ids...
    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64, StreamError>;

    /// XLEN <stream>
    async fn len(&self, stream: &str) -> Result<u64, StreamError>;

    /// XPENDING <stream> <group>
    async fn pending_summary(&self, stream: &str, group: &str)
        -> Result<PendingSummary, StreamError>;

    /// XTRIM <stream> MAXLEN <n>; returns the number of evicted entries.
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StreamError>;
}
