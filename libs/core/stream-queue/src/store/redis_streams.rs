//! Redis Streams implementation of `StreamStore`.

use super::{GroupCreation, PendingEntry, PendingSummary, StreamEntry, StreamStore};
use crate::error::StreamError;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

// Raw reply shapes
type EntryReply = Vec<(String, Vec<(String, String)>)>;
type ReadReply = Vec<(String, EntryReply)>;
type PendingSummaryReply = (u64, Option<String>, Option<String>, Option<Vec<(String, String)>>);

/// Extra time a blocking reader waits for a reply beyond the server-side BLOCK
pub const BLOCKING_READ_MARGIN: Duration = Duration::from_secs(2);

/// Redis Streams backed log.
///
/// Non-blocking commands share one `ConnectionManager`. A blocking
/// `XREADGROUP` holds its connection on the server until BLOCK elapses, so
/// each consumer gets a dedicated reader connection whose response timeout
/// outlasts the block. Readers are opened on first use and reused after.
#[derive(Clone)]
pub struct RedisStreamStore {
    client: Client,
    redis: ConnectionManager,
    readers: Arc<Mutex<HashMap<String, ConnectionManager>>>,
}

impl RedisStreamStore {
    /// `redis` serves every non-blocking command; `client` opens the
    /// per-consumer blocking readers.
    pub fn new(client: Client, redis: ConnectionManager) -> Self {
        Self {
            client,
            redis,
            readers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the shared connection from `client` and build the store.
    pub async fn connect(client: Client) -> Result<Self, StreamError> {
        let redis = ConnectionManager::new(client.clone()).await?;
        Ok(Self::new(client, redis))
    }

    /// Get a clone of the shared Redis connection
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Number of dedicated blocking-read connections opened so far
    pub fn reader_count(&self) -> usize {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dedicated connection for blocking reads of one consumer.
    async fn reader(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<ConnectionManager, StreamError> {
        let key = format!("{stream}:{group}:{consumer}");

        let existing = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let config = ConnectionManagerConfig::new()
            .set_response_timeout(Some(block.saturating_add(BLOCKING_READ_MARGIN)));
        let conn = ConnectionManager::new_with_config(self.client.clone(), config).await?;
        info!(stream = %stream, group = %group, consumer = %consumer, "Opened blocking reader connection");

        // A concurrent call may have won the race; keep whichever landed first.
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(readers.entry(key).or_insert(conn).clone())
    }

    fn to_entries(reply: EntryReply) -> Vec<StreamEntry> {
        reply
            .into_iter()
            .map(|(id, fields)| StreamEntry { id, fields })
            .collect()
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, StreamError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            // Approximate trimming keeps XADD O(1)
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = match block {
            Some(block) => self.reader(stream, group, consumer, block).await?,
            None => self.redis.clone(),
        };

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">");

        let result: RedisResult<Option<ReadReply>> = cmd.query_async(&mut conn).await;

        match result {
            Ok(Some(streams)) => Ok(streams
                .into_iter()
                .flat_map(|(_, entries)| Self::to_entries(entries))
                .collect()),
            Ok(None) => Ok(vec![]),
            // The client gave up before BLOCK elapsed on the server; nothing arrived.
            Err(e) if block.is_some() && e.is_timeout() => {
                debug!(stream = %stream, "BLOCK read timed out on the client");
                Ok(vec![])
            }
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StreamError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id);
        }

        let reply: EntryReply = cmd.query_async(&mut conn).await?;
        Ok(Self::to_entries(reply))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn range(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let start = match after {
            Some(id) => format!("({id}"),
            None => "-".to_string(),
        };

        let reply: EntryReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(Self::to_entries(reply))
    }

    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: EntryReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(id)
            .arg(id)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(Self::to_entries(reply).into_iter().next())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.redis.clone();

        let deleted: u64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        Ok(deleted)
    }

    async fn len(&self, stream: &str) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn pending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StreamError> {
        let mut conn = self.redis.clone();

        let (count, _, _, consumers): PendingSummaryReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        Ok(PendingSummary {
            count,
            consumers: consumers.map(|c| c.len() as u64).unwrap_or(0),
        })
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();

        let evicted: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;

        Ok(evicted)
    }
}
