//! In-process `StreamStore` with Redis consumer-group semantics.
//!
//! Used by the test suites and by single-process deployments that do not need
//! durability. IDs are `<unix-ms>-<seq>` and strictly increasing per stream.

use super::{GroupCreation, PendingEntry, PendingSummary, StreamEntry, StreamStore};
use crate::error::StreamError;
use crate::message::Fields;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

type EntryId = (u64, u64);

#[derive(Debug)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let id = if now_ms > self.last_id.0 {
            (now_ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }

    fn trim_to(&mut self, max_len: u64) -> u64 {
        let mut evicted = 0;
        while self.entries.len() as u64 > max_len {
            if self.entries.pop_first().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

/// Process-local log store.
#[derive(Default)]
pub struct MemoryStreamStore {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry in a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| to_entry(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let Stream {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;

        let start = (group_state.last_delivered.0, group_state.last_delivered.1.saturating_add(1));
        let now = Instant::now();
        let mut delivered = Vec::new();

        for (id, fields) in entries.range(start..).take(count) {
            group_state.pending.insert(
                *id,
                PendingInfo {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            group_state.last_delivered = *id;
            delivered.push(to_entry(*id, fields.clone()));
        }

        Ok(delivered)
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, StreamError> {
        let mut streams = self.lock();
        let state = streams.entry(stream.to_string()).or_default();

        if state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        state.groups.insert(group.to_string(), Group::default());
        Ok(GroupCreation::Created)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<u64>,
    ) -> Result<String, StreamError> {
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.entries.insert(id, fields.to_vec());
            if let Some(max_len) = max_len {
                state.trim_to(max_len);
            }
            id
        };

        self.appended.notify_waiters();
        Ok(format_id(id))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let Some(block) = block else {
            return self.try_read_group(stream, group, consumer, count);
        };

        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read_group(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let streams = self.lock();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| nogroup(stream, group))?;

        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .filter(|(_, info)| info.consumer == consumer)
            .take(count)
            .map(|(id, info)| PendingEntry {
                id: format_id(*id),
                consumer: info.consumer.clone(),
                idle: now.saturating_duration_since(info.delivered_at),
                deliveries: info.deliveries,
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
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let Stream {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();

        for raw in ids {
            let id = parse_id(raw)?;
            let Some(info) = group_state.pending.get_mut(&id) else {
                continue;
            };
            if now.saturating_duration_since(info.delivered_at) < min_idle {
                continue;
            }
            match entries.get(&id) {
                Some(fields) => {
                    info.consumer = consumer.to_string();
                    info.delivered_at = now;
                    info.deliveries += 1;
                    claimed.push(to_entry(id, fields.clone()));
                }
                None => {
                    // Entry was deleted or trimmed; drop the dangling pending record.
                    group_state.pending.remove(&id);
                }
            }
        }

        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let id = parse_id(id)?;
        let mut streams = self.lock();
        if let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            group_state.pending.remove(&id);
        }
        Ok(())
    }

    async fn range(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let start = match after {
            Some(raw) => {
                let (ms, seq) = parse_id(raw)?;
                match seq.checked_add(1) {
                    Some(seq) => (ms, seq),
                    None => (ms.saturating_add(1), 0),
                }
            }
            None => (0, 0),
        };

        let streams = self.lock();
        Ok(streams
            .get(stream)
            .map(|s| {
                s.entries
                    .range(start..)
                    .take(count)
                    .map(|(id, fields)| to_entry(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>, StreamError> {
        let id = parse_id(id)?;
        Ok(self
            .lock()
            .get(stream)
            .and_then(|s| s.entries.get(&id))
            .map(|fields| to_entry(id, fields.clone())))
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64, StreamError> {
        let parsed = ids
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        Ok(parsed
            .iter()
            .filter(|id| state.entries.remove(id).is_some())
            .count() as u64)
    }

    async fn len(&self, stream: &str) -> Result<u64, StreamError> {
        Ok(self
            .lock()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn pending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StreamError> {
        let streams = self.lock();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| nogroup(stream, group))?;

        let consumers: HashSet<&str> = group_state
            .pending
            .values()
            .map(|info| info.consumer.as_str())
            .collect();

        Ok(PendingSummary {
            count: group_state.pending.len() as u64,
            consumers: consumers.len() as u64,
        })
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, StreamError> {
        Ok(self
            .lock()
            .get_mut(stream)
            .map(|s| s.trim_to(max_len))
            .unwrap_or(0))
    }
}

fn nogroup(stream: &str, group: &str) -> StreamError {
    StreamError::Store(format!(
        "NOGROUP No such key '{stream}' or consumer group '{group}'"
    ))
}

fn format_id((ms, seq): EntryId) -> String {
    format!("{ms}-{seq}")
}

fn parse_id(raw: &str) -> Result<EntryId, StreamError> {
    let invalid = || StreamError::Store(format!("ERR Invalid stream ID specified: {raw}"));
    let (ms, seq) = raw.split_once('-').unwrap_or((raw, "0"));
    Ok((
        ms.parse().map_err(|_| invalid())?,
        seq.parse().map_err(|_| invalid())?,
    ))
}

fn to_entry(id: EntryId, fields: Fields) -> StreamEntry {
    StreamEntry {
        id: format_id(id),
        fields,
    }
}
