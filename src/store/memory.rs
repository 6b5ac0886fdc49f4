//! In-process store with Redis consumer-group semantics.
//!
//! Mirrors the behavior the engine relies on:
//!
//! - groups start at the stream tail and never see older entries
//! - a `>` read hands entries to one consumer and records them as pending
//! - a history read returns the consumer's own pending entries, bumps their
//!   delivery count and resets their idle clock; deleted entries come back
//!   without fields
//! - claims respect the minimum idle time and do not bump the delivery count
//! - acknowledging unknown IDs is a no-op
//!
//! Idle times use [`tokio::time::Instant`], so tests can drive them with a
//! paused clock.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::StreamStore;
use crate::entry::{Fields, PendingEntry, RawEntry, ReadOffset, StreamId};
use crate::error::StoreError;

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&self) -> StreamId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now_ms > self.last_id.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(self.last_id.ms, self.last_id.seq + 1)
        }
    }
}

/// A [`StreamStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::MissingKey(format!(
        "NOGROUP No such key '{stream}' or consumer group '{group}'"
    ))
}

fn snapshot(group: &GroupState) -> Vec<PendingEntry> {
    let now = Instant::now();
    group
        .pending
        .iter()
        .map(|(id, p)| PendingEntry {
            id: *id,
            consumer: p.consumer.clone(),
            idle: now.saturating_duration_since(p.delivered_at),
            deliveries: p.deliveries,
        })
        .collect()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        // A panicking test thread must not poison the store for the others.
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry with an explicit ID. IDs must keep increasing.
    pub fn append_with_id(
        &self,
        stream: &str,
        id: StreamId,
        fields: Fields,
    ) -> Result<StreamId, StoreError> {
        {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            if id <= state.last_id {
                return Err(StoreError::Command(format!(
                    "ERR The ID specified in XADD is equal or smaller than the target stream top item ({} <= {})",
                    id, state.last_id
                )));
            }
            state.entries.insert(id, fields);
            state.last_id = id;
        }
        self.appended.notify_waiters();
        Ok(id)
    }

    /// Append a single-field entry with a store-assigned ID.
    pub fn append_payload(
        &self,
        stream: &str,
        field: &str,
        payload: impl Into<Vec<u8>>,
    ) -> StreamId {
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state
                .entries
                .insert(id, vec![(field.to_string(), payload.into())]);
            state.last_id = id;
            id
        };
        self.appended.notify_waiters();
        id
    }

    pub fn contains(&self, stream: &str, id: StreamId) -> bool {
        self.lock()
            .get(stream)
            .is_some_and(|s| s.entries.contains_key(&id))
    }

    pub fn len(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.lock()
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    /// Snapshot of every pending entry of a group.
    pub fn pending_snapshot(&self, stream: &str, group: &str) -> Vec<PendingEntry> {
        let streams = self.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(snapshot)
            .unwrap_or_default()
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
    ) -> Result<Vec<RawEntry>, StoreError> {
        let mut streams = self.lock();
        let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();

        match offset {
            ReadOffset::New => {
                let start = group_state.last_delivered;
                let batch: Vec<RawEntry> = entries
                    .range(start..)
                    .filter(|(id, _)| **id > start)
                    .take(count)
                    .map(|(id, fields)| RawEntry::new(*id, fields.clone()))
                    .collect();
                for entry in &batch {
                    group_state.pending.insert(
                        entry.id,
                        PendingState {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            deliveries: 1,
                        },
                    );
                    group_state.last_delivered = entry.id;
                }
                Ok(batch)
            }
            ReadOffset::After(after) => {
                let batch = group_state
                    .pending
                    .range_mut(after..)
                    .filter(|(id, p)| **id > after && p.consumer == consumer)
                    .take(count)
                    .map(|(id, p)| {
                        p.deliveries += 1;
                        p.delivered_at = now;
                        match entries.get(id) {
                            Some(fields) => RawEntry::new(*id, fields.clone()),
                            None => RawEntry::tombstone(*id),
                        }
                    })
                    .collect();
                Ok(batch)
            }
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut streams = self.lock();
        let state = streams.get_mut(stream).ok_or_else(|| {
            StoreError::MissingKey(format!(
                "The XGROUP subcommand requires the key to exist: {stream}"
            ))
        })?;
        if state.groups.contains_key(group) {
            return Err(StoreError::GroupExists(format!(
                "BUSYGROUP Consumer Group name already exists: {group}"
            )));
        }
        let last_delivered = state.last_id;
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<RawEntry>, StoreError> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.try_read(stream, group, consumer, offset, count)?;
            if !batch.is_empty() || !offset.is_new() {
                return Ok(batch);
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                _ => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, StoreError> {
        let mut streams = self.lock();
        let Some(group_state) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let streams = self.lock();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let mut pending = snapshot(group_state);
        pending.truncate(count);
        Ok(pending)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>, StoreError> {
        let mut streams = self.lock();
        let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();

        let mut claimed = Vec::new();
        for id in ids {
            if !entries.contains_key(id) {
                // Deleted entries drop out of the pending list on claim
                group_state.pending.remove(id);
                continue;
            }
            if let Some(p) = group_state.pending.get_mut(id) {
                if now.saturating_duration_since(p.delivered_at) >= min_idle {
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn delete(&self, stream: &str, ids: &[StreamId]) -> Result<u64, StoreError> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let removed = ids
            .iter()
            .filter(|id| state.entries.remove(id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn append(&self, stream: &str, fields: &Fields) -> Result<StreamId, StoreError> {
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.entries.insert(id, fields.clone());
            state.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn fetch(&self, stream: &str, id: StreamId) -> Result<Option<Fields>, StoreError> {
        Ok(self
            .lock()
            .get(stream)
            .and_then(|s| s.entries.get(&id).cloned()))
    }
}
