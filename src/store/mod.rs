//! Log store access.
//!
//! [`StreamStore`] is the boundary between the engine and the append-only log.
//! Every method is one round trip on one pooled connection; nothing is held
//! between calls.
//!
//! ## Implementations
//!
//! - [`RedisStore`]: Redis Streams through a `deadpool-redis` pool
//! - [`MemoryStore`]: in-process store with the same consumer-group rules,
//!   used by tests and for embedding

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::entry::{Fields, PendingEntry, RawEntry, ReadOffset, StreamId};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Consumer-group operations against an append-only log.
///
/// Implementations must be `Send + Sync`; one store is shared by every task of
/// a worker pool.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create `group` on `stream`, positioned at the current tail.
    ///
    /// Fails with [`StoreError::GroupExists`] when the group is already there
    /// and [`StoreError::MissingKey`] when the stream does not exist.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Read up to `count` entries for `consumer`.
    ///
    /// With [`ReadOffset::New`] the entries become pending for `consumer` and
    /// the call may wait up to `block` for new entries. With
    /// [`ReadOffset::After`] the consumer's own pending entries are returned
    /// without blocking. An empty vector means nothing was available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        offset: ReadOffset,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<RawEntry>, StoreError>;

    /// Acknowledge entries. Unknown or already acknowledged IDs are ignored.
    /// Returns how many entries were actually acknowledged.
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, StoreError>;

    /// List up to `count` pending entries of the group, lowest ID first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Move pending entries idle for at least `min_idle` to `consumer`.
    /// Returns the IDs actually claimed. Claiming does not count as a delivery.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>, StoreError>;

    /// Remove entries from the stream. Returns how many existed.
    async fn delete(&self, stream: &str, ids: &[StreamId]) -> Result<u64, StoreError>;

    /// Append an entry with a store-assigned ID.
    async fn append(&self, stream: &str, fields: &Fields) -> Result<StreamId, StoreError>;

    /// Fetch a single entry's fields.
    async fn fetch(&self, stream: &str, id: StreamId) -> Result<Option<Fields>, StoreError>;
}
