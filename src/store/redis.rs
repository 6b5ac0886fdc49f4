//! Redis Streams store backed by a `deadpool-redis` pool.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, RedisError, Value};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, PoolError, Runtime};
use std::time::Duration;
use tracing::debug;

use super::StreamStore;
use crate::config::RedisConfig;
use crate::decoder::{parse_entries, parse_read_reply};
use crate::entry::{Fields, PendingEntry, RawEntry, ReadOffset, StreamId};
use crate::error::StoreError;

/// [`StreamStore`] over Redis Streams.
///
/// The pool is an explicit handle: build it with [`RedisStore::from_config`]
/// or hand in an existing one with [`RedisStore::new`]. Dropping the store
/// (and every clone of the pool) closes it.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &RedisConfig) -> Result<Self, StoreError> {
        let mut cfg = Config::from_url(config.url.clone());
        cfg.pool = Some(PoolConfig::new(config.max_connections));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(kind) => StoreError::Timeout(format!("pool checkout: {kind:?}")),
            PoolError::Backend(inner) => inner.into(),
            other => StoreError::Connection(other.to_string()),
        })
    }
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            return StoreError::Timeout(e.to_string());
        }
        if e.is_connection_dropped() || e.is_connection_refusal() {
            return StoreError::Connection(e.to_string());
        }
        classify_message(&e.to_string())
    }
}

/// Map a Redis error message to an error class.
fn classify_message(message: &str) -> StoreError {
    let lower = message.to_ascii_lowercase();
    if message.contains("BUSYGROUP") || lower.contains("already exists") {
        StoreError::GroupExists(message.to_string())
    } else if message.contains("NOGROUP")
        || lower.contains("no such key")
        || lower.contains("requires the key to exist")
    {
        StoreError::MissingKey(message.to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        StoreError::Timeout(message.to_string())
    } else {
        StoreError::Command(message.to_string())
    }
}

fn parse_pending(rows: Vec<(String, String, u64, u64)>) -> Result<Vec<PendingEntry>, StoreError> {
    rows.into_iter()
        .map(|(id, consumer, idle_ms, deliveries)| {
            Ok(PendingEntry {
                id: id.parse()?,
                consumer,
                idle: Duration::from_millis(idle_ms),
                deliveries,
            })
        })
        .collect()
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .query_async(&mut conn)
            .await?;
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
        let mut conn = self.conn().await?;

        let mut command = cmd("XREADGROUP");
        command
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            command.arg("BLOCK").arg(block.as_millis() as u64);
        }
        command.arg("STREAMS").arg(stream).arg(offset.to_string());

        let reply: Value = command.query_async(&mut conn).await?;
        let entries = parse_read_reply(&reply)?;

        debug!(
            stream = %stream,
            consumer = %consumer,
            offset = %offset,
            count = entries.len(),
            "XREADGROUP"
        );
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let acked: u64 = cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids.iter().map(ToString::to_string).collect::<Vec<_>>())
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_pending(rows)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        // JUSTID leaves the delivery counter alone; the replay read that
        // follows is what counts as the redelivery.
        let claimed: Vec<String> = cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(ids.iter().map(ToString::to_string).collect::<Vec<_>>())
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        claimed
            .iter()
            .map(|id| id.parse().map_err(StoreError::from))
            .collect()
    }

    async fn delete(&self, stream: &str, ids: &[StreamId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = cmd("XDEL")
            .arg(stream)
            .arg(ids.iter().map(ToString::to_string).collect::<Vec<_>>())
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn append(&self, stream: &str, fields: &Fields) -> Result<StreamId, StoreError> {
        let mut conn = self.conn().await?;
        let mut command = cmd("XADD");
        command.arg(stream).arg("*");
        for (key, value) in fields {
            command.arg(key).arg(value.as_slice());
        }
        let id: String = command.query_async(&mut conn).await?;
        Ok(id.parse()?)
    }

    async fn fetch(&self, stream: &str, id: StreamId) -> Result<Option<Fields>, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Value = cmd("XRANGE")
            .arg(stream)
            .arg(id.to_string())
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        let entry = parse_entries(&reply)?.into_iter().find(|e| e.id == id);
        Ok(entry.and_then(|e| e.fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_busygroup() {
        assert!(matches!(
            classify_message("BUSYGROUP: Consumer Group name already exists"),
            StoreError::GroupExists(_)
        ));
    }

    #[test]
    fn test_classify_missing_key() {
        assert!(matches!(
            classify_message(
                "NOGROUP: No such key 'orders' or consumer group 'billing' in XREADGROUP with GROUP option"
            ),
            StoreError::MissingKey(_)
        ));
        assert!(matches!(
            classify_message(
                "An error was signalled by the server - ResponseError: The XGROUP subcommand requires the key to exist."
            ),
            StoreError::MissingKey(_)
        ));
    }

    #[test]
    fn test_classify_timeout_and_other() {
        assert!(matches!(
            classify_message("i/o timeout"),
            StoreError::Timeout(_)
        ));
        assert!(matches!(
            classify_message("WRONGTYPE Operation against a key holding the wrong kind of value"),
            StoreError::Command(_)
        ));
    }

    #[test]
    fn test_parse_pending_rows() {
        let rows = vec![
            ("1-0".to_string(), "billing-0".to_string(), 61000, 1),
            ("2-0".to_string(), "_xclaim".to_string(), 5, 3),
        ];
        let pending = parse_pending(rows).unwrap();
        assert_eq!(pending[0].id, StreamId::new(1, 0));
        assert_eq!(pending[0].idle, Duration::from_secs(61));
        assert_eq!(pending[1].consumer, "_xclaim");
        assert_eq!(pending[1].deliveries, 3);

        let bad = vec![("nope".to_string(), "c".to_string(), 0, 0)];
        assert!(matches!(parse_pending(bad), Err(StoreError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_from_config_builds_pool_lazily() {
        // No connection is made until the first operation.
        let store = RedisStore::from_config(&RedisConfig::default()).unwrap();
        assert_eq!(store.pool().status().max_size, RedisConfig::default().max_connections);
    }
}
