//! Dead-letter queue for entries that keep failing.
//!
//! When `reclaim.max_deliveries` and `reclaim.dead_letter_stream` are both
//! configured, the reclaimer moves entries whose delivery count reached the
//! bound to a separate stream instead of redelivering them forever.
//!
//! A quarantined entry keeps its original fields and gains:
//!
//! | field        | value                                  |
//! |--------------|----------------------------------------|
//! | `originalId` | ID in the source stream                |
//! | `stream`     | source stream                          |
//! | `group`      | consumer group it was pending in       |
//! | `consumer`   | identity holding it when quarantined   |
//! | `deliveries` | delivery count                         |
//! | `failedAt`   | RFC 3339 timestamp                     |
//!
//! The original is then acknowledged and deleted from the source stream.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::entry::{Fields, PendingEntry, StreamId};
use crate::error::StoreError;
use crate::store::StreamStore;

/// Moves poisoned entries out of a source stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn StreamStore>,
    source: String,
    target: String,
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn StreamStore>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source: source.into(),
            target: target.into(),
        }
    }

    /// Stream quarantined entries are written to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Move one pending entry to the dead-letter stream.
    ///
    /// Returns the ID in the dead-letter stream, or `None` when the entry was
    /// already deleted from the source and only had to be acknowledged.
    pub async fn quarantine(
        &self,
        group: &str,
        pending: &PendingEntry,
    ) -> Result<Option<StreamId>, StoreError> {
        let Some(fields) = self.store.fetch(&self.source, pending.id).await? else {
            self.store.ack(&self.source, group, &[pending.id]).await?;
            warn!(
                stream = %self.source,
                id = %pending.id,
                "Entry vanished before quarantine, acknowledged"
            );
            return Ok(None);
        };

        let record = self.record(group, pending, fields);
        let dead_id = self.store.append(&self.target, &record).await.map_err(|e| {
            error!(
                stream = %self.source,
                id = %pending.id,
                target = %self.target,
                error = %e,
                "Failed to write dead-letter entry"
            );
            e
        })?;

        self.store.ack(&self.source, group, &[pending.id]).await?;
        if let Err(e) = self.store.delete(&self.source, &[pending.id]).await {
            // Already acknowledged, so it can no longer be redelivered
            warn!(stream = %self.source, id = %pending.id, error = %e, "Failed to delete quarantined entry");
        }

        info!(
            stream = %self.source,
            id = %pending.id,
            dead_id = %dead_id,
            target = %self.target,
            deliveries = pending.deliveries,
            consumer = %pending.consumer,
            "Entry moved to dead-letter stream"
        );
        Ok(Some(dead_id))
    }

    fn record(&self, group: &str, pending: &PendingEntry, mut fields: Fields) -> Fields {
        let failed_at = chrono::Utc::now().to_rfc3339();
        fields.extend([
            ("originalId".to_string(), pending.id.to_string().into_bytes()),
            ("stream".to_string(), self.source.clone().into_bytes()),
            ("group".to_string(), group.as_bytes().to_vec()),
            ("consumer".to_string(), pending.consumer.clone().into_bytes()),
            ("deliveries".to_string(), pending.deliveries.to_string().into_bytes()),
            ("failedAt".to_string(), failed_at.into_bytes()),
        ]);
        fields
    }
}
