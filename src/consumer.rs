//! Live consumption loop.
//!
//! Each worker of a pool runs one [`LiveConsumer`] under its own consumer
//! identity:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   read (offset, block) ──entries──▶ dispatch ──ack/del────┤
//!            │                                              │
//!            ├──empty──▶ offset = ">", block = idle ────────┤
//!            │                                              │
//!            └──error──▶ sleep(backoff by error class) ─────┘
//! ```
//!
//! The [`Dispatcher`] half (decode → handler → acknowledge) is shared with the
//! [`Reclaimer`](crate::reclaim::Reclaimer).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{BackoffConfig, ConsumerConfig};
use crate::decoder::Decoder;
use crate::entry::{Delivery, RawEntry, ReadOffset, StreamId};
use crate::error::StoreError;
use crate::handler::EntryHandler;
use crate::shutdown::ShutdownSignal;
use crate::store::StreamStore;

/// What happened to one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Entries in the batch
    pub received: usize,
    /// Handler succeeded and the entry was acknowledged
    pub acknowledged: usize,
    /// Handler failed; the entry stays pending for the reclaimer
    pub failed: usize,
    /// Entry could not be decoded and was removed
    pub discarded: usize,
    /// Highest ID in the batch
    pub last_id: Option<StreamId>,
}

/// Decodes entries, hands them to the handler and settles them in the store.
pub struct Dispatcher {
    store: Arc<dyn StreamStore>,
    handler: Arc<dyn EntryHandler>,
    decoder: Decoder,
    stream: String,
    group: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StreamStore>,
        handler: Arc<dyn EntryHandler>,
        decoder: Decoder,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            store,
            handler,
            decoder,
            stream: stream.into(),
            group: group.into(),
        }
    }

    pub fn store(&self) -> &dyn StreamStore {
        self.store.as_ref()
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Process a batch delivered to `consumer`, in ID order.
    ///
    /// - decode failure: the entry is deleted and acknowledged, the handler
    ///   never sees it
    /// - handler failure: the entry is left pending
    /// - handler success: the entry is acknowledged
    pub async fn dispatch(
        &self,
        consumer: &str,
        entries: Vec<RawEntry>,
        reclaimed: bool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            received: entries.len(),
            ..BatchOutcome::default()
        };

        for entry in self.decoder.decode_batch(entries) {
            outcome.last_id = Some(entry.id);

            let value = match entry.value {
                Ok(value) => value,
                Err(e) => {
                    error!(
                        stream = %self.stream,
                        consumer = %consumer,
                        id = %entry.id,
                        shape = %self.decoder.shape(),
                        error = %e,
                        "Undecodable entry, removing it"
                    );
                    self.discard(entry.id).await;
                    outcome.discarded += 1;
                    continue;
                }
            };

            let delivery = Delivery {
                stream: self.stream.clone(),
                group: self.group.clone(),
                consumer: consumer.to_string(),
                id: entry.id,
                reclaimed,
            };
            let span = info_span!(
                "entry",
                stream = %self.stream,
                consumer = %consumer,
                id = %entry.id,
                reclaimed
            );

            if let Err(e) = self.handler.handle(&delivery, value).instrument(span).await {
                warn!(
                    stream = %self.stream,
                    consumer = %consumer,
                    id = %entry.id,
                    handler = %self.handler.name(),
                    error = %e,
                    "Handler failed, entry left pending for reclaim"
                );
                outcome.failed += 1;
                continue;
            }

            match self.store.ack(&self.stream, &self.group, &[entry.id]).await {
                Ok(_) => {
                    debug!(consumer = %consumer, id = %entry.id, "Entry acknowledged");
                    outcome.acknowledged += 1;
                }
                Err(e) => {
                    // Not retried: the entry stays pending and comes back via reclaim
                    error!(
                        stream = %self.stream,
                        consumer = %consumer,
                        id = %entry.id,
                        error = %e,
                        "Failed to ACK entry"
                    );
                }
            }
        }

        outcome
    }

    /// Remove an entry that can never be processed. Best effort.
    async fn discard(&self, id: StreamId) {
        if let Err(e) = self.store.delete(&self.stream, &[id]).await {
            error!(stream = %self.stream, id = %id, error = %e, "Failed to delete entry");
        }
        // Also drop it from the pending list so reclaim never replays it
        if let Err(e) = self.store.ack(&self.stream, &self.group, &[id]).await {
            error!(stream = %self.stream, id = %id, error = %e, "Failed to ACK deleted entry");
        }
    }
}

/// Read position and block time of a live consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    offset: ReadOffset,
    block: Duration,
}

impl ReadCursor {
    pub fn new(offset: ReadOffset, block: Duration) -> Self {
        Self { offset, block }
    }

    pub fn offset(&self) -> ReadOffset {
        self.offset
    }

    pub fn block(&self) -> Duration {
        self.block
    }

    /// Nothing to read: wait for new entries only, with the longer block.
    pub fn on_idle(&mut self, idle_block: Duration) {
        self.offset = ReadOffset::New;
        self.block = idle_block;
    }

    /// While replaying history, continue after the last entry seen.
    pub fn on_batch(&mut self, last_id: Option<StreamId>) {
        if let (ReadOffset::After(_), Some(id)) = (self.offset, last_id) {
            self.offset = ReadOffset::After(id);
        }
    }
}

/// Result of one iteration of the live loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The read came back empty
    Idle,
    /// A batch was processed
    Dispatched(BatchOutcome),
    /// The read failed; wait this long before the next one
    Backoff(Duration),
}

/// Running totals of a consumer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub discarded: u64,
    pub read_errors: u64,
}

impl ConsumerStats {
    pub fn record(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.acknowledged += outcome.acknowledged as u64;
        self.failed += outcome.failed as u64;
        self.discarded += outcome.discarded as u64;
    }
}

/// One live consumer identity.
pub struct LiveConsumer {
    dispatcher: Arc<Dispatcher>,
    identity: String,
    config: ConsumerConfig,
    backoff: BackoffConfig,
    cursor: ReadCursor,
    stats: ConsumerStats,
}

impl LiveConsumer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        identity: impl Into<String>,
        config: ConsumerConfig,
        backoff: BackoffConfig,
    ) -> Self {
        // Replaying our own history first picks up entries this identity held
        // before a restart.
        let start = if config.replay_pending {
            ReadOffset::history()
        } else {
            ReadOffset::New
        };
        let cursor = ReadCursor::new(start, config.read_timeout());
        Self {
            dispatcher,
            identity: identity.into(),
            config,
            backoff,
            cursor,
            stats: ConsumerStats::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Read once and process whatever came back.
    pub async fn poll(&mut self) -> Step {
        let read = self
            .dispatcher
            .store()
            .read_group(
                self.dispatcher.stream(),
                self.dispatcher.group(),
                &self.identity,
                self.cursor.offset(),
                self.config.batch_size,
                Some(self.cursor.block()),
            )
            .await;

        match read {
            Ok(entries) if entries.is_empty() => {
                if !self.cursor.offset().is_new() {
                    debug!(consumer = %self.identity, "Pending backlog drained");
                }
                self.cursor.on_idle(self.config.idle_timeout());
                Step::Idle
            }
            Ok(entries) => {
                let replaying = !self.cursor.offset().is_new();
                let outcome = self.dispatcher.dispatch(&self.identity, entries, false).await;
                self.cursor.on_batch(outcome.last_id);

                let before = self.stats.acknowledged;
                self.stats.record(&outcome);
                if before / 100 != self.stats.acknowledged / 100 {
                    info!(
                        consumer = %self.identity,
                        acknowledged = self.stats.acknowledged,
                        failed = self.stats.failed,
                        discarded = self.stats.discarded,
                        "Consumer statistics"
                    );
                }
                debug!(
                    consumer = %self.identity,
                    replaying,
                    received = outcome.received,
                    acknowledged = outcome.acknowledged,
                    failed = outcome.failed,
                    discarded = outcome.discarded,
                    "Batch processed"
                );
                Step::Dispatched(outcome)
            }
            Err(e) => {
                self.stats.read_errors += 1;
                let delay = e.backoff(&self.backoff);
                match &e {
                    StoreError::MissingKey(_) => {
                        self.cursor.on_idle(self.config.idle_timeout());
                        warn!(
                            consumer = %self.identity,
                            stream = %self.dispatcher.stream(),
                            error = %e,
                            "Stream or group missing, backing off"
                        );
                    }
                    StoreError::Timeout(_) => {
                        debug!(consumer = %self.identity, error = %e, "Read timed out, backing off");
                    }
                    _ => {
                        error!(consumer = %self.identity, error = %e, "Stream read error");
                    }
                }
                Step::Backoff(delay)
            }
        }
    }

    /// Run until `shutdown` fires. The current read always completes first.
    pub async fn run(mut self, shutdown: ShutdownSignal) -> ConsumerStats {
        info!(
            consumer = %self.identity,
            stream = %self.dispatcher.stream(),
            group = %self.dispatcher.group(),
            offset = %self.cursor.offset(),
            "Live consumer started"
        );

        while !shutdown.is_shutdown() {
            if let Step::Backoff(delay) = self.poll().await {
                shutdown.sleep(delay).await;
            }
        }

        info!(
            consumer = %self.identity,
            acknowledged = self.stats.acknowledged,
            failed = self.stats.failed,
            discarded = self.stats.discarded,
            "Live consumer stopped"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TargetShape;
    use crate::store::MemoryStore;
    use crate::testing::RecordingHandler;

    const STREAM: &str = "orders";
    const GROUP: &str = "billing";

    async fn setup() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .append_with_id(STREAM, StreamId::new(1, 0), vec![("data".into(), b"{}".to_vec())])
            .unwrap();
        store.create_group(STREAM, GROUP).await.unwrap();
        store
    }

    fn dispatcher(store: Arc<MemoryStore>, handler: Arc<RecordingHandler>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            store,
            handler,
            Decoder::new(TargetShape::Record),
            STREAM,
            GROUP,
        ))
    }

    fn consumer(dispatcher: Arc<Dispatcher>, replay_pending: bool) -> LiveConsumer {
        let config = ConsumerConfig {
            replay_pending,
            ..ConsumerConfig::default()
        };
        LiveConsumer::new(dispatcher, "billing-0", config, BackoffConfig::default())
    }

    #[test]
    fn test_cursor_transitions() {
        let mut cursor = ReadCursor::new(ReadOffset::history(), Duration::from_secs(1));
        cursor.on_batch(Some(StreamId::new(4, 0)));
        assert_eq!(cursor.offset(), ReadOffset::After(StreamId::new(4, 0)));

        cursor.on_idle(Duration::from_secs(10));
        assert_eq!(cursor.offset(), ReadOffset::New);
        assert_eq!(cursor.block(), Duration::from_secs(10));

        // New mode stays new
        cursor.on_batch(Some(StreamId::new(9, 0)));
        assert_eq!(cursor.offset(), ReadOffset::New);
    }

    #[tokio::test]
    async fn test_success_is_acknowledged() {
        let store = setup().await;
        let handler = Arc::new(RecordingHandler::new());
        let mut consumer = consumer(dispatcher(store.clone(), handler.clone()), false);
        let id = store
            .append_with_id(STREAM, StreamId::new(2, 0), vec![("data".into(), br#"{"amount":100}"#.to_vec())])
            .unwrap();

        let outcome = match consumer.poll().await {
            Step::Dispatched(outcome) => outcome,
            other => panic!("expected a batch, got {other:?}"),
        };
        assert_eq!(outcome.acknowledged, 1);
        assert_eq!(outcome.last_id, Some(id));
        assert_eq!(handler.calls_for(id).len(), 1);
        assert!(store.pending_snapshot(STREAM, GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_stays_pending() {
        let store = setup().await;
        let handler = Arc::new(RecordingHandler::failing_first(1));
        let mut consumer = consumer(dispatcher(store.clone(), handler.clone()), false);
        let id = store
            .append_with_id(STREAM, StreamId::new(2, 0), vec![("data".into(), br#"{"amount":1}"#.to_vec())])
            .unwrap();

        let Step::Dispatched(outcome) = consumer.poll().await else {
            panic!("expected a batch");
        };
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.acknowledged, 0);

        let pending = store.pending_snapshot(STREAM, GROUP);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].consumer, "billing-0");
        assert!(store.contains(STREAM, id));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_removed() {
        let store = setup().await;
        let handler = Arc::new(RecordingHandler::new());
        let mut consumer = consumer(dispatcher(store.clone(), handler.clone()), false);
        let bad = store
            .append_with_id(STREAM, StreamId::new(2, 0), vec![("data".into(), b"not json".to_vec())])
            .unwrap();
        let good = store
            .append_with_id(STREAM, StreamId::new(3, 0), vec![("data".into(), br#"{"ok":true}"#.to_vec())])
            .unwrap();

        let Step::Dispatched(outcome) = consumer.poll().await else {
            panic!("expected a batch");
        };
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.acknowledged, 1);
        assert!(!store.contains(STREAM, bad));
        assert!(store.contains(STREAM, good));
        assert!(handler.calls_for(bad).is_empty());
        assert!(store.pending_snapshot(STREAM, GROUP).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_read_switches_to_idle() {
        let store = setup().await;
        let handler = Arc::new(RecordingHandler::new());
        let mut consumer = consumer(dispatcher(store, handler), true);
        assert_eq!(consumer.cursor().offset(), ReadOffset::history());
        assert_eq!(consumer.cursor().block(), Duration::from_millis(1000));

        assert_eq!(consumer.poll().await, Step::Idle);
        assert_eq!(consumer.cursor().offset(), ReadOffset::New);
        assert_eq!(consumer.cursor().block(), Duration::from_millis(10000));
    }

    #[tokio::test]
    async fn test_missing_group_backs_off() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::new());
        let mut consumer = consumer(dispatcher(store, handler), false);

        let step = consumer.poll().await;
        assert_eq!(
            step,
            Step::Backoff(Duration::from_millis(BackoffConfig::default().missing_key_ms))
        );
        assert_eq!(consumer.stats().read_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replays_own_pending_entries() {
        let store = setup().await;
        let failing = Arc::new(RecordingHandler::failing_first(1));
        let mut first = consumer(dispatcher(store.clone(), failing), false);
        let id = store
            .append_with_id(STREAM, StreamId::new(2, 0), vec![("data".into(), br#"{"n":1}"#.to_vec())])
            .unwrap();
        first.poll().await;
        drop(first);

        // Same identity after a restart
        let handler = Arc::new(RecordingHandler::new());
        let mut restarted = consumer(dispatcher(store.clone(), handler.clone()), true);
        let Step::Dispatched(outcome) = restarted.poll().await else {
            panic!("expected the pending entry to be replayed");
        };
        assert_eq!(outcome.acknowledged, 1);
        assert_eq!(handler.calls_for(id).len(), 1);
        assert_eq!(restarted.cursor().offset(), ReadOffset::After(id));

        assert_eq!(restarted.poll().await, Step::Idle);
        assert_eq!(restarted.cursor().offset(), ReadOffset::New);
        assert!(store.pending_snapshot(STREAM, GROUP).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = setup().await;
        let handler = Arc::new(RecordingHandler::new());
        let consumer = consumer(dispatcher(store.clone(), handler.clone()), true);
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(consumer.run(shutdown.clone()));
        store.append_payload(STREAM, "data", r#"{"n":1}"#);
        store.append_payload(STREAM, "data", r#"{"n":2}"#);

        while handler.call_count() < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown.trigger();

        let stats = task.await.unwrap();
        assert_eq!(stats.acknowledged, 2);
    }
}
