//! Worker pool.
//!
//! A pool owns one consumer group registration and runs, until shutdown:
//!
//! - `max(workers, 1)` [`LiveConsumer`]s named `<base>-0`, `<base>-1`, ...
//! - one [`Reclaimer`] (unless `reclaim.enabled = false`)
//!
//! All tasks share one store handle, one handler and one [`ShutdownSignal`].
//! [`WorkerPool::run`] returns only after every task has stopped.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::consumer::{ConsumerStats, Dispatcher, LiveConsumer};
use crate::dead_letter::DeadLetterQueue;
use crate::decoder::{Decoder, TargetShape};
use crate::error::SetupError;
use crate::group::{ensure_group_with_retry, GroupStatus};
use crate::handler::EntryHandler;
use crate::reclaim::{ReclaimStats, Reclaimer};
use crate::shutdown::ShutdownSignal;
use crate::store::StreamStore;

/// Summary of a finished pool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub group: Option<GroupStatus>,
    /// Per-identity totals, ordered by identity
    pub consumers: Vec<(String, ConsumerStats)>,
    pub reclaimer: Option<ReclaimStats>,
    /// Tasks that panicked instead of stopping
    pub panicked: usize,
}

impl PoolReport {
    pub fn acknowledged(&self) -> u64 {
        let live: u64 = self.consumers.iter().map(|(_, s)| s.acknowledged).sum();
        live + self.reclaimer.as_ref().map_or(0, |r| r.acknowledged)
    }
}

enum TaskExit {
    Consumer(String, ConsumerStats),
    Reclaimer(ReclaimStats),
}

/// Runs the consumers and the reclaimer of one consumer group.
pub struct WorkerPool {
    store: Arc<dyn StreamStore>,
    config: Arc<EngineConfig>,
    handler: Arc<dyn EntryHandler>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn StreamStore>,
        config: Arc<EngineConfig>,
        handler: Arc<dyn EntryHandler>,
    ) -> Self {
        Self {
            store,
            config,
            handler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prefix of the live consumer identities. Falls back to the group name.
    pub fn consumer_base(&self) -> &str {
        self.config
            .stream
            .consumer
            .as_deref()
            .unwrap_or(&self.config.stream.group)
    }

    /// Live consumer identities for `workers` workers.
    pub fn identities(&self, workers: usize) -> Vec<String> {
        let base = self.consumer_base();
        (0..workers.max(1)).map(|i| format!("{base}-{i}")).collect()
    }

    /// [`run`](Self::run) with the shape and worker count from the config.
    pub async fn run_configured(&self, shutdown: ShutdownSignal) -> Result<PoolReport, SetupError> {
        self.run(shutdown, self.config.stream.shape, self.config.stream.workers)
            .await
    }

    /// Validate the config, register the group, then run every task until
    /// `shutdown` fires.
    ///
    /// Only setup errors are returned; once running, store errors are
    /// handled inside the tasks.
    pub async fn run(
        &self,
        shutdown: ShutdownSignal,
        shape: TargetShape,
        workers: usize,
    ) -> Result<PoolReport, SetupError> {
        // Configs built in code never went through `from_toml`
        self.config.validate()?;

        let stream = &self.config.stream.name;
        let group = &self.config.stream.group;

        let status = ensure_group_with_retry(
            self.store.as_ref(),
            stream,
            group,
            &self.config.backoff,
            &shutdown,
        )
        .await?;

        let mut decoder = Decoder::new(shape);
        if let Some(field) = &self.config.stream.payload_field {
            decoder = decoder.with_payload_field(field.clone());
        }
        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            self.handler.clone(),
            decoder,
            stream.clone(),
            group.clone(),
        ));

        let mut tasks = JoinSet::new();

        if self.config.reclaim.enabled {
            let mut reclaimer = Reclaimer::new(dispatcher.clone(), self.config.reclaim.clone());
            if let Some((max_deliveries, target)) = self.config.reclaim.dead_letter() {
                let queue = DeadLetterQueue::new(self.store.clone(), stream.clone(), target);
                reclaimer = reclaimer.with_dead_letter(max_deliveries, queue);
            }
            let shutdown = shutdown.clone();
            tasks.spawn(async move { TaskExit::Reclaimer(reclaimer.run(shutdown).await) });
        }

        let identities = self.identities(workers);
        for identity in &identities {
            let consumer = LiveConsumer::new(
                dispatcher.clone(),
                identity.clone(),
                self.config.consumer.clone(),
                self.config.backoff.clone(),
            );
            let identity = identity.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let stats = consumer.run(shutdown).await;
                TaskExit::Consumer(identity, stats)
            });
        }

        info!(
            stream = %stream,
            group = %group,
            shape = %shape,
            workers = identities.len(),
            reclaim = self.config.reclaim.enabled,
            "Worker pool running"
        );

        let mut report = PoolReport {
            group: Some(status),
            ..PoolReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskExit::Consumer(identity, stats)) => report.consumers.push((identity, stats)),
                Ok(TaskExit::Reclaimer(stats)) => report.reclaimer = Some(stats),
                Err(e) => {
                    error!(error = %e, "Worker task failed");
                    report.panicked += 1;
                }
            }
        }
        report.consumers.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            stream = %stream,
            group = %group,
            acknowledged = report.acknowledged(),
            panicked = report.panicked,
            "Worker pool stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::entry::StreamId;
    use crate::store::MemoryStore;
    use crate::testing::{test_config, RecordingHandler};
    use std::time::Duration;

    const STREAM: &str = "orders";
    const GROUP: &str = "billing";

    fn pool(store: Arc<MemoryStore>, config: Arc<EngineConfig>, handler: Arc<RecordingHandler>) -> WorkerPool {
        WorkerPool::new(store, config, handler)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_identities() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::new());
        let p = pool(store.clone(), test_config(), handler.clone());
        assert_eq!(p.identities(3), vec!["billing-0", "billing-1", "billing-2"]);
        assert_eq!(p.identities(0), vec!["billing-0"]);

        let mut config = EngineConfig::default();
        config.stream.group = "audit".to_string();
        let p = pool(store, Arc::new(config), handler);
        assert_eq!(p.consumer_base(), "audit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_are_processed_and_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let early = store.append_payload(STREAM, "data", r#"{"amount":1}"#);
        let handler = Arc::new(RecordingHandler::new());
        let shutdown = ShutdownSignal::new();

        let task = {
            let p = pool(store.clone(), test_config(), handler.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { p.run(shutdown, TargetShape::Record, 2).await })
        };
        wait_until(|| store.has_group(STREAM, GROUP)).await;

        let ids: Vec<StreamId> = (0..3)
            .map(|n| store.append_payload(STREAM, "data", format!(r#"{{"amount":{}}}"#, 100 + n)))
            .collect();
        wait_until(|| handler.call_count() == 3).await;
        shutdown.trigger();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.group, Some(GroupStatus::Created));
        assert_eq!(report.acknowledged(), 3);
        assert_eq!(report.panicked, 0);
        assert_eq!(report.consumers.len(), 2);
        assert!(report.reclaimer.is_some());

        // Appended before the group existed
        assert!(handler.calls_for(early).is_empty());
        for id in ids {
            let calls = handler.calls_for(id);
            assert_eq!(calls.len(), 1);
            assert!(!calls[0].reclaimed);
            assert!(calls[0].consumer.starts_with("billing-"));
        }
        assert!(store.pending_snapshot(STREAM, GROUP).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_entry_is_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        store.append_payload(STREAM, "data", "{}");
        let handler = Arc::new(RecordingHandler::failing_first(1));
        let shutdown = ShutdownSignal::new();

        let task = {
            let p = pool(store.clone(), test_config(), handler.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { p.run(shutdown, TargetShape::Record, 1).await })
        };
        wait_until(|| store.has_group(STREAM, GROUP)).await;

        let id = store.append_payload(STREAM, "data", r#"{"amount":5}"#);
        wait_until(|| handler.calls_for(id).len() == 2).await;
        wait_until(|| store.pending_snapshot(STREAM, GROUP).is_empty()).await;
        shutdown.trigger();
        let report = task.await.unwrap().unwrap();

        let calls = handler.calls_for(id);
        assert_eq!(calls[0].consumer, "billing-0");
        assert!(!calls[0].reclaimed);
        assert_eq!(calls[1].consumer, "_xclaim");
        assert!(calls[1].reclaimed);
        assert_eq!(report.reclaimer.map(|r| r.acknowledged), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_payload_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        store.append_payload(STREAM, "data", "{}");
        let handler = Arc::new(RecordingHandler::new());
        let shutdown = ShutdownSignal::new();

        let task = {
            let p = pool(store.clone(), test_config(), handler.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { p.run(shutdown, TargetShape::Record, 1).await })
        };
        wait_until(|| store.has_group(STREAM, GROUP)).await;

        let bad = store.append_payload(STREAM, "data", "{not json");
        let good = store.append_payload(STREAM, "data", r#"{"amount":9}"#);
        wait_until(|| handler.calls_for(good).len() == 1).await;

        // Let the reclaimer run a few cycles; nothing may come back
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.trigger();
        let report = task.await.unwrap().unwrap();

        assert!(!store.contains(STREAM, bad));
        assert!(handler.calls_for(bad).is_empty());
        assert_eq!(report.consumers[0].1.discarded, 1);
        assert!(store.pending_snapshot(STREAM, GROUP).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_stream_is_a_setup_error() {
        let store = Arc::new(MemoryStore::new());
        let mut config = (*test_config()).clone();
        config.backoff = BackoffConfig {
            missing_stream_retries: Some(0),
            ..BackoffConfig::default()
        };
        let p = pool(store.clone(), Arc::new(config), Arc::new(RecordingHandler::new()));

        let result = p.run(ShutdownSignal::new(), TargetShape::Record, 1).await;
        assert!(matches!(result, Err(SetupError::StreamMissing(name)) if name == STREAM));
        assert!(store.is_empty(STREAM));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_setup() {
        let store = Arc::new(MemoryStore::new());
        store.append_payload(STREAM, "data", "{}");
        let mut config = (*test_config()).clone();
        config.consumer.batch_size = 0;
        let p = pool(store.clone(), Arc::new(config), Arc::new(RecordingHandler::new()));

        let result = p.run(ShutdownSignal::new(), TargetShape::Record, 1).await;
        assert!(matches!(result, Err(SetupError::Config(_))));
        assert!(!store.has_group(STREAM, GROUP));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_can_be_disabled() {
        let store = Arc::new(MemoryStore::new());
        store.append_payload(STREAM, "data", "{}");
        let mut config = (*test_config()).clone();
        config.reclaim.enabled = false;
        let p = pool(store, Arc::new(config), Arc::new(RecordingHandler::new()));

        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger();
        });
        let report = p.run_configured(shutdown).await.unwrap();
        assert!(report.reclaimer.is_none());
        assert_eq!(report.consumers.len(), 1);
        assert_eq!(report.consumers[0].0, "billing-0");
    }
}
