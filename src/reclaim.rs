//! Pending reclaimer.
//!
//! Entries whose handler failed, or whose consumer died mid-batch, stay in the
//! group's pending list. Once per interval the reclaimer:
//!
//! 1. lists the pending entries
//! 2. optionally quarantines those that reached the delivery bound
//! 3. claims the rest to its own identity, if they have been idle long enough
//! 4. redelivers exactly the claimed entries through the shared dispatch path
//!
//! A claim does not count as a delivery; each replay read does, so an entry's
//! delivery count grows by one per redelivery. Entries the reclaim identity
//! already holds go through the same idle guard as everyone else's, so a
//! failed redelivery waits out `min_idle` again before the next one.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ReclaimConfig;
use crate::consumer::{BatchOutcome, Dispatcher};
use crate::dead_letter::DeadLetterQueue;
use crate::entry::{PendingEntry, ReadOffset, StreamId};
use crate::error::StoreError;
use crate::shutdown::ShutdownSignal;

/// What one reclaim cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    /// The pending scan failed and the cycle was skipped
    pub skipped: bool,
    /// Pending entries inspected
    pub scanned: usize,
    /// Entries moved to the dead-letter stream
    pub dead_lettered: usize,
    /// Entries that changed hands to the reclaim identity
    pub claimed: usize,
    /// Entries redelivered
    pub replayed: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub discarded: usize,
}

impl ReclaimReport {
    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.replayed += outcome.received;
        self.acknowledged += outcome.acknowledged;
        self.failed += outcome.failed;
        self.discarded += outcome.discarded;
    }
}

/// Running totals across cycles.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimStats {
    pub cycles: u64,
    pub skipped: u64,
    pub claimed: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
}

pub struct Reclaimer {
    dispatcher: Arc<Dispatcher>,
    config: ReclaimConfig,
    dead_letter: Option<(u64, DeadLetterQueue)>,
}

impl Reclaimer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ReclaimConfig) -> Self {
        Self {
            dispatcher,
            config,
            dead_letter: None,
        }
    }

    /// Quarantine entries delivered `max_deliveries` times instead of
    /// retrying them.
    pub fn with_dead_letter(mut self, max_deliveries: u64, queue: DeadLetterQueue) -> Self {
        self.dead_letter = Some((max_deliveries, queue));
        self
    }

    pub fn identity(&self) -> &str {
        &self.config.consumer
    }

    /// Run one scan / claim / replay cycle.
    pub async fn run_cycle(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let store = self.dispatcher.store();
        let stream = self.dispatcher.stream();
        let group = self.dispatcher.group();

        let pending = match store.pending(stream, group, self.config.batch_size).await {
            Ok(pending) => pending,
            Err(e @ (StoreError::MissingKey(_) | StoreError::Timeout(_))) => {
                debug!(stream = %stream, group = %group, error = %e, "Pending scan skipped");
                report.skipped = true;
                return report;
            }
            Err(e) => {
                error!(stream = %stream, group = %group, error = %e, "Pending scan failed");
                report.skipped = true;
                return report;
            }
        };
        report.scanned = pending.len();
        if pending.is_empty() {
            return report;
        }

        let candidates = self.quarantine_exhausted(pending, &mut report).await;
        if candidates.is_empty() {
            return report;
        }

        let mut claimed = match store
            .claim(stream, group, self.identity(), self.config.min_idle(), &candidates)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(stream = %stream, error = %e, "Claim failed");
                return report;
            }
        };
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return report;
        }
        info!(
            stream = %stream,
            consumer = %self.identity(),
            claimed = claimed.len(),
            "Claimed idle pending entries"
        );

        claimed.sort();
        self.replay_claimed(&claimed, &mut report).await;
        report
    }

    /// Split off entries that reached the delivery bound and quarantine them.
    async fn quarantine_exhausted(
        &self,
        pending: Vec<PendingEntry>,
        report: &mut ReclaimReport,
    ) -> Vec<StreamId> {
        let Some((max_deliveries, queue)) = &self.dead_letter else {
            return pending.into_iter().map(|p| p.id).collect();
        };

        let mut candidates = Vec::with_capacity(pending.len());
        for entry in pending {
            let exhausted =
                entry.deliveries >= *max_deliveries && entry.idle >= self.config.min_idle();
            if !exhausted {
                candidates.push(entry.id);
                continue;
            }
            match queue.quarantine(self.dispatcher.group(), &entry).await {
                Ok(_) => report.dead_lettered += 1,
                Err(e) => {
                    // Left pending; the next cycle tries again
                    error!(
                        stream = %self.dispatcher.stream(),
                        id = %entry.id,
                        error = %e,
                        "Failed to quarantine entry"
                    );
                }
            }
        }
        candidates
    }

    /// Redeliver the entries this cycle claimed, in ID order.
    ///
    /// Each entry is read on its own, starting just before its ID, so that
    /// other entries held by the reclaim identity keep their delivery count
    /// and idle clock.
    async fn replay_claimed(&self, claimed: &[StreamId], report: &mut ReclaimReport) {
        for chunk in claimed.chunks(self.config.batch_size.max(1)) {
            let mut entries = Vec::with_capacity(chunk.len());
            for &id in chunk {
                let after = id.predecessor().unwrap_or(StreamId::MIN);
                let read = self
                    .dispatcher
                    .store()
                    .read_group(
                        self.dispatcher.stream(),
                        self.dispatcher.group(),
                        self.identity(),
                        ReadOffset::After(after),
                        1,
                        None,
                    )
                    .await;

                match read {
                    Ok(batch) => {
                        // Acknowledged elsewhere since the claim: nothing to redeliver
                        entries.extend(batch.into_iter().filter(|entry| entry.id == id));
                    }
                    Err(e) => {
                        warn!(consumer = %self.identity(), id = %id, error = %e, "Replay read failed");
                    }
                }
            }

            if entries.is_empty() {
                continue;
            }
            let outcome = self.dispatcher.dispatch(self.identity(), entries, true).await;
            report.absorb(&outcome);
        }
    }

    /// Run cycles every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) -> ReclaimStats {
        info!(
            consumer = %self.identity(),
            stream = %self.dispatcher.stream(),
            interval_ms = self.config.interval_ms,
            min_idle_ms = self.config.min_idle_ms,
            dead_letter = self.dead_letter.as_ref().map(|(_, q)| q.target()),
            "Pending reclaimer started"
        );

        let mut stats = ReclaimStats::default();
        while !shutdown.is_shutdown() {
            let report = self.run_cycle().await;
            stats.cycles += 1;
            stats.skipped += u64::from(report.skipped);
            stats.claimed += report.claimed as u64;
            stats.acknowledged += report.acknowledged as u64;
            stats.dead_lettered += report.dead_lettered as u64;
            if report.replayed > 0 || report.dead_lettered > 0 {
                info!(
                    consumer = %self.identity(),
                    replayed = report.replayed,
                    acknowledged = report.acknowledged,
                    failed = report.failed,
                    dead_lettered = report.dead_lettered,
                    "Reclaim cycle finished"
                );
            }

            if !shutdown.sleep(self.config.interval()).await {
                break;
            }
        }

        info!(consumer = %self.identity(), cycles = stats.cycles, "Pending reclaimer stopped");
        stats
    }
}
