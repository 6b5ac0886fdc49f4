//! Test helpers shared by the unit tests of several modules.
//!
//! Only compiled when running tests.

#![cfg(test)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::entry::{DecodedValue, Delivery, StreamId};
use crate::handler::{EntryHandler, HandlerError};

/// A handler that records every call and fails the first `fail_first` of them.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<(Delivery, DecodedValue)>>,
    fail_first: usize,
    attempts: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn calls(&self) -> Vec<(Delivery, DecodedValue)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: StreamId) -> Vec<Delivery> {
        self.calls()
            .into_iter()
            .filter(|(d, _)| d.id == id)
            .map(|(d, _)| d)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl EntryHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, delivery: &Delivery, value: DecodedValue) -> Result<(), HandlerError> {
        self.calls.lock().unwrap().push((delivery.clone(), value));
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(format!("attempt {} rejected", attempt + 1).into());
        }
        Ok(())
    }
}

/// Config for a pool on `orders` / `billing` with short timings.
pub fn test_config() -> Arc<EngineConfig> {
    let mut config = EngineConfig::default();
    config.stream.name = "orders".to_string();
    config.stream.group = "billing".to_string();
    config.stream.consumer = Some("billing".to_string());
    config.consumer.read_timeout_ms = 100;
    config.consumer.idle_timeout_ms = 500;
    config.reclaim.interval_ms = 1_000;
    config.reclaim.min_idle_ms = 2_000;
    Arc::new(config)
}
