//! # streamgroup
//!
//! Consumer-group workers for Redis Streams: at-least-once delivery of log
//! entries to a typed handler, with automatic recovery of entries abandoned
//! by failed or dead consumers.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌─▶ LiveConsumer <base>-0 ─┐
//! Redis Stream ─ group ──┼─▶ LiveConsumer <base>-1 ─┼─▶ Decoder ─▶ EntryHandler ─▶ XACK
//!                        └─▶ Reclaimer (_xclaim) ───┘
//! ```
//!
//! ## Modules
//!
//! - [`entry`]: Stream IDs, raw and decoded entries
//! - [`decoder`]: Target shapes and reply parsing
//! - [`store`]: The [`StreamStore`] boundary, Redis and in-memory
//! - [`group`]: Idempotent consumer group setup
//! - [`consumer`]: Live consumption loop and the shared dispatch path
//! - [`reclaim`]: Pending reclaimer
//! - [`dead_letter`]: Optional quarantine for entries that keep failing
//! - [`pool`]: Runs consumers and the reclaimer until shutdown
//! - [`handler`]: The [`EntryHandler`] trait and built-in handlers

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod decoder;
pub mod entry;
pub mod error;
pub mod group;
pub mod handler;
pub mod pool;
pub mod reclaim;
pub mod shutdown;
pub mod store;

mod testing;

// Re-export commonly used types at crate root
pub use config::EngineConfig;
pub use decoder::{Decoder, TargetShape};
pub use entry::{DecodedValue, Delivery, StreamId};
pub use error::{DecodeError, SetupError, StoreError};
pub use handler::{handler_fn, EntryHandler, HandlerError, LogHandler};
pub use pool::{PoolReport, WorkerPool};
pub use shutdown::ShutdownSignal;
pub use store::{MemoryStore, RedisStore, StreamStore};

/// Consumer identity the reclaimer claims abandoned entries to
pub const DEFAULT_CLAIM_CONSUMER: &str = "_xclaim";

/// Default config file path, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/streamgroup.toml";
