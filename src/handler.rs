//! Entry handlers.
//!
//! A handler is the user code an entry is delivered to. The [`EntryHandler`]
//! trait defines the interface; [`handler_fn`] adapts an async closure and
//! [`LogHandler`] is a built-in handler that logs each entry.
//!
//! Returning `Ok(())` acknowledges the entry. Returning an error leaves it
//! pending, and the reclaimer delivers it again later, possibly to another
//! consumer identity. Handlers must therefore tolerate seeing the same entry
//! more than once.
//!
//! ```rust,ignore
//! use streamgroup::handler::handler_fn;
//!
//! let handler = handler_fn("billing", |delivery, value| async move {
//!     let order: Order = value.deserialize_record()?;
//!     charge(delivery.id, order).await?;
//!     Ok(())
//! });
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use tracing::info;

use crate::entry::{DecodedValue, Delivery};

/// Error type handlers return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The callback boundary between the engine and user code.
///
/// Handlers run concurrently on every worker of a pool, so they must be
/// `Send + Sync`.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Process one entry.
    async fn handle(&self, delivery: &Delivery, value: DecodedValue) -> Result<(), HandlerError>;
}

/// An [`EntryHandler`] backed by an async closure.
pub struct FnHandler<F, Fut> {
    name: String,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as an [`EntryHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F, Fut>
where
    F: Fn(Delivery, DecodedValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EntryHandler for FnHandler<F, Fut>
where
    F: Fn(Delivery, DecodedValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: &Delivery, value: DecodedValue) -> Result<(), HandlerError> {
        (self.f)(delivery.clone(), value).await
    }
}

/// A handler that logs entries using structured logging and always succeeds.
///
/// Useful for:
/// - Tailing a stream while developing producers
/// - Smoke-testing a deployment
#[derive(Debug, Clone)]
pub struct LogHandler {
    prefix: String,
}

impl LogHandler {
    pub fn new() -> Self {
        Self {
            prefix: "entry".to_string(),
        }
    }

    /// Create a LogHandler with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntryHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, delivery: &Delivery, value: DecodedValue) -> Result<(), HandlerError> {
        info!(
            prefix = %self.prefix,
            stream = %delivery.stream,
            consumer = %delivery.consumer,
            id = %delivery.id,
            reclaimed = delivery.reclaimed,
            kind = value.kind(),
            value = %value,
            "[{}] Processed {}/{}",
            self.prefix,
            delivery.stream,
            delivery.id
        );
        Ok(())
    }
}
