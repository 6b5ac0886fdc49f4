//! Consumer group setup.

use tracing::{error, info, warn};

use crate::config::BackoffConfig;
use crate::error::{SetupError, StoreError};
use crate::shutdown::ShutdownSignal;
use crate::store::StreamStore;

/// What [`ensure_group`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

/// Create `group` on `stream` at the stream tail, treating an existing group
/// as success.
///
/// A missing stream is reported as [`SetupError::StreamMissing`]; the stream is
/// never created here.
pub async fn ensure_group(
    store: &dyn StreamStore,
    stream: &str,
    group: &str,
) -> Result<GroupStatus, SetupError> {
    match store.create_group(stream, group).await {
        Ok(()) => {
            info!(stream = %stream, group = %group, "Created consumer group");
            Ok(GroupStatus::Created)
        }
        Err(StoreError::GroupExists(_)) => {
            info!(stream = %stream, group = %group, "Consumer group already exists");
            Ok(GroupStatus::AlreadyExists)
        }
        Err(StoreError::MissingKey(_)) => Err(SetupError::StreamMissing(stream.to_string())),
        Err(e) => {
            error!(stream = %stream, group = %group, error = %e, "Failed to create consumer group");
            Err(SetupError::Store(e))
        }
    }
}

/// [`ensure_group`], waiting out a missing stream.
///
/// Sleeps `backoff.missing_stream_ms` between attempts, at most
/// `backoff.missing_stream_retries` times (forever when unset). Gives up with
/// [`SetupError::Cancelled`] once `shutdown` fires.
pub async fn ensure_group_with_retry(
    store: &dyn StreamStore,
    stream: &str,
    group: &str,
    backoff: &BackoffConfig,
    shutdown: &ShutdownSignal,
) -> Result<GroupStatus, SetupError> {
    let mut retries: u32 = 0;
    loop {
        if shutdown.is_shutdown() {
            return Err(SetupError::Cancelled);
        }

        match ensure_group(store, stream, group).await {
            Err(SetupError::StreamMissing(name)) => {
                if backoff
                    .missing_stream_retries
                    .is_some_and(|limit| retries >= limit)
                {
                    error!(stream = %name, retries, "Stream still missing, giving up");
                    return Err(SetupError::StreamMissing(name));
                }
                retries += 1;
                warn!(
                    stream = %name,
                    retry_in_ms = backoff.missing_stream_ms,
                    attempt = retries,
                    "Stream does not exist yet, waiting for a producer"
                );
                if !shutdown.sleep(backoff.missing_stream()).await {
                    return Err(SetupError::Cancelled);
                }
            }
            other => return other,
        }
    }
}
