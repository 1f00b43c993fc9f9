/*!
 * Utility functions and helpers for MapperFlow.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::Instrument;

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The output of the future, or a timeout error if the deadline passes first
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| Error::timeout(format!("Operation timed out after {:?}", duration)))
}

/// Spawn a background task whose logs are recorded inside `span`
pub fn spawn_in_span<F>(span: tracing::Span, fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut.instrument(span))
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
