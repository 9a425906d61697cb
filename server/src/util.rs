//! Shared utility functions

use std::future::Future;
use std::time::Duration;

use chrono::Utc;

/// Run a store call under a deadline, mapping expiry to the caller's error.
///
/// # Examples
///
/// ```
/// # tokio_test::block_on(async {
/// use std::time::Duration;
/// use sb_server::util::with_timeout;
///
/// let slow = async {
///     tokio::time::sleep(Duration::from_secs(5)).await;
///     Ok::<_, &str>(1)
/// };
/// let result = with_timeout(Duration::from_millis(10), slow, || "timed out").await;
/// assert_eq!(result, Err("timed out"));
/// # });
/// ```
pub async fn with_timeout<T, E, F>(
    limit: Duration,
    fut: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds in a duration, saturating at `i64::MAX`.
#[must_use]
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
