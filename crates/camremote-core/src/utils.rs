/*!
 * Utility functions and helpers for camremote.
 *
 * Vendor calls block and have no bound of their own; these helpers move them
 * onto tokio's blocking pool and put a deadline on the wait.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration)).into()),
    }
}

/// Run a blocking closure on the blocking thread pool
///
/// When `deadline` is set and expires, the caller gets a timeout error. The
/// closure itself cannot be cancelled and keeps running to completion on its
/// pool thread; its result is discarded.
///
/// # Arguments
///
/// * `name` - A name for the operation (for logging)
/// * `deadline` - Optional upper bound on the wait
/// * `f` - The blocking work
pub async fn run_blocking<F, T, E>(
    name: &str,
    deadline: Option<Duration>,
    f: F,
) -> std::result::Result<T, E>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<Error> + Send + 'static,
{
    let task = async {
        match tokio::task::spawn_blocking(f).await {
            Ok(result) => {
                debug!("Blocking operation '{}' finished", name);
                result
            }
            Err(e) => Err(Error::runtime(format!("Blocking operation '{}' failed: {}", name, e)).into()),
        }
    };

    match deadline {
        Some(duration) => with_timeout(duration, task).await,
        None => task.await,
    }
}
