/*!
 * Async helpers shared by the HelvarNet crates.
 */
use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A pinned, boxed, `Send` future that owns its captures
pub type BoxFuture<T> = futures::future::BoxFuture<'static, T>;

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
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration))),
    }
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Create a Box<dyn Future> from a future
///
/// Used to give recursive async call chains a nameable type.
pub fn box_future<F, T>(future: F) -> BoxFuture<T>
where
    F: Future<Output = T> + Send + 'static,
{
    future.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_log_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let handle = spawn_and_log("flag", async move {
            flag.store(true, Ordering::SeqCst);
            Err::<(), _>(Error::other("logged, not propagated"))
        });
        handle.await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_box_future() {
        let fut = box_future(async { 7 });
        assert_eq!(tokio_test::block_on(fut), 7);

        // interchangeable with the futures crate's boxed futures
        let futs: Vec<futures::future::BoxFuture<'static, u8>> =
            vec![box_future(async { 1 }), async { 2 }.boxed()];
        let sum: u8 = tokio_test::block_on(futures::future::join_all(futs)).into_iter().sum();
        assert_eq!(sum, 3);
    }
}
