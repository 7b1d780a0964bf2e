use crate::error::SyncError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Retries transport failures with exponential backoff. Any other error
/// (session, not-found, validation) is returned on the first attempt.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RecoveryManager {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, SyncError>> + Send,
    {
        let mut attempts = 0;
        let mut delay = self.base_delay;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempts >= self.max_attempts {
                        return Err(SyncError::RecoveryFailed {
                            attempts,
                            message: e.to_string(),
                        });
                    }

                    warn!(
                        "Platform call failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempts, self.max_attempts, e, delay
                    );

                    sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_successful_operation() {
        let recovery = RecoveryManager::new(3, Duration::from_millis(10), Duration::from_millis(100));
        let result = recovery.execute(|| async { Ok::<_, SyncError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let recovery = RecoveryManager::new(3, Duration::from_millis(10), Duration::from_millis(100));

        let attempts_clone = attempts.clone();
        let operation = move || {
            let attempts = attempts_clone.clone();
            async move {
                let current = attempts.fetch_add(1, Ordering::SeqCst);
                if current == 0 {
                    Err(SyncError::Transport("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        };

        let result = recovery.execute(operation).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_max_attempts_reached() {
        let recovery = RecoveryManager::new(3, Duration::from_millis(10), Duration::from_millis(100));

        let result = recovery
            .execute(|| async { Err::<(), SyncError>(SyncError::Transport("timeout".into())) })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::RecoveryFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_session_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let recovery = RecoveryManager::new(3, Duration::from_millis(10), Duration::from_millis(100));

        let attempts_clone = attempts.clone();
        let result = recovery
            .execute(move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), SyncError>(SyncError::SessionInvalid("token rejected".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::SessionInvalid(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_up_to_max_delay() {
        let recovery = RecoveryManager::new(4, Duration::from_millis(10), Duration::from_millis(30));
        let attempts = Arc::new(std::sync::Mutex::new(vec![]));

        let attempts_clone = attempts.clone();
        let operation = move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.lock().unwrap().push(tokio::time::Instant::now());
                Err::<(), SyncError>(SyncError::Transport("always fails".into()))
            }
        };

        let result = recovery.execute(operation).await;
        assert!(matches!(
            result,
            Err(SyncError::RecoveryFailed { attempts: 4, .. })
        ));

        let attempts = attempts.lock().unwrap();
        let delays: Vec<Duration> = attempts
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect();
        let expected = [10, 20, 30].map(Duration::from_millis);
        assert_eq!(delays.len(), expected.len());
        for (delay, expected) in delays.iter().zip(expected) {
            // The timer wheel rounds deadlines up to the next millisecond.
            assert!(*delay >= expected && *delay <= expected + Duration::from_millis(1));
        }
    }
}
