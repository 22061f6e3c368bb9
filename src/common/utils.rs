//! Utility functions for registrar

use std::time::Duration;

/// Exponential backoff with jitter for store retries
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Doubles up to `max`, plus up to 50% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;

        let base_ms = base.as_millis() as u64;
        let jitter_ms = rand::random::<u64>() % (base_ms / 2 + 1);
        base + Duration::from_millis(jitter_ms)
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

/// Retry an async store call with exponential backoff.
///
/// Only retryable errors (transport failures and timeouts) are retried; any
/// other error is returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_attempts: usize,
    backoff: &mut Backoff,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(result) => {
                backoff.reset();
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));

        for _ in 0..5 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(600));
            assert!(delay >= Duration::from_millis(400));
        }
        assert_eq!(backoff.attempts(), 7);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_only_retryable() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));

        let result: crate::Result<u32> = retry_with_backoff(
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(crate::Error::Transport("connection refused".into()))
                } else {
                    Ok(7)
                }
            },
            5,
            &mut backoff,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let result: crate::Result<u32> = retry_with_backoff(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::Error::MalformedKey("instances/prod".into()))
            },
            5,
            &mut backoff,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        let result: crate::Result<()> = retry_with_backoff(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::Error::Timeout("list".into()))
            },
            3,
            &mut backoff,
        )
        .await;
        assert!(matches!(result, Err(crate::Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
