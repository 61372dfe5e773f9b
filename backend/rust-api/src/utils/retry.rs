use std::future::Future;
use std::time::Duration;

/// Jittered exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryConfig {
    /// Optimistic writes of an activity row racing with sibling requests.
    pub fn version_conflict() -> Self {
        Self {
            max_attempts: 7,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(250),
            jitter_max: Some(Duration::from_millis(25)),
        }
    }

    /// Waiting for a distributed activity lock held by another request.
    pub fn lock_acquisition() -> Self {
        Self {
            max_attempts: 40,
            base_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(25)),
        }
    }

    fn next_backoff(&self, backoff: Duration) -> Duration {
        std::cmp::min(backoff * 2, self.max_backoff)
    }

    fn jitter(&self) -> Duration {
        match self.jitter_max.map(|jitter| jitter.as_millis() as u64) {
            Some(0) | None => Duration::ZERO,
            Some(max) => Duration::from_millis(rand::random_range(0..=max)),
        }
    }
}

/// Calls `f` until it succeeds or `max_attempts` calls failed; the last error
/// is returned.
pub async fn retry_async_with_config<F, Fut, T, E>(config: RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts_left = config.max_attempts.max(1);
    let mut backoff = config.base_backoff;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts_left -= 1;
                if attempts_left == 0 {
                    return Err(err);
                }
                tokio::time::sleep(backoff + config.jitter()).await;
                backoff = config.next_backoff(backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter_max: None,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicUsize::new(0);
        let res: Result<usize, &'static str> = retry_async_with_config(quick(3), || async {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("conflict")
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(res, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicUsize::new(0);
        let res: Result<(), &'static str> = retry_async_with_config(quick(2), || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("always conflicting")
        })
        .await;

        assert_eq!(res, Err("always conflicting"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = quick(5);
        let mut backoff = config.base_backoff;
        let mut seen = Vec::new();
        for _ in 0..4 {
            backoff = config.next_backoff(backoff);
            seen.push(backoff.as_millis());
        }
        assert_eq!(seen, vec![2, 4, 4, 4]);
        assert_eq!(config.jitter(), Duration::ZERO);
    }
}
