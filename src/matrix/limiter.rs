use std::future::Future;

use tokio::sync::Mutex;
use tracing::debug;

use super::client::MatrixApiError;

/// Serializes homeserver writes and replays any request the server answers
/// with a rate limit. The lock is held across the backoff sleep, so while one
/// request waits out its `retry_after_ms` no other caller can pile more
/// traffic onto the homeserver.
#[derive(Default)]
pub struct RateLimiter {
    gate: Mutex<()>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op`, retrying for as long as the homeserver keeps answering with
    /// M_LIMIT_EXCEEDED. Every other error is handed back to the caller
    /// untouched.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, MatrixApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MatrixApiError>>,
    {
        let _guard = self.gate.lock().await;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_rate_limited() => {
                    let wait = e.retry_after();
                    debug!(
                        wait_ms = wait.as_millis() as u64,
                        "rate limited by homeserver, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio_test::assert_ok;

    use super::*;

    fn limit_exceeded(retry_after_ms: u64) -> MatrixApiError {
        MatrixApiError::Server {
            status: 429,
            errcode: "M_LIMIT_EXCEEDED".to_string(),
            error: "Too Many Requests".to_string(),
            retry_after_ms: Some(retry_after_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_rate_limit_clears() {
        let limiter = RateLimiter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in_op = calls.clone();
        let result = limiter
            .run(move || {
                let calls = calls_in_op.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(limit_exceeded(50))
                    } else {
                        Ok("sent".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_are_not_retried() {
        let limiter = RateLimiter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in_op = calls.clone();
        let result: Result<(), _> = limiter
            .run(move || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MatrixApiError::Server {
                        status: 403,
                        errcode: "M_FORBIDDEN".to_string(),
                        error: "not allowed".to_string(),
                        retry_after_ms: None,
                    })
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.errcode(), Some("M_FORBIDDEN"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_queue_behind_a_limited_request() {
        let limiter = Arc::new(RateLimiter::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_calls = Arc::new(AtomicUsize::new(0));
        let first = {
            let limiter = limiter.clone();
            let order = order.clone();
            let calls = first_calls.clone();
            tokio::spawn(async move {
                limiter
                    .run(move || {
                        let order = order.clone();
                        let calls = calls.clone();
                        async move {
                            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(limit_exceeded(100))
                            } else {
                                order.lock().await.push("first");
                                Ok(())
                            }
                        }
                    })
                    .await
            })
        };

        // Let the first task acquire the gate before the second shows up.
        tokio::task::yield_now().await;

        let second = {
            let limiter = limiter.clone();
            let order = order.clone();
            tokio::spawn(async move {
                limiter
                    .run(move || {
                        let order = order.clone();
                        async move {
                            order.lock().await.push("second");
                            Ok(())
                        }
                    })
                    .await
            })
        };

        assert_ok!(first.await.unwrap());
        assert_ok!(second.await.unwrap());
        assert_eq!(*order.lock().await, vec!["first", "second"]);
    }
}
