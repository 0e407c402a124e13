use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;

/// Bounded retry with linear backoff for transient model failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_external_call()
    }
}

impl RetryPolicy {
    pub fn default_external_call() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(200),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Total time spent sleeping between attempts when every retry is used.
    pub fn total_backoff(&self) -> Duration {
        let n = self.max_retries;
        self.backoff * (n * (n + 1) / 2)
    }

    /// Runs `f` until it succeeds, fails with a non-transient error, or the retry
    /// budget is spent. `f` receives the zero-based attempt number.
    pub async fn retry<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    warn!(attempt, error = %err, "transient model failure, retrying");
                    attempt += 1;
                    sleep(self.backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn total_backoff_is_linear_sum() {
        assert_eq!(
            RetryPolicy::default_external_call().total_backoff(),
            Duration::from_millis(1200)
        );
        assert_eq!(RetryPolicy::none().total_backoff(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let res = policy
            .retry(|_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(AgentError::ModelUnavailable("429".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_on_permanent_errors_and_exhausted_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let res: Result<()> = policy
            .retry(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentError::ModelContractViolation("bad shape".into()))
                }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let res: Result<()> = policy
            .retry(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentError::ModelUnavailable("503".into()))
                }
            })
            .await;
        assert!(matches!(res, Err(AgentError::ModelUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
