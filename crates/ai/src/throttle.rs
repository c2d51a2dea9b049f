//! Concurrency limit and transient-error retries in front of a backend.

use super::r#interface::*;
use async_trait::async_trait;
use stagegate_core::InferenceSettings;
use stagegate_tools::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Wraps a backend so at most `limit` requests are in flight and transient
/// errors are retried with backoff.
pub struct ThrottledBackend {
    inner: Arc<dyn InferenceBackend>,
    permits: Semaphore,
    retry: RetryPolicy,
}

impl ThrottledBackend {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn InferenceBackend>, limit: usize, retry: RetryPolicy) -> Self {
        Self {
            inner,
            permits: Semaphore::new(limit.max(1)),
            retry,
        }
    }

    /// Wrap `inner` using configured limits.
    pub fn from_settings(inner: Arc<dyn InferenceBackend>, settings: &InferenceSettings) -> Self {
        Self::new(
            inner,
            settings.max_concurrent_requests,
            RetryPolicy::new(
                settings.max_retries,
                Duration::from_millis(500),
                Duration::from_secs(10),
            ),
        )
    }
}

#[async_trait]
impl InferenceBackend for ThrottledBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| InferenceError::Config(e.to_string()))?;
                self.inner.judge(request).await
            };

            match result {
                Err(e) if e.is_transient() && self.retry.allows(attempts) => {
                    let delay = self.retry.delay(attempts);
                    tracing::warn!(
                        "Inference attempt {} failed ({}), retrying in {:?}",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn judge(&self, _request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(InferenceError::Unreachable("down".into()));
            }
            Ok(Judgment {
                content: "ok".into(),
                model: "flaky".into(),
                usage: Usage::default(),
                confidence: None,
            })
        }
    }

    fn flaky(fail_first: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first,
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        })
    }

    fn fast_retry(n: u32) -> RetryPolicy {
        RetryPolicy::new(n, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let inner = flaky(2);
        let backend = ThrottledBackend::new(inner.clone(), 1, fast_retry(2));
        let j = backend
            .judge(&JudgmentRequest::new("a", "p", "c"))
            .await
            .unwrap();
        assert_eq!(j.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let inner = flaky(10);
        let backend = ThrottledBackend::new(inner.clone(), 1, fast_retry(1));
        assert!(backend
            .judge(&JudgmentRequest::new("a", "p", "c"))
            .await
            .is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_limits_concurrency() {
        let inner = flaky(0);
        let backend = Arc::new(ThrottledBackend::new(inner.clone(), 2, RetryPolicy::none()));
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let backend = backend.clone();
            set.spawn(async move {
                backend
                    .judge(&JudgmentRequest::new("a", "p", "c"))
                    .await
                    .unwrap();
            });
        }
        while let Some(r) = set.join_next().await {
            r.unwrap();
        }
        assert!(inner.max_seen.load(Ordering::SeqCst) <= 2);
    }
}
