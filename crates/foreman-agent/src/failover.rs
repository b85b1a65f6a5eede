use crate::backends::{Backend, ExecutionOutput};
use async_trait::async_trait;
use foreman_core::{ErrorSeverity, ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour for failover across backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// A [`Backend`] that wraps an ordered chain of backends and performs
/// automatic failover with exponential-backoff retries.
///
/// For each request it tries backends in order:
/// - transient errors are retried on the same backend up to `max_retries`
///   times with exponential backoff;
/// - recoverable errors move straight to the next backend;
/// - critical errors are returned immediately, never retried.
///
/// When the chain is exhausted after transient failures the error is
/// escalated to [`ForemanError::RetriesExhausted`] (recoverable), otherwise
/// the last error is returned unchanged.
pub struct FailoverBackend {
    backends: Vec<Arc<dyn Backend>>,
    policy: RetryPolicy,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl FailoverBackend {
    /// Create a failover chain. Fails when `backends` is empty.
    pub fn new(backends: Vec<Arc<dyn Backend>>, policy: RetryPolicy) -> ForemanResult<Self> {
        if backends.is_empty() {
            return Err(ForemanError::Config(
                "FailoverBackend requires at least one backend".into(),
            ));
        }
        Ok(Self {
            backends,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        })
    }

    /// Number of backends in the chain.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always `false`: construction rejects an empty chain.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Perform a sleep for the given duration in milliseconds.
    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl Backend for FailoverBackend {
    fn name(&self) -> &str {
        "failover"
    }

    async fn execute(
        &self,
        task_description: &str,
        output_dir: &Path,
    ) -> ForemanResult<ExecutionOutput> {
        let mut last_err: Option<ForemanError> = None;
        let mut attempts = 0u32;

        for (backend_idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                attempts += 1;
                match backend.execute(task_description, output_dir).await {
                    Ok(output) => return Ok(output),
                    Err(e) => match e.severity() {
                        ErrorSeverity::Critical => {
                            warn!(
                                backend = backend.name(),
                                error = %e,
                                "Critical backend error, not retrying"
                            );
                            return Err(e);
                        }
                        ErrorSeverity::Recoverable => {
                            warn!(
                                backend = backend.name(),
                                backend_idx,
                                attempt,
                                error = %e,
                                "Non-retryable error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }
                        ErrorSeverity::Transient => {
                            if attempt < self.policy.max_retries {
                                let delay = compute_backoff(&self.policy, attempt);
                                info!(
                                    backend = backend.name(),
                                    backend_idx,
                                    attempt,
                                    delay_ms = delay,
                                    error = %e,
                                    "Retryable error, backing off"
                                );
                                self.do_sleep(delay).await;
                            }
                            last_err = Some(e);
                        }
                    },
                }
            }
        }

        Err(match last_err {
            Some(e) if e.is_transient() => ForemanError::RetriesExhausted {
                attempts,
                last_error: e.to_string(),
            },
            Some(e) => e,
            None => ForemanError::Execution("All failover backends exhausted".into()),
        })
    }

    async fn health_check(&self) -> bool {
        for backend in &self.backends {
            if backend.health_check().await {
                return true;
            }
        }
        false
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A mock backend that returns a sequence of results.
    struct MockBackend {
        /// Results to return in order; pops from front on each call.
        results: tokio::sync::Mutex<Vec<ForemanResult<ExecutionOutput>>>,
        call_count: AtomicU32,
    }

    impl MockBackend {
        fn new(results: Vec<ForemanResult<ExecutionOutput>>) -> Arc<Self> {
            Arc::new(Self {
                results: tokio::sync::Mutex::new(results),
                call_count: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        async fn execute(&self, _: &str, _: &Path) -> ForemanResult<ExecutionOutput> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Err(ForemanError::Execution("MockBackend: no more results".into()))
            } else {
                results.remove(0)
            }
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    fn ok(summary: &str) -> ForemanResult<ExecutionOutput> {
        Ok(ExecutionOutput {
            summary: summary.into(),
            ..ExecutionOutput::default()
        })
    }

    fn instant(backends: Vec<Arc<dyn Backend>>) -> FailoverBackend {
        FailoverBackend {
            backends,
            policy: RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 0,
                backoff_max_ms: 0,
            },
            sleep_fn: Some(Box::new(|_| Box::pin(async {}))),
        }
    }

    // ── Test 1: retry succeeds on second attempt ─────────────────────────

    #[tokio::test]
    async fn retry_succeeds_on_second_try() {
        let mock = MockBackend::new(vec![
            Err(ForemanError::Http("429 Too Many Requests".into())),
            ok("ok"),
        ]);
        let failover = instant(vec![mock.clone()]);

        let out = failover.execute("task", Path::new(".")).await.unwrap();
        assert_eq!(out.summary, "ok");
        assert_eq!(mock.calls(), 2);
    }

    // ── Test 2: transient failures everywhere escalate ───────────────────

    #[tokio::test]
    async fn exhausted_transient_errors_escalate_to_recoverable() {
        let first = MockBackend::new(
            (0..4)
                .map(|_| Err(ForemanError::Http("500 Internal Server Error".into())))
                .collect(),
        );
        let second = MockBackend::new(
            (0..4)
                .map(|_| Err(ForemanError::Http("503 Service Unavailable".into())))
                .collect(),
        );
        let failover = instant(vec![first.clone(), second.clone()]);

        let err = failover.execute("task", Path::new(".")).await.unwrap_err();
        match &err {
            ForemanError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(*attempts, 8);
                assert!(last_error.contains("503"), "got: {last_error}");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(err.severity(), ErrorSeverity::Recoverable);
        assert_eq!(first.calls(), 4);
        assert_eq!(second.calls(), 4);
    }

    // ── Test 3: recoverable error skips retries immediately ──────────────

    #[tokio::test]
    async fn recoverable_error_moves_to_next_backend() {
        let first = MockBackend::new(vec![
            Err(ForemanError::Http("400 Bad Request".into())),
            ok("should not reach"),
        ]);
        let second = MockBackend::new(vec![ok("fallback ok")]);
        let failover = instant(vec![first.clone(), second]);

        let out = failover.execute("task", Path::new(".")).await.unwrap();
        assert_eq!(out.summary, "fallback ok");
        assert_eq!(first.calls(), 1);
    }

    // ── Test 4: critical errors stop the chain ───────────────────────────

    #[tokio::test]
    async fn critical_error_is_never_retried() {
        let first = MockBackend::new(vec![Err(ForemanError::Security(
            "path escapes workspace".into(),
        ))]);
        let second = MockBackend::new(vec![ok("unreachable")]);
        let failover = instant(vec![first.clone(), second.clone()]);

        let err = failover.execute("task", Path::new(".")).await.unwrap_err();
        assert!(err.is_critical());
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    // ── Test 5: backoff timing computation ───────────────────────────────

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        };

        assert_eq!(compute_backoff(&policy, 0), 500);
        assert_eq!(compute_backoff(&policy, 1), 1000);
        assert_eq!(compute_backoff(&policy, 3), 4000);
        assert_eq!(compute_backoff(&policy, 5), 16000);
        assert_eq!(compute_backoff(&policy, 6), 30_000);
        assert_eq!(compute_backoff(&policy, 80), 30_000);
    }

    // ── Test 6: backoff delays follow the policy ─────────────────────────

    #[tokio::test]
    async fn sleeps_follow_exponential_backoff() {
        let delays = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = delays.clone();
        let failover = FailoverBackend {
            backends: vec![MockBackend::new(vec![
                Err(ForemanError::Execution("request timed out".into())),
                Err(ForemanError::Execution("request timed out".into())),
                ok("third time"),
            ])],
            policy: RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 100,
                backoff_max_ms: 10_000,
            },
            sleep_fn: Some(Box::new(move |ms| {
                recorded.lock().unwrap().push(ms);
                Box::pin(async {})
            })),
        };

        let out = failover.execute("task", Path::new(".")).await.unwrap();
        assert_eq!(out.summary, "third time");
        assert_eq!(*delays.lock().unwrap(), vec![100, 200]);
    }

    #[test]
    fn empty_chain_is_a_config_error() {
        assert!(matches!(
            FailoverBackend::new(Vec::new(), RetryPolicy::default()),
            Err(ForemanError::Config(_))
        ));
    }

    #[tokio::test]
    async fn health_check_needs_one_healthy_backend() {
        let chain = FailoverBackend::new(
            vec![
                MockBackend::new(Vec::new()),
                Arc::new(crate::backends::DryRunBackend::new()),
            ],
            RetryPolicy::default(),
        )
        .unwrap();
        assert!(chain.health_check().await);
        assert_eq!(chain.len(), 2);
    }
}
