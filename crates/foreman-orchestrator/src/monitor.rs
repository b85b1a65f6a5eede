use crate::stopping::{HealthSnapshot, ImprovementSample, MetricsFeed};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::time::Instant;

/// Run-wide counters sampled by the stopping evaluator.
///
/// Written by the engine and executor jobs, read through [`MetricsFeed`].
pub struct RunMetrics {
    started: Instant,
    token_limit: u64,
    context_limit: u64,
    tokens_used: AtomicU64,
    context_size: AtomicU64,
    errors: AtomicU64,
    total_tasks: AtomicU64,
    last_progress_ms: AtomicU64,
    improving: AtomicBool,
    improvement_cycle: AtomicU32,
    improvement_magnitude: AtomicU64,
}

impl RunMetrics {
    /// Zeroed counters; the run clock starts now.
    pub fn new(token_limit: u64, context_limit: u64) -> Self {
        Self {
            started: Instant::now(),
            token_limit,
            context_limit,
            tokens_used: AtomicU64::new(0),
            context_size: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_tasks: AtomicU64::new(0),
            last_progress_ms: AtomicU64::new(0),
            improving: AtomicBool::new(false),
            improvement_cycle: AtomicU32::new(0),
            improvement_magnitude: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    /// Add tokens consumed by a backend call.
    pub fn record_tokens(&self, tokens: u64) {
        self.tokens_used.fetch_add(tokens, Ordering::SeqCst);
    }

    /// Grow the context by `amount`.
    pub fn add_context(&self, amount: u64) {
        self.context_size.fetch_add(amount, Ordering::SeqCst);
    }

    /// Context was pruned to `size`.
    pub fn reset_context(&self, size: u64) {
        self.context_size.store(size, Ordering::SeqCst);
    }

    /// A task failed or was rejected.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of tasks in the run.
    pub fn set_total_tasks(&self, total: u64) {
        self.total_tasks.store(total, Ordering::SeqCst);
    }

    /// A task completed; resets the stagnation clock.
    pub fn mark_progress(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_progress_ms.store(ms, Ordering::SeqCst);
    }

    /// Record the outcome of an improvement cycle.
    pub fn record_improvement(&self, cycle: u32, magnitude: f64) {
        self.improvement_magnitude
            .store(magnitude.to_bits(), Ordering::SeqCst);
        self.improvement_cycle.store(cycle, Ordering::SeqCst);
        self.improving.store(true, Ordering::SeqCst);
    }

    /// Tokens consumed so far.
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    /// Failed or rejected tasks so far.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }
}

impl MetricsFeed for RunMetrics {
    fn sample(&self) -> HealthSnapshot {
        let elapsed = self.started.elapsed();
        let since_progress_ms = (elapsed.as_millis() as u64)
            .saturating_sub(self.last_progress_ms.load(Ordering::SeqCst));
        let improvement = self.improving.load(Ordering::SeqCst).then(|| ImprovementSample {
            cycle: self.improvement_cycle.load(Ordering::SeqCst),
            magnitude: f64::from_bits(self.improvement_magnitude.load(Ordering::SeqCst)),
        });
        HealthSnapshot {
            taken_at: Utc::now(),
            tokens_used: self.tokens_used(),
            token_limit: self.token_limit,
            context_size: self.context_size.load(Ordering::SeqCst),
            context_limit: self.context_limit,
            errors: self.errors(),
            total_tasks: self.total_tasks.load(Ordering::SeqCst),
            minutes_since_progress: since_progress_ms as f64 / 60_000.0,
            elapsed_secs: elapsed.as_secs(),
            improvement,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_counters() {
        let metrics = RunMetrics::new(1000, 500);
        metrics.record_tokens(300);
        metrics.record_tokens(200);
        metrics.add_context(450);
        metrics.record_error();
        metrics.set_total_tasks(4);

        let s = metrics.sample();
        assert_eq!(s.tokens_used, 500);
        assert_eq!(s.token_ratio(), 0.5);
        assert_eq!(s.context_ratio(), 0.9);
        assert_eq!(s.error_ratio(), 0.25);
        assert!(s.improvement.is_none());

        metrics.reset_context(100);
        assert_eq!(metrics.sample().context_size, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagnation_clock() {
        let metrics = RunMetrics::new(1000, 500);
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        let s = metrics.sample();
        assert!((s.minutes_since_progress - 20.0).abs() < 0.01);
        assert_eq!(s.elapsed_secs, 20 * 60);

        metrics.mark_progress();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((metrics.sample().minutes_since_progress - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_improvement_sample() {
        let metrics = RunMetrics::new(1000, 500);
        metrics.record_improvement(2, 0.05);
        let sample = metrics.sample().improvement.unwrap();
        assert_eq!(sample.cycle, 2);
        assert_eq!(sample.magnitude, 0.05);
    }
}
