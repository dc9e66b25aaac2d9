//! Metrics collection utilities.
//!
//! Aggregates engine-wide counters plus per-strategy attempt statistics with
//! latency percentiles over a sliding window.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::AttemptVerdict;
use crate::strategies::STRATEGY_ORDER;

/// Engine-wide counters.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    /// Every `resolve` call, denied ones included.
    pub resolutions: u64,
    pub cache_hits: u64,
    /// Resolved by running the cascade (waiters of a shared flight included).
    pub resolved: u64,
    pub unresolved: u64,
    pub denied: u64,
    /// Callers that joined a flight started by someone else.
    pub coalesced: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl GlobalStats {
    /// Share of admitted resolutions that ended with a link.
    pub fn success_rate(&self) -> f64 {
        let admitted = self.cache_hits + self.resolved + self.unresolved;
        if admitted == 0 {
            return 0.0;
        }
        (self.cache_hits + self.resolved) as f64 / admitted as f64
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            resolutions: 0,
            cache_hits: 0,
            resolved: 0,
            unresolved: 0,
            denied: 0,
            coalesced: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Strategy-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct StrategyStats {
    pub strategy: String,
    pub attempts: u64,
    pub successes: u64,
    pub not_applicable: u64,
    pub failures: u64,
    pub fatal: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl StrategyStats {
    fn from_accumulator(strategy: &str, acc: &StrategyAccumulator) -> Self {
        let (avg, p95) = latency_stats(&acc.latencies);
        Self {
            strategy: strategy.to_string(),
            attempts: acc.attempts,
            successes: acc.successes,
            not_applicable: acc.not_applicable,
            failures: acc.failures,
            fatal: acc.fatal,
            average_latency: avg,
            p95_latency: p95,
        }
    }

    /// Successes over the attempts where the strategy actually applied.
    pub fn success_rate(&self) -> f64 {
        let applied = self.attempts - self.not_applicable;
        if applied == 0 {
            return 0.0;
        }
        self.successes as f64 / applied as f64
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    /// In cascade order; strategies never attempted are absent.
    pub strategies: Vec<StrategyStats>,
}

impl MetricsSnapshot {
    pub fn strategy(&self, name: &str) -> Option<&StrategyStats> {
        self.strategies.iter().find(|stats| stats.strategy == name)
    }
}

#[derive(Debug)]
struct StrategyAccumulator {
    attempts: u64,
    successes: u64,
    not_applicable: u64,
    failures: u64,
    fatal: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl StrategyAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            not_applicable: 0,
            failures: 0,
            fatal: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record(&mut self, verdict: AttemptVerdict, latency: Duration) {
        self.attempts += 1;
        match verdict {
            AttemptVerdict::Resolved => self.successes += 1,
            AttemptVerdict::NotApplicable => self.not_applicable += 1,
            AttemptVerdict::Failed => self.failures += 1,
            AttemptVerdict::Fatal => self.fatal += 1,
        }
        push_sample(&mut self.latencies, self.max_window, latency);
    }
}

fn push_sample(window: &mut VecDeque<Duration>, max_window: usize, sample: Duration) {
    if window.len() == max_window {
        window.pop_front();
    }
    window.push_back(sample);
}

fn latency_stats(latencies: &VecDeque<Duration>) -> (Option<Duration>, Option<Duration>) {
    if latencies.is_empty() {
        return (None, None);
    }
    let mut samples: Vec<_> = latencies.iter().cloned().collect();
    samples.sort_unstable();
    let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    resolution_latencies: VecDeque<Duration>,
    strategies: HashMap<String, StrategyAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            resolution_latencies: VecDeque::with_capacity(max_window),
            strategies: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, strategy: &str) -> &mut StrategyAccumulator {
        self.strategies
            .entry(strategy.to_string())
            .or_insert_with(|| StrategyAccumulator::new(self.max_window))
    }

    fn record_latency(&mut self, latency: Duration) {
        push_sample(&mut self.resolution_latencies, self.max_window, latency);
        let (avg, p95) = latency_stats(&self.resolution_latencies);
        self.global.average_latency = avg;
        self.global.p95_latency = p95;
    }
}

/// Thread-safe metrics collector fed by the manager's events.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self) {
        self.state().global.resolutions += 1;
    }

    pub fn record_cache_hit(&self) {
        self.state().global.cache_hits += 1;
    }

    pub fn record_denied(&self) {
        self.state().global.denied += 1;
    }

    pub fn record_coalesced(&self) {
        self.state().global.coalesced += 1;
    }

    pub fn record_resolved(&self, latency: Duration) {
        let mut guard = self.state();
        guard.global.resolved += 1;
        guard.record_latency(latency);
    }

    pub fn record_unresolved(&self, latency: Duration) {
        let mut guard = self.state();
        guard.global.unresolved += 1;
        guard.record_latency(latency);
    }

    pub fn record_attempt(&self, strategy: &str, verdict: AttemptVerdict, latency: Duration) {
        self.state().accumulator_mut(strategy).record(verdict, latency);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let mut strategies: Vec<_> = guard
            .strategies
            .iter()
            .map(|(strategy, acc)| StrategyStats::from_accumulator(strategy, acc))
            .collect();
        strategies.sort_by_key(|stats| {
            let position = STRATEGY_ORDER
                .iter()
                .position(|name| *name == stats.strategy)
                .unwrap_or(STRATEGY_ORDER.len());
            (position, stats.strategy.clone())
        });
        MetricsSnapshot {
            global: guard.global.clone(),
            strategies,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn aggregates_strategy_attempts() {
        let metrics = MetricsCollector::new();
        metrics.record_attempt("javascript", AttemptVerdict::Failed, Duration::from_millis(300));
        metrics.record_attempt("static_html", AttemptVerdict::NotApplicable, Duration::from_millis(10));
        metrics.record_attempt("static_html", AttemptVerdict::Resolved, Duration::from_millis(150));
        metrics.record_attempt("static_html", AttemptVerdict::Failed, Duration::from_millis(850));

        let snapshot = metrics.snapshot();
        let names: Vec<_> = snapshot.strategies.iter().map(|s| s.strategy.as_str()).collect();
        assert_eq!(names, ["static_html", "javascript"]);

        let stats = snapshot.strategy("static_html").unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.not_applicable, 1);
        assert_eq!(stats.p95_latency, Some(Duration::from_millis(850)));
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn global_success_rate_ignores_denied_links() {
        let metrics = MetricsCollector::new();
        for _ in 0..4 {
            metrics.record_request();
        }
        metrics.record_denied();
        metrics.record_cache_hit();
        metrics.record_resolved(Duration::from_millis(200));
        metrics.record_unresolved(Duration::from_millis(400));

        let global = metrics.snapshot().global;
        assert_eq!(global.resolutions, 4);
        assert_eq!(global.denied, 1);
        assert!((global.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(global.average_latency, Some(Duration::from_millis(300)));
    }
}
