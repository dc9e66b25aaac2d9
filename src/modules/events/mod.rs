//! Event system for the resolution engine.
//!
//! Provides hooks for metrics, logging and custom reporting sinks around
//! every resolution and strategy attempt.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::core::{AttemptRecord, AttemptVerdict, Diagnostics, StrategyOutcome};

/// A `resolve` call entered the engine.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub url: String,
    pub requester: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeniedEvent {
    pub url: String,
    pub requester: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub key: String,
    pub final_url: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}

/// One strategy attempt inside a cascade run.
#[derive(Debug, Clone)]
pub struct StrategyAttemptEvent {
    pub url: String,
    pub strategy: String,
    pub verdict: AttemptVerdict,
    pub reason: Option<String>,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

impl StrategyAttemptEvent {
    pub fn new(url: &str, strategy: &str, outcome: &StrategyOutcome, elapsed: Duration) -> Self {
        let record = AttemptRecord::from_outcome(strategy, outcome, elapsed);
        Self {
            url: url.to_string(),
            strategy: record.strategy,
            verdict: record.verdict,
            reason: record.reason,
            elapsed,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub key: String,
    pub final_url: String,
    pub method: String,
    /// Time the caller waited, coalesced waits included.
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UnresolvedEvent {
    pub key: String,
    pub diagnostics: Diagnostics,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// A caller joined a resolution already in flight.
#[derive(Debug, Clone)]
pub struct CoalescedEvent {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum BypassEvent {
    Request(RequestEvent),
    Denied(DeniedEvent),
    CacheHit(CacheHitEvent),
    StrategyAttempt(StrategyAttemptEvent),
    Resolved(ResolvedEvent),
    Unresolved(UnresolvedEvent),
    Coalesced(CoalescedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &BypassEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: BypassEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &BypassEvent) {
        match event {
            BypassEvent::Request(request) => {
                log::debug!("-> resolve {} for {}", request.url, request.requester);
            }
            BypassEvent::Denied(denied) => {
                log::info!("denied {} ({})", denied.url, denied.reason);
            }
            BypassEvent::CacheHit(hit) => {
                log::debug!("cache hit {} -> {}", hit.key, hit.final_url);
            }
            BypassEvent::StrategyAttempt(attempt) => {
                log::debug!(
                    "{} on {}: {} ({:.2}s){}",
                    attempt.strategy,
                    attempt.url,
                    attempt.verdict,
                    attempt.elapsed.as_secs_f64(),
                    attempt
                        .reason
                        .as_deref()
                        .map(|reason| format!(" {reason}"))
                        .unwrap_or_default()
                );
            }
            BypassEvent::Resolved(resolved) => {
                log::info!(
                    "<- {} -> {} via {} ({:.2}s)",
                    resolved.key,
                    resolved.final_url,
                    resolved.method,
                    resolved.elapsed.as_secs_f64()
                );
            }
            BypassEvent::Unresolved(unresolved) => {
                log::warn!("unresolved {}: {}", unresolved.key, unresolved.diagnostics);
            }
            BypassEvent::Coalesced(coalesced) => {
                log::debug!("joined flight for {}", coalesced.key);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &BypassEvent) {
        match event {
            BypassEvent::Request(_) => self.metrics.record_request(),
            BypassEvent::Denied(_) => self.metrics.record_denied(),
            BypassEvent::CacheHit(_) => self.metrics.record_cache_hit(),
            BypassEvent::StrategyAttempt(attempt) => {
                self.metrics
                    .record_attempt(&attempt.strategy, attempt.verdict, attempt.elapsed);
            }
            BypassEvent::Resolved(resolved) => self.metrics.record_resolved(resolved.elapsed),
            BypassEvent::Unresolved(unresolved) => self.metrics.record_unresolved(unresolved.elapsed),
            BypassEvent::Coalesced(_) => self.metrics.record_coalesced(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &BypassEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(BypassEvent::Coalesced(CoalescedEvent {
            key: "https://short.ly/abc".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn metrics_handler_counts_attempts() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        let outcome = StrategyOutcome::failed("no link found in page");
        handler.handle(&BypassEvent::StrategyAttempt(StrategyAttemptEvent::new(
            "https://short.ly/abc",
            "static_html",
            &outcome,
            Duration::from_millis(40),
        )));

        let snapshot = metrics.snapshot();
        let stats = snapshot.strategy("static_html").unwrap();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.failures, 1);
    }
}
