//! Ordered strategy cascade.
//!
//! Runs strategies one after another until one resolves the link. Every
//! attempt is bounded by a timeout; `FatalError` (or an expired timeout)
//! aborts the whole run without trying the remaining strategies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use super::{Strategy, StrategyContext};
use crate::core::{AttemptRecord, Diagnostics, StrategyOutcome};
use crate::modules::events::{BypassEvent, EventDispatcher, StrategyAttemptEvent};

/// Static description of a registered strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyInfo {
    pub name: &'static str,
    /// 1-based position in the cascade.
    pub position: usize,
    pub timeout: Duration,
}

/// Everything a cascade run produced.
#[derive(Debug, Clone)]
pub struct CascadeReport {
    /// `Resolved`, the aborting `FatalError`, or `Failed` when every strategy
    /// was exhausted.
    pub outcome: StrategyOutcome,
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl CascadeReport {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_resolved()
    }

    /// Diagnostics for an unresolved run.
    pub fn diagnostics(&self) -> Diagnostics {
        let fatal = match &self.outcome {
            StrategyOutcome::FatalError { reason } => Some(reason.clone()),
            _ => None,
        };
        Diagnostics::new(self.attempts.clone(), fatal)
    }
}

pub struct Cascade {
    strategies: Vec<Arc<dyn Strategy>>,
    default_timeout: Duration,
    events: Arc<EventDispatcher>,
}

impl Cascade {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>, default_timeout: Duration) -> Self {
        Self {
            strategies,
            default_timeout,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    /// Report every attempt to `events`.
    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn strategy(&self, name: &str) -> Option<&Arc<dyn Strategy>> {
        self.strategies.iter().find(|strategy| strategy.name() == name)
    }

    pub fn describe(&self) -> Vec<StrategyInfo> {
        self.strategies
            .iter()
            .enumerate()
            .map(|(index, strategy)| StrategyInfo {
                name: strategy.name(),
                position: index + 1,
                timeout: self.timeout_for(strategy.as_ref()),
            })
            .collect()
    }

    fn timeout_for(&self, strategy: &dyn Strategy) -> Duration {
        strategy.timeout().unwrap_or(self.default_timeout)
    }

    /// Run a single strategy under its timeout.
    pub async fn attempt(
        &self,
        strategy: &dyn Strategy,
        url: &Url,
        requester: Option<&str>,
    ) -> (StrategyOutcome, Duration) {
        let timeout = self.timeout_for(strategy);
        let mut ctx = StrategyContext::new(timeout);
        if let Some(requester) = requester {
            ctx = ctx.with_requester(requester);
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, strategy.attempt(url, &ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => StrategyOutcome::fatal(format!(
                "{} timed out after {}s",
                strategy.name(),
                timeout.as_secs_f64()
            )),
        };
        (outcome, started.elapsed())
    }

    /// Try every strategy in order until one resolves `url`.
    pub async fn run(&self, url: &Url, requester: Option<&str>) -> CascadeReport {
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let name = strategy.name();
            log::debug!("Trying {name} on {url}");

            let (outcome, elapsed) = self.attempt(strategy.as_ref(), url, requester).await;
            attempts.push(AttemptRecord::from_outcome(name, &outcome, elapsed));
            self.events
                .dispatch(BypassEvent::StrategyAttempt(StrategyAttemptEvent::new(
                    url.as_str(),
                    name,
                    &outcome,
                    elapsed,
                )));

            match &outcome {
                StrategyOutcome::Resolved { final_url, .. } => {
                    log::info!("{name} resolved {url} -> {final_url} in {:.2}s", elapsed.as_secs_f64());
                    return CascadeReport {
                        outcome,
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                StrategyOutcome::FatalError { reason } => {
                    log::warn!("Resolution of {url} aborted by {name}: {reason}");
                    return CascadeReport {
                        outcome,
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                StrategyOutcome::NotApplicable { reason } => {
                    log::debug!("{name} not applicable to {url}: {reason}");
                }
                StrategyOutcome::Failed { reason } => {
                    log::debug!("{name} failed on {url}: {reason}");
                }
            }
        }

        CascadeReport {
            outcome: StrategyOutcome::failed("all strategies failed"),
            attempts,
            elapsed: started.elapsed(),
        }
    }
}
