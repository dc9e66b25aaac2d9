//! Core data structures shared by the strategies, the cascade and the manager.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A single resolution request as received from the surrounding service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    raw_url: String,
    requester: String,
    requested_at: DateTime<Utc>,
}

impl LinkRequest {
    pub fn new(raw_url: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            raw_url: raw_url.into(),
            requester: requester.into(),
            requested_at: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = requested_at;
        self
    }

    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    /// Opaque identity of the caller. The engine never interprets it.
    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }
}

/// Result of a single strategy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// The strategy found the destination. The cascade stops here.
    Resolved {
        final_url: String,
        method: String,
        elapsed: Duration,
    },
    /// The strategy does not apply to this page (or lacks a dependency).
    NotApplicable { reason: String },
    /// The strategy applied but could not extract a destination.
    Failed { reason: String },
    /// Environment-level failure. The cascade aborts.
    FatalError { reason: String },
}

impl StrategyOutcome {
    pub fn resolved(final_url: impl Into<String>, method: &str, elapsed: Duration) -> Self {
        StrategyOutcome::Resolved {
            final_url: final_url.into(),
            method: method.to_string(),
            elapsed,
        }
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        StrategyOutcome::NotApplicable {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        StrategyOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        StrategyOutcome::FatalError {
            reason: reason.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, StrategyOutcome::Resolved { .. })
    }
}

/// Condensed verdict stored in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    Resolved,
    NotApplicable,
    Failed,
    Fatal,
}

impl fmt::Display for AttemptVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttemptVerdict::Resolved => "resolved",
            AttemptVerdict::NotApplicable => "not applicable",
            AttemptVerdict::Failed => "failed",
            AttemptVerdict::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// Record of one strategy invocation inside a cascade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub strategy: String,
    pub verdict: AttemptVerdict,
    pub reason: Option<String>,
    pub elapsed: Duration,
}

impl AttemptRecord {
    pub fn from_outcome(strategy: &str, outcome: &StrategyOutcome, elapsed: Duration) -> Self {
        let (verdict, reason) = match outcome {
            StrategyOutcome::Resolved { .. } => (AttemptVerdict::Resolved, None),
            StrategyOutcome::NotApplicable { reason } => {
                (AttemptVerdict::NotApplicable, Some(reason.clone()))
            }
            StrategyOutcome::Failed { reason } => (AttemptVerdict::Failed, Some(reason.clone())),
            StrategyOutcome::FatalError { reason } => (AttemptVerdict::Fatal, Some(reason.clone())),
        };
        Self {
            strategy: strategy.to_string(),
            verdict,
            reason,
            elapsed,
        }
    }
}

/// Operator-facing explanation of an unresolved link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub attempts: Vec<AttemptRecord>,
    /// Set when a strategy aborted the cascade.
    pub fatal: Option<String>,
}

impl Diagnostics {
    pub fn new(attempts: Vec<AttemptRecord>, fatal: Option<String>) -> Self {
        Self { attempts, fatal }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            attempts: Vec::new(),
            fatal: Some(message.into()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.fatal.is_some()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fatal {
            Some(reason) => write!(f, "resolution aborted: {reason}")?,
            None => f.write_str("all strategies failed")?,
        }
        for attempt in &self.attempts {
            write!(
                f,
                "\n• {}: {}",
                attempt.strategy,
                attempt.reason.as_deref().unwrap_or("failed")
            )?;
        }
        Ok(())
    }
}

/// Outcome returned across the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassResult {
    Resolved {
        final_url: String,
        method: String,
        /// `true` when served from the result cache without running strategies.
        cached: bool,
    },
    Unresolved {
        diagnostics: Diagnostics,
    },
    Denied {
        reason: String,
    },
}

impl BypassResult {
    pub fn is_resolved(&self) -> bool {
        matches!(self, BypassResult::Resolved { .. })
    }

    pub fn final_url(&self) -> Option<&str> {
        match self {
            BypassResult::Resolved { final_url, .. } => Some(final_url),
            _ => None,
        }
    }

    /// Short human readable summary for the surrounding service.
    pub fn summary(&self) -> String {
        match self {
            BypassResult::Resolved {
                final_url, method, ..
            } => format!("resolved via {method}: {final_url}"),
            BypassResult::Unresolved { diagnostics } => match &diagnostics.fatal {
                Some(reason) => format!("could not resolve link ({reason})"),
                None => format!(
                    "could not resolve link after {} attempts",
                    diagnostics.attempts.len()
                ),
            },
            BypassResult::Denied { reason } => format!("link rejected: {reason}"),
        }
    }
}
