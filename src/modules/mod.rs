//! Cross-cutting services module
//!
//! Observes the engine through events and aggregates them into metrics.

pub mod events;
pub mod metrics;

// Re-export commonly used types
pub use events::{
    BypassEvent, CacheHitEvent, CoalescedEvent, DeniedEvent, EventDispatcher, EventHandler,
    LoggingHandler, MetricsHandler, RequestEvent, ResolvedEvent, StrategyAttemptEvent,
    UnresolvedEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, StrategyStats};
