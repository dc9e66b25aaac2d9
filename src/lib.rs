//! # linkbypass-rs
//!
//! Resolves shortened or obfuscated links to their real destination.
//!
//! A link goes through a policy gate, a per-URL result cache and a
//! single-flight coordinator before reaching an ordered cascade of
//! extraction strategies, cheapest first:
//!
//! 1. static HTML (redirects, meta refresh, forms, direct links, base64)
//! 2. CSS-hidden content
//! 3. JavaScript (literal redirects, sandboxed evaluation, deobfuscation)
//! 4. anti-bot challenge handling
//! 5. headless browser automation (`browser` feature)
//! 6. language-model assisted extraction
//!
//! ## Example
//!
//! ```no_run
//! use linkbypass_rs::{BypassManager, BypassResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = BypassManager::from_env()?;
//!     manager.start().await?;
//!     match manager.resolve("https://short.ly/abc", "user-42").await {
//!         BypassResult::Resolved { final_url, .. } => println!("{final_url}"),
//!         other => println!("{}", other.summary()),
//!     }
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

mod manager;

pub mod cache;
pub mod config;
pub mod core;
pub mod external_deps;
pub mod flight;
pub mod modules;
pub mod policy;
pub mod strategies;

pub use crate::manager::{
    BypassError,
    BypassManager,
    BypassManagerBuilder,
    EngineResult,
    EngineStats,
};

pub use crate::cache::{
    BackingError,
    CacheBacking,
    CacheEntry,
    CacheSweeper,
    RedbBacking,
    ResultCache,
};

pub use crate::config::{ConfigError, EngineConfig};

pub use crate::core::{
    AttemptRecord,
    AttemptVerdict,
    BypassResult,
    Diagnostics,
    FetchError,
    FetchRequest,
    FetchedPage,
    FetcherOptions,
    LinkRequest,
    NormalizeError,
    NormalizedKey,
    PageFetcher,
    ReqwestPageFetcher,
    StrategyOutcome,
    normalize,
};

pub use crate::external_deps::browser::{BrowserDriver, BrowserError, BrowserOptions, BrowserSession};

#[cfg(feature = "browser")]
pub use crate::external_deps::browser::ChromiumDriver;

pub use crate::external_deps::interpreters::{
    BoaJavascriptInterpreter,
    InterpreterError,
    InterpreterResult,
    JavascriptInterpreter,
};

pub use crate::external_deps::llm::{
    LanguageModel,
    LanguageModelError,
    ModelConfig,
    ModelPrompt,
    OpenAiProvider,
};

pub use crate::flight::{FlightError, FlightRole, SingleFlight};

pub use crate::modules::{
    BypassEvent,
    EventDispatcher,
    EventHandler,
    GlobalStats,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    StrategyStats,
};

pub use crate::policy::{DomainListPolicy, PolicyDecision, PolicyGate, PolicyMode, PolicySource};

pub use crate::strategies::{
    Cascade,
    CascadeReport,
    Strategy,
    StrategyContext,
    StrategyInfo,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
