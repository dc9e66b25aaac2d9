//! Headless browser integration.
//!
//! The browser strategy drives pages through [`BrowserDriver`] and
//! [`BrowserSession`]. A session is owned by exactly one attempt and must be
//! closed by it; implementations also release their resources on drop so a
//! timed-out attempt cannot leak a browser process.

#[cfg(feature = "browser")]
mod chromium;

#[cfg(feature = "browser")]
pub use chromium::{ChromiumDriver, ChromiumSession};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    /// No browser could be started (binary missing, sandbox refused, ...).
    #[error("browser unavailable: {0}")]
    Unavailable(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("browser operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("browser error: {0}")]
    Other(String),
}

/// Settings used when launching browser sessions.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub executable: Option<std::path::PathBuf>,
    pub navigation_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            executable: None,
            navigation_timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load `url` and wait for the document to settle.
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    /// Evaluate a script in the page and return its JSON value
    /// (`Null` for `undefined`).
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}
