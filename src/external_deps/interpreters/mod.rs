//! JavaScript interpreter infrastructure.
//!
//! Strategies that need to run page scripts go through [`JavascriptInterpreter`]
//! so the engine can be built without a JavaScript runtime (the strategies then
//! report themselves as not applicable) or with an alternative one.

mod boa;

pub use boa::BoaJavascriptInterpreter;

use thiserror::Error;

/// Abstraction over sandboxed JavaScript runtimes.
///
/// Implementations are synchronous; async callers run them on the blocking
/// pool.
pub trait JavascriptInterpreter: Send + Sync {
    /// Evaluate an anti-bot challenge page and return the computed answer
    /// formatted with 10 decimal places.
    fn solve_challenge(&self, page_html: &str, host: &str) -> InterpreterResult<String>;

    /// Run `scripts` in order inside a stubbed browser environment located at
    /// `page_url` and return the first navigation they trigger
    /// (`location.href = ..`, `location.replace(..)`, `window.open(..)`, timer
    /// callbacks included). Scripts that throw are skipped.
    fn capture_navigation(
        &self,
        scripts: &[String],
        page_url: &str,
    ) -> InterpreterResult<Option<String>>;

    /// Evaluate a single expression and return its string value.
    fn evaluate(&self, expression: &str, page_url: &str) -> InterpreterResult<String> {
        let _ = (expression, page_url);
        Err(InterpreterError::Other("evaluate not implemented".into()))
    }
}

/// Failures produced by JavaScript runtimes.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("javascript execution failed: {0}")]
    Execution(String),
    #[error("javascript engine error: {0}")]
    Other(String),
}

/// Convenience alias for runtime results.
pub type InterpreterResult<T> = Result<T, InterpreterError>;
