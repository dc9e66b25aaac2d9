//! Integrations with runtimes and services outside the engine.
//!
//! This module groups the JavaScript interpreter, the language model
//! providers and the headless browser driver. Each one is optional: a
//! strategy missing its dependency reports itself as not applicable.

pub mod browser;
pub mod interpreters;
pub mod llm;

pub use browser::{BrowserDriver, BrowserError, BrowserOptions, BrowserSession};
pub use interpreters::{BoaJavascriptInterpreter, InterpreterError, JavascriptInterpreter};
pub use llm::{LanguageModel, LanguageModelError, ModelConfig, ModelPrompt, OpenAiProvider};

#[cfg(feature = "browser")]
pub use browser::{ChromiumDriver, ChromiumSession};
