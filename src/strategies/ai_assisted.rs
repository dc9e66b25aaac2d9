//! Language-model assisted extraction, the last resort of the cascade.
//!
//! The page HTML is truncated, sent to the model together with a fixed
//! analyst prompt, and the model answers with a small JSON verdict.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::extract::{is_destination, resolve_href, truncate_chars};
use super::{AI_ASSISTED, Strategy, StrategyContext, fetch_document};
use crate::core::{FetchRequest, PageFetcher, StrategyOutcome, profile};
use crate::external_deps::llm::{LanguageModel, LanguageModelError, ModelPrompt};

/// Default number of HTML characters sent to the model.
pub const DEFAULT_HTML_BUDGET: usize = 8000;

const SYSTEM_PROMPT: &str = "You are an expert web scraping and bypass specialist. Your task is to analyze HTML content from link shortener pages and extract the final destination URL.

Analyze the provided HTML and:
1. Identify what type of protection is being used (countdown, CAPTCHA, hidden elements, JavaScript obfuscation, etc.)
2. Look for any hidden URLs in the HTML, JavaScript, or meta tags
3. Identify patterns that might reveal the destination URL
4. Provide the final destination URL if found

Respond in JSON format with these fields:
- success: boolean indicating if you found the destination URL
- url: the destination URL (if success is true)
- confidence: number from 0-1 indicating confidence level
- reasoning: brief explanation of how you found the URL
- protection_type: type of protection detected
- error: error message (if success is false)

Be thorough in your analysis. Look for:
- Hidden form inputs with URLs
- JavaScript variables containing URLs
- Base64 encoded strings
- Data attributes on elements
- Comments containing URLs
- Obfuscated JavaScript
";

/// The model's verdict.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkAnalysis {
    pub success: bool,
    pub url: Option<String>,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub protection_type: Option<String>,
    pub error: Option<String>,
}

impl LinkAnalysis {
    /// Parse a model answer. Models sometimes wrap JSON in a code fence or
    /// prose, so the outermost object is extracted first.
    pub fn parse(answer: &str) -> Option<Self> {
        let start = answer.find('{')?;
        let end = answer.rfind('}')?;
        if end < start {
            return None;
        }
        serde_json::from_str(&answer[start..=end]).ok()
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AiAssistedStrategy {
    fetcher: Arc<dyn PageFetcher>,
    model: Option<Arc<dyn LanguageModel>>,
    html_budget: usize,
    timeout: Duration,
}

impl AiAssistedStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>, model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self {
            fetcher,
            model,
            html_budget: DEFAULT_HTML_BUDGET,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_html_budget(mut self, chars: usize) -> Self {
        self.html_budget = chars;
        self
    }

    fn prompt(&self, url: &Url, html: &str) -> ModelPrompt {
        let mut content = truncate_chars(html, self.html_budget).to_string();
        if content.len() < html.len() {
            content.push_str("...");
        }
        let user = format!(
            "URL: {url}\n\nHTML Content:\n```html\n{content}\n```\n\nAnalyze this page and extract the destination URL. Respond in JSON format only."
        );
        ModelPrompt::new(SYSTEM_PROMPT, user).expecting_json()
    }
}

#[async_trait]
impl Strategy for AiAssistedStrategy {
    fn name(&self) -> &'static str {
        AI_ASSISTED
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome {
        let Some(model) = &self.model else {
            return StrategyOutcome::not_applicable("no language model configured");
        };

        let request = FetchRequest::get(url.clone())
            .with_headers(profile::browser_headers(profile::random_user_agent()));
        let page = match fetch_document(AI_ASSISTED, self.fetcher.as_ref(), request).await {
            Ok(page) => page,
            Err(outcome) => return outcome,
        };

        let answer = match model.complete(&self.prompt(url, &page.body)).await {
            Ok(answer) => answer,
            Err(LanguageModelError::Configuration(reason)) => {
                return StrategyOutcome::not_applicable(format!("language model misconfigured: {reason}"));
            }
            Err(err) => return StrategyOutcome::failed(err.to_string()),
        };

        let Some(analysis) = LinkAnalysis::parse(&answer) else {
            log::debug!("{AI_ASSISTED}: unparseable answer from {}", model.name());
            return StrategyOutcome::failed("language model answer is not valid json");
        };
        log::debug!("{AI_ASSISTED}: analysis for {url}: {analysis:?}");

        if !analysis.success {
            return StrategyOutcome::failed(
                analysis
                    .error
                    .unwrap_or_else(|| "language model found no link".to_string()),
            );
        }

        match analysis
            .url
            .as_deref()
            .and_then(|raw| resolve_href(&page.url, raw))
            .filter(|target| is_destination(target, &page.url, url))
        {
            Some(target) => {
                log::info!(
                    "{AI_ASSISTED}: found {target} (confidence {:.2}, {})",
                    analysis.confidence,
                    analysis.protection_type.as_deref().unwrap_or("unknown protection")
                );
                ctx.resolved(&target, AI_ASSISTED)
            }
            None => StrategyOutcome::failed("language model returned an unusable url"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::strategies::testing::{CannedPage, StubFetcher};

    struct StubModel {
        answer: Result<String, String>,
        prompts: Mutex<Vec<ModelPrompt>>,
    }

    impl StubModel {
        fn answering(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(answer.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for StubModel {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn complete(&self, prompt: &ModelPrompt) -> Result<String, LanguageModelError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.answer.clone().map_err(LanguageModelError::Unreachable)
        }
    }

    fn url() -> Url {
        Url::parse("https://short.ly/abc").unwrap()
    }

    fn ctx() -> StrategyContext {
        StrategyContext::new(Duration::from_secs(120))
    }

    fn fetcher(body: &str) -> Arc<StubFetcher> {
        Arc::new(StubFetcher::new().page("https://short.ly/abc", CannedPage::ok(body)))
    }

    #[test]
    fn analysis_tolerates_fenced_answers() {
        let analysis = LinkAnalysis::parse(
            "```json\n{\"success\": true, \"url\": \"https://dest.example/\", \"confidence\": 0.9}\n```",
        )
        .unwrap();
        assert!(analysis.success);
        assert_eq!(analysis.url.as_deref(), Some("https://dest.example/"));
        assert!(analysis.reasoning.is_none());
        assert!(LinkAnalysis::parse("no json here").is_none());
    }

    #[tokio::test]
    async fn resolves_from_model_verdict() {
        let model = StubModel::answering(
            r#"{"success": true, "url": "https://dest.example/file", "confidence": 0.8,
                "reasoning": "hidden input", "protection_type": "hidden elements"}"#,
        );
        let strategy = AiAssistedStrategy::new(fetcher("<html><input type=hidden value=x></html>"), Some(model.clone()));
        let outcome = strategy.attempt(&url(), &ctx()).await;
        match outcome {
            StrategyOutcome::Resolved { final_url, method, .. } => {
                assert_eq!(final_url, "https://dest.example/file");
                assert_eq!(method, AI_ASSISTED);
            }
            other => panic!("expected resolution, got {other:?}"),
        }

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].json_response);
        assert!(prompts[0].user.starts_with("URL: https://short.ly/abc"));
    }

    #[tokio::test]
    async fn long_pages_are_truncated() {
        let model = StubModel::answering(r#"{"success": false, "error": "nothing"}"#);
        let body = "x".repeat(50);
        let strategy = AiAssistedStrategy::new(fetcher(&body), Some(model.clone())).with_html_budget(10);
        let outcome = strategy.attempt(&url(), &ctx()).await;
        assert_eq!(outcome, StrategyOutcome::failed("nothing"));

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].user.contains("```html\nxxxxxxxxxx...\n```"));
    }

    #[tokio::test]
    async fn unusable_answers_fail() {
        let model = StubModel::answering(r#"{"success": true, "url": "https://short.ly/abc"}"#);
        let outcome = AiAssistedStrategy::new(fetcher("<p></p>"), Some(model))
            .attempt(&url(), &ctx())
            .await;
        assert_eq!(outcome, StrategyOutcome::failed("language model returned an unusable url"));

        let model = Arc::new(StubModel {
            answer: Err("connection refused".into()),
            prompts: Mutex::new(Vec::new()),
        });
        let outcome = AiAssistedStrategy::new(fetcher("<p></p>"), Some(model))
            .attempt(&url(), &ctx())
            .await;
        assert!(matches!(outcome, StrategyOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn without_a_model_it_does_not_apply() {
        let strategy = AiAssistedStrategy::new(fetcher("<p></p>"), None);
        let outcome = strategy.attempt(&url(), &ctx()).await;
        assert!(matches!(outcome, StrategyOutcome::NotApplicable { .. }));
    }
}
