//! Resolution strategies and the cascade that runs them.
//!
//! Strategies are tried cheapest first: static HTML, CSS-hidden content,
//! JavaScript, anti-bot challenge handling, headless browser and finally the
//! language model. Each one is stateless across calls; anything it needs per
//! attempt (cookie jars, browser sessions) is created and released inside
//! [`Strategy::attempt`].

pub mod ai_assisted;
pub mod anti_bot;
pub mod browser;
pub mod cascade;
pub mod css_hidden;
pub mod extract;
pub mod javascript;
pub mod static_html;

pub use ai_assisted::{AiAssistedStrategy, LinkAnalysis};
pub use anti_bot::AntiBotStrategy;
pub use browser::BrowserStrategy;
pub use cascade::{Cascade, CascadeReport, StrategyInfo};
pub use css_hidden::CssHiddenStrategy;
pub use javascript::JavascriptStrategy;
pub use static_html::StaticHtmlStrategy;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use crate::core::{FetchError, FetchRequest, FetchedPage, PageFetcher, StrategyOutcome};

pub const STATIC_HTML: &str = "static_html";
pub const CSS_HIDDEN: &str = "css_hidden";
pub const JAVASCRIPT: &str = "javascript";
pub const ANTI_BOT: &str = "anti_bot";
pub const BROWSER: &str = "browser";
pub const AI_ASSISTED: &str = "ai_assisted";

/// Engine-wide strategy order.
pub const STRATEGY_ORDER: [&str; 6] = [STATIC_HTML, CSS_HIDDEN, JAVASCRIPT, ANTI_BOT, BROWSER, AI_ASSISTED];

/// Budget of strategies that declare none.
pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt information handed to a strategy.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    timeout: Duration,
    started: Instant,
    requester: Option<String>,
}

impl StrategyContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: Instant::now(),
            requester: None,
        }
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    /// Upper bound for the whole attempt. The cascade enforces it.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn requester(&self) -> Option<&str> {
        self.requester.as_deref()
    }

    /// Outcome for a destination found by strategy `method`.
    pub fn resolved(&self, final_url: &Url, method: &str) -> StrategyOutcome {
        StrategyOutcome::resolved(final_url.as_str(), method, self.elapsed())
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    /// Stable identifier, also used as the `method` of resolved links.
    fn name(&self) -> &'static str;

    /// Attempt budget. `None` falls back to the cascade default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// One resolution attempt. Must release everything it acquired before
    /// returning.
    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome;
}

/// Map a transport failure onto the cascade taxonomy: network-level failures
/// abort, everything else lets the next strategy run.
pub(crate) fn outcome_for_fetch_error(strategy: &str, err: &FetchError) -> StrategyOutcome {
    if err.is_fatal() {
        StrategyOutcome::fatal(format!("{strategy}: {err}"))
    } else {
        StrategyOutcome::failed(err.to_string())
    }
}

/// Fetch a page and insist on a 2xx answer.
pub(crate) async fn fetch_document(
    strategy: &str,
    fetcher: &dyn PageFetcher,
    request: FetchRequest,
) -> Result<FetchedPage, StrategyOutcome> {
    let page = fetcher
        .fetch(request)
        .await
        .map_err(|err| outcome_for_fetch_error(strategy, &err))?;
    if !page.is_success() {
        return Err(StrategyOutcome::failed(format!("http status {}", page.status)));
    }
    Ok(page)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Canned-page fetcher shared by the strategy tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::HeaderMap;
    use url::Url;

    use crate::core::{FetchError, FetchRequest, FetchedPage, PageFetcher};

    #[derive(Clone)]
    pub struct CannedPage {
        pub status: u16,
        pub final_url: Option<String>,
        pub headers: HeaderMap,
        pub body: String,
    }

    impl CannedPage {
        pub fn ok(body: &str) -> Self {
            Self {
                status: 200,
                final_url: None,
                headers: HeaderMap::new(),
                body: body.to_string(),
            }
        }

        pub fn with_status(mut self, status: u16) -> Self {
            self.status = status;
            self
        }

        pub fn redirected_to(mut self, url: &str) -> Self {
            self.final_url = Some(url.to_string());
            self
        }

        pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
            self.headers.insert(name, value.parse().unwrap());
            self
        }
    }

    /// Serves pages by exact URL (query string ignored when no exact match)
    /// and records every request. Queued pages are served once each, in
    /// order, before the fixed page for the same URL.
    #[derive(Default)]
    pub struct StubFetcher {
        pages: HashMap<String, CannedPage>,
        queued: Mutex<HashMap<String, VecDeque<CannedPage>>>,
        failures: HashMap<String, FetchError>,
        pub requests: Mutex<Vec<FetchRequest>>,
    }

    impl StubFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn page(mut self, url: &str, page: CannedPage) -> Self {
            self.pages.insert(url.to_string(), page);
            self
        }

        pub fn queued(self, url: &str, pages: Vec<CannedPage>) -> Self {
            self.queued
                .lock()
                .unwrap()
                .insert(url.to_string(), pages.into_iter().collect());
            self
        }

        pub fn failing(mut self, url: &str, err: FetchError) -> Self {
            self.failures.insert(url.to_string(), err);
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError> {
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);

            let mut without_query = url.clone();
            without_query.set_query(None);

            if let Some(err) = self.failures.get(url.as_str()) {
                return Err(err.clone());
            }
            let queued = self
                .queued
                .lock()
                .unwrap()
                .get_mut(url.as_str())
                .and_then(VecDeque::pop_front);
            let canned = queued
                .or_else(|| self.pages.get(url.as_str()).cloned())
                .or_else(|| self.pages.get(without_query.as_str()).cloned())
                .unwrap_or_else(|| CannedPage::ok("").with_status(404));

            let final_url = match canned.final_url {
                Some(raw) => Url::parse(&raw).unwrap(),
                None => url,
            };
            Ok(FetchedPage {
                status: canned.status,
                url: final_url,
                headers: canned.headers,
                body: canned.body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_remaining_budget() {
        let ctx = StrategyContext::new(Duration::from_secs(15)).with_requester("user-1");
        assert!(ctx.remaining() <= Duration::from_secs(15));
        assert_eq!(ctx.requester(), Some("user-1"));
    }

    #[test]
    fn network_failures_abort_the_cascade() {
        assert!(matches!(
            outcome_for_fetch_error(STATIC_HTML, &FetchError::Timeout),
            StrategyOutcome::FatalError { .. }
        ));
        assert!(matches!(
            outcome_for_fetch_error(STATIC_HTML, &FetchError::Transport("reset".into())),
            StrategyOutcome::Failed { .. }
        ));
    }
}
