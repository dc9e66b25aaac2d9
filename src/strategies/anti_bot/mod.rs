//! Anti-bot front ends (Cloudflare style).
//!
//! Each attempt works inside its own cookie session:
//!
//! 1. request the link with a full browser header profile;
//! 2. if an "I'm Under Attack" challenge is served, solve it with the
//!    JavaScript interpreter, wait the announced delay and submit the form;
//! 3. otherwise (or if that fails) warm the session up: visit the site root,
//!    then request the link again as if coming from a search engine.
//!
//! Once a clean page comes back, the link is extracted from it; a clean page
//! on another address counts as the destination itself.

pub mod detect;
pub mod iuam;

pub use detect::{ChallengeKind, Detection, detect};
pub use iuam::{IuamChallenge, IuamError};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderValue, header::ORIGIN};
use scraper::Html;
use url::Url;

use super::extract::{find_direct_link, find_external_anchor, is_destination};
use super::{ANTI_BOT, Strategy, StrategyContext, outcome_for_fetch_error};
use crate::core::{FetchError, FetchRequest, FetchedPage, PageFetcher, StrategyOutcome, profile};
use crate::external_deps::interpreters::JavascriptInterpreter;

/// Upper bound for the IUAM wait, whatever the page asks for.
const MAX_CHALLENGE_DELAY: Duration = Duration::from_secs(8);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

pub struct AntiBotStrategy {
    fetcher: Arc<dyn PageFetcher>,
    interpreter: Option<Arc<dyn JavascriptInterpreter>>,
    timeout: Duration,
}

impl AntiBotStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            interpreter: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    async fn solve_iuam(
        &self,
        http: &dyn PageFetcher,
        page: &FetchedPage,
        user_agent: &str,
        ctx: &StrategyContext,
    ) -> Result<FetchedPage, String> {
        let interpreter = self
            .interpreter
            .clone()
            .ok_or_else(|| "iuam challenge needs a javascript interpreter".to_string())?;
        let challenge = IuamChallenge::parse(&page.body, &page.url).map_err(|err| err.to_string())?;
        let host = page
            .url
            .host_str()
            .ok_or_else(|| "challenge page has no host".to_string())?
            .to_string();

        let body = page.body.clone();
        let answer = tokio::task::spawn_blocking(move || interpreter.solve_challenge(&body, &host))
            .await
            .map_err(|err| format!("challenge task failed: {err}"))?
            .map_err(|err| err.to_string())?;

        let delay = challenge
            .delay
            .min(MAX_CHALLENGE_DELAY)
            .min(ctx.remaining() / 2);
        log::debug!("{ANTI_BOT}: waiting {}ms before submitting challenge", delay.as_millis());
        tokio::time::sleep(delay).await;

        http.fetch(challenge.submission(answer, &page.url, user_agent))
            .await
            .map_err(|err| err.to_string())
    }

    async fn warm_up(
        &self,
        http: &dyn PageFetcher,
        url: &Url,
        user_agent: &str,
    ) -> Result<FetchedPage, FetchError> {
        let origin = iuam::origin_from_url(url);
        if let Ok(root) = Url::parse(&origin) {
            let request = FetchRequest::get(root).with_headers(profile::browser_headers(user_agent));
            if let Err(err) = http.fetch(request).await {
                log::debug!("{ANTI_BOT}: warm-up visit to {origin} failed: {err}");
            }
        }

        let mut headers =
            profile::browser_headers_with_referer(user_agent, profile::random_search_referer());
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(ORIGIN, value);
        }
        http.fetch(FetchRequest::get(url.clone()).with_headers(headers)).await
    }
}

#[async_trait]
impl Strategy for AntiBotStrategy {
    fn name(&self) -> &'static str {
        ANTI_BOT
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome {
        let session = match self.fetcher.session() {
            Ok(session) => session,
            Err(err) => return outcome_for_fetch_error(ANTI_BOT, &err),
        };
        let http: &dyn PageFetcher = session.as_deref().unwrap_or(self.fetcher.as_ref());
        let user_agent = profile::random_user_agent();

        let request = FetchRequest::get(url.clone()).with_headers(profile::browser_headers(user_agent));
        let first = match http.fetch(request).await {
            Ok(page) => page,
            Err(err) => return outcome_for_fetch_error(ANTI_BOT, &err),
        };

        let Some(detection) = detect(&first) else {
            if first.is_success() {
                return match link_from_clear_page(&first, url) {
                    Some(target) => found(ctx, &target, "direct"),
                    None => StrategyOutcome::not_applicable("no anti-bot protection detected"),
                };
            }
            return self.after_warm_up(http, url, user_agent, ctx, None).await;
        };

        log::debug!(
            "{ANTI_BOT}: {} challenge on {url} ({}, {} indicators)",
            detection.kind.as_str(),
            detection.signature,
            detection.matched
        );

        let mut note = None;
        if detection.kind == ChallengeKind::Iuam {
            match self.solve_iuam(http, &first, user_agent, ctx).await {
                Ok(page) => {
                    if let Some(target) = cleared(&page, url) {
                        return found(ctx, &target, "iuam");
                    }
                    note = Some("iuam submission did not clear the challenge".to_string());
                }
                Err(reason) => {
                    log::debug!("{ANTI_BOT}: iuam solving failed on {url}: {reason}");
                    note = Some(reason);
                }
            }
        }

        self.after_warm_up(http, url, user_agent, ctx, Some((detection, note)))
            .await
    }
}

impl AntiBotStrategy {
    async fn after_warm_up(
        &self,
        http: &dyn PageFetcher,
        url: &Url,
        user_agent: &str,
        ctx: &StrategyContext,
        challenge: Option<(Detection, Option<String>)>,
    ) -> StrategyOutcome {
        match self.warm_up(http, url, user_agent).await {
            Ok(page) => {
                if let Some(target) = cleared(&page, url) {
                    return found(ctx, &target, "session_warm_up");
                }
            }
            Err(err) if err.is_fatal() => return outcome_for_fetch_error(ANTI_BOT, &err),
            Err(err) => log::debug!("{ANTI_BOT}: warm-up request failed: {err}"),
        }

        match challenge {
            Some((detection, Some(note))) if self.interpreter.is_none() && detection.kind == ChallengeKind::Iuam => {
                StrategyOutcome::not_applicable(note)
            }
            Some((detection, note)) => StrategyOutcome::failed(match note {
                Some(note) => format!("{} challenge not cleared: {note}", detection.kind.as_str()),
                None => format!("{} challenge not cleared", detection.kind.as_str()),
            }),
            None => StrategyOutcome::failed("site kept refusing the session"),
        }
    }
}

fn found(ctx: &StrategyContext, target: &Url, technique: &str) -> StrategyOutcome {
    log::info!("{ANTI_BOT}: found {target} via {technique}");
    ctx.resolved(target, ANTI_BOT)
}

/// Destination behind a page that is no longer a challenge.
fn cleared(page: &FetchedPage, origin: &Url) -> Option<Url> {
    if !page.is_success() || detect(page).is_some() {
        return None;
    }
    link_from_clear_page(page, origin)
}

fn link_from_clear_page(page: &FetchedPage, origin: &Url) -> Option<Url> {
    let document = Html::parse_document(&page.body);
    find_direct_link(&document, &page.url, origin)
        .or_else(|| find_external_anchor(&document, &page.url, origin))
        .or_else(|| is_destination(&page.url, origin, origin).then(|| page.url.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::header::REFERER;

    use super::*;
    use crate::external_deps::interpreters::{InterpreterError, InterpreterResult};
    use crate::strategies::testing::{CannedPage, StubFetcher};

    const ORIGIN_URL: &str = "https://short.ly/abc";
    const CLEARED: &str = r#"<html><body><a class="btn-download" href="https://files.example/1">Download</a></body></html>"#;

    struct StubInterpreter {
        calls: AtomicUsize,
    }

    impl JavascriptInterpreter for StubInterpreter {
        fn solve_challenge(&self, _page_html: &str, host: &str) -> InterpreterResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(host, "short.ly");
            Ok("15.0000000000".into())
        }

        fn capture_navigation(&self, _scripts: &[String], _page_url: &str) -> InterpreterResult<Option<String>> {
            Err(InterpreterError::Other("unused".into()))
        }
    }

    fn origin() -> Url {
        Url::parse(ORIGIN_URL).unwrap()
    }

    fn challenge() -> CannedPage {
        CannedPage::ok(iuam::fixtures::CHALLENGE_PAGE)
            .with_status(503)
            .with_header("server", "cloudflare")
    }

    async fn run(strategy: AntiBotStrategy) -> StrategyOutcome {
        strategy
            .attempt(&origin(), &StrategyContext::new(Duration::from_secs(45)))
            .await
    }

    #[tokio::test]
    async fn solves_iuam_and_extracts_link() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .page(ORIGIN_URL, challenge())
                .page("https://short.ly/abc?__cf_chl_f_tk=tok123", CannedPage::ok(CLEARED)),
        );
        let interpreter = Arc::new(StubInterpreter {
            calls: AtomicUsize::new(0),
        });
        let outcome = run(AntiBotStrategy::new(fetcher.clone()).with_interpreter(interpreter.clone())).await;

        match outcome {
            StrategyOutcome::Resolved { final_url, method, .. } => {
                assert_eq!(final_url, "https://files.example/1");
                assert_eq!(method, ANTI_BOT);
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        assert_eq!(interpreter.calls.load(Ordering::SeqCst), 1);
        let requests = fetcher.requests.lock().unwrap();
        let submission = &requests[1];
        assert_eq!(submission.form.as_ref().unwrap()[0].1, "15.0000000000");
    }

    #[tokio::test]
    async fn warms_up_the_session_when_blocked() {
        let blocked = CannedPage::ok("<p>Checking your browser before accessing</p>")
            .with_status(403)
            .with_header("server", "cloudflare");
        let fetcher = Arc::new(
            StubFetcher::new().queued(ORIGIN_URL, vec![blocked, CannedPage::ok(CLEARED)]),
        );
        let outcome = run(AntiBotStrategy::new(fetcher.clone())).await;

        assert!(outcome.is_resolved());
        let requests = fetcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].url.as_str(), "https://short.ly/");
        let retry = &requests[2];
        let referer = retry.headers.get(REFERER).unwrap().to_str().unwrap();
        assert!(profile::SEARCH_REFERERS.contains(&referer));
        assert_eq!(retry.headers.get(ORIGIN).unwrap(), "https://short.ly");
    }

    #[tokio::test]
    async fn iuam_without_interpreter_is_not_applicable() {
        let fetcher = Arc::new(StubFetcher::new().page(ORIGIN_URL, challenge()));
        let outcome = run(AntiBotStrategy::new(fetcher)).await;
        assert!(matches!(outcome, StrategyOutcome::NotApplicable { .. }));
    }

    #[tokio::test]
    async fn unprotected_pages_are_not_applicable() {
        let fetcher = Arc::new(
            StubFetcher::new().page(ORIGIN_URL, CannedPage::ok("<p>hello</p>").with_header("server", "nginx")),
        );
        let outcome = run(AntiBotStrategy::new(fetcher)).await;
        assert_eq!(outcome, StrategyOutcome::not_applicable("no anti-bot protection detected"));
    }

    #[tokio::test]
    async fn persistent_challenge_fails() {
        let fetcher = Arc::new(StubFetcher::new().page(
            ORIGIN_URL,
            CannedPage::ok(r#"<div class="cf-turnstile"></div>"#)
                .with_status(403)
                .with_header("server", "cloudflare"),
        ));
        let outcome = run(AntiBotStrategy::new(fetcher)).await;
        assert_eq!(outcome, StrategyOutcome::failed("turnstile challenge not cleared"));
    }
}
