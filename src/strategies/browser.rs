//! Headless browser automation.
//!
//! Used when the page only yields its link after real script execution or
//! user interaction. Each attempt opens its own session through the
//! configured [`BrowserDriver`] and closes it before returning; a cancelled
//! attempt drops the session, which releases it as well.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::extract::{is_destination, resolve_href, same_site};
use super::{BROWSER, Strategy, StrategyContext};
use crate::core::StrategyOutcome;
use crate::external_deps::browser::{BrowserDriver, BrowserError, BrowserSession};

const COUNTDOWN_POLLS: u32 = 15;

/// Finds download-style anchors or `data-*` link holders, then anchors whose
/// text reads like a "continue" button.
const DIRECT_LINK_SCRIPT: &str = r#"/* direct-link */ (() => {
  const selectors = ['a[href*="download"]', 'a.download', 'a.btn-download', 'a#download',
    'a[href*="drive.google.com"]', 'a[href*="mega.nz"]', 'a[href*="mediafire.com"]',
    'a[href*=".mp4"]', 'a[href*=".mkv"]', 'a[href*=".zip"]',
    '[data-url]', '[data-link]', '[data-href]', '[data-download]'];
  for (const selector of selectors) {
    for (const el of document.querySelectorAll(selector)) {
      for (const attr of ['href', 'data-url', 'data-link', 'data-href', 'data-download']) {
        const value = el.getAttribute(attr);
        if (value && !value.startsWith('#') && !value.startsWith('javascript:')) {
          return new URL(value, location.href).href;
        }
      }
    }
  }
  const texts = ['download', 'get link', 'continue', 'go', 'proceed', 'click here'];
  for (const a of document.querySelectorAll('a[href]')) {
    const text = (a.textContent || '').trim().toLowerCase();
    if (texts.includes(text) && !a.getAttribute('href').startsWith('#')) {
      return a.href;
    }
  }
  return null;
})()"#;

const COUNTDOWN_SCRIPT: &str = r#"/* countdown */ !!document.querySelector(
  '#countdown, .countdown, [id*="timer"], [class*="timer"], [id*="countdown"], [class*="countdown"]')"#;

const GLOBALS_SCRIPT: &str = r#"/* globals */ (() => {
  for (const name of ['url', 'link', 'href', 'redirect', 'target', 'downloadUrl', 'fileUrl']) {
    const value = window[name];
    if (typeof value === 'string' && value.startsWith('http')) {
      return value;
    }
  }
  return null;
})()"#;

const OPENED_SCRIPT: &str = "/* opened */ window.__linkbypassOpened || null";

/// Clickables tried after a countdown: anything visible.
const ANY_VISIBLE: &[&str] = &["a", "button"];

const BUTTON_SELECTORS: &[&str] = &[
    "button",
    "a",
    ".btn",
    "button[type=\"submit\"]",
    "input[type=\"submit\"]",
];

const BUTTON_TEXTS: &[&str] = &["continue", "get link", "download"];

/// Script clicking the first visible element matching `selectors` (and, when
/// `texts` is not empty, whose text contains one of them). `window.open` is
/// hooked first so popups are recorded instead of opened.
fn click_script(selectors: &[&str], texts: &[&str]) -> String {
    let selectors = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into());
    let texts = serde_json::to_string(texts).unwrap_or_else(|_| "[]".into());
    format!(
        r#"/* click */ (() => {{
  if (!window.__linkbypassHooked) {{
    window.__linkbypassHooked = true;
    window.open = (target) => {{ window.__linkbypassOpened = new URL(target, location.href).href; return null; }};
  }}
  const texts = {texts};
  for (const selector of {selectors}) {{
    for (const el of document.querySelectorAll(selector)) {{
      const rect = el.getBoundingClientRect();
      const style = getComputedStyle(el);
      if (rect.width === 0 || rect.height === 0 || style.visibility === 'hidden' || style.display === 'none') continue;
      const text = (el.textContent || el.value || '').trim().toLowerCase();
      if (texts.length && !texts.some((t) => text.includes(t))) continue;
      el.click();
      return true;
    }}
  }}
  return false;
}})()"#
    )
}

/// Attempt budget unless overridden with [`BrowserStrategy::with_timeout`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct BrowserStrategy {
    driver: Option<Arc<dyn BrowserDriver>>,
    settle: Duration,
    poll_interval: Duration,
    timeout: Duration,
}

impl BrowserStrategy {
    pub fn new(driver: Option<Arc<dyn BrowserDriver>>) -> Self {
        Self {
            driver,
            settle: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Waits after navigation and between countdown polls.
    pub fn with_timing(mut self, settle: Duration, poll_interval: Duration) -> Self {
        self.settle = settle;
        self.poll_interval = poll_interval;
        self
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        url: &Url,
    ) -> Result<Option<(Url, &'static str)>, BrowserError> {
        session.navigate(url.as_str()).await?;
        tokio::time::sleep(self.settle).await;

        let page = current_url(session, url).await;

        if let Some(target) = direct_link(session, &page, url).await {
            return Ok(Some((target, "direct_link")));
        }
        if let Some(target) = self.wait_countdown(session, &page, url).await {
            return Ok(Some((target, "countdown_bypass")));
        }
        if let Some(target) = self.click_buttons(session, &page, url).await {
            return Ok(Some((target, "button_click")));
        }
        if let Some(target) = string_result(session, GLOBALS_SCRIPT)
            .await
            .and_then(|raw| candidate(&page, url, &raw))
        {
            return Ok(Some((target, "js_extraction")));
        }

        let landed = current_url(session, url).await;
        if !same_site(&landed, url) {
            return Ok(Some((landed, "redirect_follow")));
        }
        Ok(None)
    }

    async fn wait_countdown(&self, session: &dyn BrowserSession, page: &Url, origin: &Url) -> Option<Url> {
        let present = session
            .evaluate(COUNTDOWN_SCRIPT)
            .await
            .ok()
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        if !present {
            return None;
        }

        log::debug!("{BROWSER}: countdown on {page}, polling");
        for _ in 0..COUNTDOWN_POLLS {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(target) = direct_link(session, page, origin).await {
                return Some(target);
            }
            if let Some(target) = self.click_and_observe(session, page, origin, ANY_VISIBLE, &[]).await {
                return Some(target);
            }
        }
        None
    }

    async fn click_buttons(&self, session: &dyn BrowserSession, page: &Url, origin: &Url) -> Option<Url> {
        for &selector in BUTTON_SELECTORS {
            let texts: &[&str] = if matches!(selector, "button" | "a") {
                BUTTON_TEXTS
            } else {
                &[]
            };
            if let Some(target) = self.click_and_observe(session, page, origin, &[selector], texts).await {
                return Some(target);
            }
        }
        None
    }

    /// Click, wait, then look for a popup, a revealed link or a navigation.
    async fn click_and_observe(
        &self,
        session: &dyn BrowserSession,
        page: &Url,
        origin: &Url,
        selectors: &[&str],
        texts: &[&str],
    ) -> Option<Url> {
        let clicked = session
            .evaluate(&click_script(selectors, texts))
            .await
            .ok()
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        if !clicked {
            return None;
        }
        tokio::time::sleep(self.settle).await;

        if let Some(target) = string_result(session, OPENED_SCRIPT)
            .await
            .and_then(|raw| candidate(page, origin, &raw))
        {
            return Some(target);
        }
        if let Some(target) = direct_link(session, page, origin).await {
            return Some(target);
        }
        let now = current_url(session, page).await;
        is_destination(&now, page, origin).then_some(now)
    }
}

async fn current_url(session: &dyn BrowserSession, fallback: &Url) -> Url {
    session
        .current_url()
        .await
        .ok()
        .and_then(|raw| Url::parse(&raw).ok())
        .unwrap_or_else(|| fallback.clone())
}

async fn string_result(session: &dyn BrowserSession, script: &str) -> Option<String> {
    match session.evaluate(script).await {
        Ok(Value::String(value)) => Some(value),
        Ok(_) => None,
        Err(err) => {
            log::debug!("{BROWSER}: script failed: {err}");
            None
        }
    }
}

async fn direct_link(session: &dyn BrowserSession, page: &Url, origin: &Url) -> Option<Url> {
    let raw = string_result(session, DIRECT_LINK_SCRIPT).await?;
    candidate(page, origin, &raw)
}

fn candidate(page: &Url, origin: &Url, raw: &str) -> Option<Url> {
    resolve_href(page, raw).filter(|url| is_destination(url, page, origin))
}

#[async_trait]
impl Strategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        BROWSER
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome {
        let Some(driver) = &self.driver else {
            return StrategyOutcome::not_applicable("no browser driver configured");
        };

        let mut session = match driver.open_session().await {
            Ok(session) => session,
            Err(BrowserError::Unavailable(reason)) => {
                return StrategyOutcome::not_applicable(format!("browser unavailable: {reason}"));
            }
            Err(err) => return StrategyOutcome::failed(err.to_string()),
        };

        let driven = self.drive(session.as_mut(), url).await;
        if let Err(err) = session.close().await {
            log::debug!("{BROWSER}: closing {} session failed: {err}", driver.name());
        }

        match driven {
            Ok(Some((target, technique))) => {
                log::info!("{BROWSER}: found {target} via {technique}");
                ctx.resolved(&target, BROWSER)
            }
            Ok(None) => StrategyOutcome::failed("browser found no link"),
            Err(err) => StrategyOutcome::failed(err.to_string()),
        }
    }
}
