//! Script-driven redirects.
//!
//! Techniques, in order: literal `location` assignments in inline scripts,
//! sandboxed execution of the page scripts, static deobfuscation of encoded
//! strings, timer redirects, URL-bearing variables and JSON blobs, and AJAX
//! endpoints that hand out the link.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use url::Url;

use super::extract::{decode_base64_url, find_js_redirect, find_urls, is_destination, resolve_href};
use super::{JAVASCRIPT, Strategy, StrategyContext, fetch_document};
use crate::core::{FetchRequest, PageFetcher, StrategyOutcome, profile};
use crate::external_deps::interpreters::JavascriptInterpreter;

/// AJAX endpoints probed per page.
const MAX_AJAX_ENDPOINTS: usize = 3;

/// JSON keys that carry the destination in AJAX answers and inline objects.
const LINK_KEYS: &[&str] = &["url", "link", "redirect", "href", "target", "download"];

static INLINE_SCRIPT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script:not([src])").unwrap());

fn pattern(source: &str) -> Regex {
    RegexBuilder::new(source)
        .dot_matches_new_line(true)
        .build()
        .unwrap()
}

static CONCAT_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(r#"(?:"[^"\n]*"|'[^'\n]*')(?:\s*\+\s*(?:"[^"\n]*"|'[^'\n]*'))+"#)
});
static QUOTED_RE: Lazy<Regex> = Lazy::new(|| pattern(r#""([^"\n]*)"|'([^'\n]*)'"#));
static CHAR_CODE_RE: Lazy<Regex> = Lazy::new(|| pattern(r"String\.fromCharCode\(([^)]+)\)"));
static ATOB_RE: Lazy<Regex> = Lazy::new(|| pattern(r#"atob\(\s*["']([A-Za-z0-9+/=_-]+)["']\s*\)"#));
static URI_COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| pattern(r#"decodeURI(?:Component)?\(\s*["']([^"']+)["']\s*\)"#));
static ESCAPED_RE: Lazy<Regex> =
    Lazy::new(|| pattern(r#"["']((?:\\x[0-9a-fA-F]{2}|\\u[0-9a-fA-F]{4})+)["']"#));

static TIMER_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"setTimeout\s*\(\s*(?:function\s*\(\s*\)|\(\s*\)\s*=>)\s*\{[^}]*\}\s*,\s*\d+\s*\)",
        r#"setTimeout\s*\(\s*["'][^"']+["']\s*,\s*\d+\s*\)"#,
        r"setInterval\s*\([^)]*location[^)]*\)",
    ]
    .iter()
    .map(|source| pattern(source))
    .collect()
});
static COUNTDOWN_RE: Lazy<Regex> = Lazy::new(|| pattern(r"(?:var|let)\s+\w+\s*=\s*\d+\s*;"));
static REVEAL_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(r#"document\.getElementById\s*\(\s*["'][^"']+["']\s*\)\.\w+\s*=\s*["']([^"']+)["']"#)
});

static VARIABLE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"(?:var|let|const)\s+(?:url|link|redirect|target|href|dest(?:ination)?|download_?url|final_?url)\s*=\s*["']([^"']+)["']"#,
    )
    .case_insensitive(true)
    .build()
    .unwrap()
});
static JSON_OBJECT_RE: Lazy<Regex> =
    Lazy::new(|| pattern(r"(?:var|let|const)\s+\w+\s*=\s*(\{[^;]+\})\s*;"));

static AJAX_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"fetch\s*\(\s*["']([^"']+)["']"#,
        r#"\.ajax\s*\(\s*\{[^}]*url\s*:\s*["']([^"']+)["']"#,
        r#"\$\.(?:get|post|getJSON)\s*\(\s*["']([^"']+)["']"#,
        r#"\.open\s*\(\s*["']\w+["']\s*,\s*["']([^"']+)["']"#,
    ]
    .iter()
    .map(|source| pattern(source))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Technique {
    InlineScript,
    Sandbox,
    Deobfuscation,
    Timer,
    Variable,
    Ajax,
}

impl Technique {
    fn as_str(self) -> &'static str {
        match self {
            Technique::InlineScript => "inline_script",
            Technique::Sandbox => "sandbox_navigation",
            Technique::Deobfuscation => "deobfuscation",
            Technique::Timer => "timer_bypass",
            Technique::Variable => "variable_extraction",
            Technique::Ajax => "ajax_bypass",
        }
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct JavascriptStrategy {
    fetcher: Arc<dyn PageFetcher>,
    interpreter: Option<Arc<dyn JavascriptInterpreter>>,
    timeout: Duration,
}

impl JavascriptStrategy {
    /// Static analysis only; no script is executed.
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

    async fn sandbox(&self, scripts: &[String], page: &Url, origin: &Url) -> Option<Url> {
        let interpreter = self.interpreter.clone()?;
        let scripts = scripts.to_vec();
        let page_url = page.to_string();

        let captured = tokio::task::spawn_blocking(move || {
            interpreter.capture_navigation(&scripts, &page_url)
        })
        .await;

        match captured {
            Ok(Ok(Some(target))) => resolve_href(page, &target).filter(|url| is_destination(url, page, origin)),
            Ok(Ok(None)) => None,
            Ok(Err(err)) => {
                log::debug!("{JAVASCRIPT}: sandbox failed on {page}: {err}");
                None
            }
            Err(err) => {
                log::error!("{JAVASCRIPT}: sandbox task failed: {err}");
                None
            }
        }
    }

    /// Evaluate string concatenations with the interpreter when one is set,
    /// otherwise join the literal pieces.
    async fn concatenated(&self, text: &str, page: &Url, origin: &Url) -> Option<Url> {
        let chains: Vec<String> = CONCAT_RE
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .filter(|chain| chain.contains("http") || chain.contains("//"))
            .collect();
        if chains.is_empty() {
            return None;
        }

        let joined: Vec<String> = match self.interpreter.clone() {
            Some(interpreter) => {
                let page_url = page.to_string();
                let pieces = chains.clone();
                tokio::task::spawn_blocking(move || {
                    pieces
                        .iter()
                        .map(|chain| {
                            interpreter
                                .evaluate(chain, &page_url)
                                .unwrap_or_else(|_| join_literals(chain))
                        })
                        .collect()
                })
                .await
                .unwrap_or_else(|_| chains.iter().map(|chain| join_literals(chain)).collect())
            }
            None => chains.iter().map(|chain| join_literals(chain)).collect(),
        };

        joined
            .iter()
            .filter_map(|candidate| resolve_href(page, candidate))
            .find(|url| is_destination(url, page, origin))
    }

    async fn locate(
        &self,
        body: &str,
        scripts: &[String],
        page: &Url,
        origin: &Url,
    ) -> Option<(Url, Technique)> {
        if let Some(target) = scripts.iter().find_map(|script| find_js_redirect(script, page, origin)) {
            return Some((target, Technique::InlineScript));
        }
        if let Some(target) = self.sandbox(scripts, page, origin).await {
            return Some((target, Technique::Sandbox));
        }

        let source = scripts.join("\n");
        if let Some(target) = self.concatenated(&source, page, origin).await {
            return Some((target, Technique::Deobfuscation));
        }
        if let Some(target) = decode_obfuscated(body, page, origin) {
            return Some((target, Technique::Deobfuscation));
        }
        if let Some(target) = timer_redirect(body, page, origin) {
            return Some((target, Technique::Timer));
        }
        if let Some(target) = variable_link(&source, page, origin) {
            return Some((target, Technique::Variable));
        }
        self.ajax(&source, page, origin)
            .await
            .map(|target| (target, Technique::Ajax))
    }

    async fn ajax(&self, text: &str, page: &Url, origin: &Url) -> Option<Url> {
        let mut endpoints: Vec<Url> = Vec::new();
        for re in AJAX_RES.iter() {
            for caps in re.captures_iter(text) {
                if let Some(endpoint) = caps.get(1).and_then(|m| resolve_href(page, m.as_str()))
                    && !endpoints.contains(&endpoint)
                {
                    endpoints.push(endpoint);
                }
            }
        }

        for endpoint in endpoints.into_iter().take(MAX_AJAX_ENDPOINTS) {
            let headers = profile::ajax_headers(profile::random_user_agent(), page.as_str());
            let response = match self.fetcher.fetch(FetchRequest::get(endpoint.clone()).with_headers(headers)).await {
                Ok(response) if response.is_success() => response,
                Ok(response) => {
                    log::debug!("{JAVASCRIPT}: ajax endpoint {endpoint} answered {}", response.status);
                    continue;
                }
                Err(err) => {
                    log::debug!("{JAVASCRIPT}: ajax endpoint {endpoint} failed: {err}");
                    continue;
                }
            };

            let found = match serde_json::from_str::<serde_json::Value>(&response.body) {
                Ok(value) => link_from_json(&value, page, origin),
                Err(_) => find_urls(&response.body).find(|url| is_destination(url, page, origin)),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

#[async_trait]
impl Strategy for JavascriptStrategy {
    fn name(&self) -> &'static str {
        JAVASCRIPT
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome {
        let page = match fetch_document(JAVASCRIPT, self.fetcher.as_ref(), FetchRequest::get(url.clone())).await {
            Ok(page) => page,
            Err(outcome) => return outcome,
        };

        let scripts = inline_scripts(&page.body);
        if scripts.is_empty() {
            return StrategyOutcome::not_applicable("page has no inline scripts");
        }

        let found = self.locate(&page.body, &scripts, &page.url, url).await;
        match found {
            Some((target, technique)) => {
                log::info!("{JAVASCRIPT}: found {target} via {}", technique.as_str());
                ctx.resolved(&target, JAVASCRIPT)
            }
            None => StrategyOutcome::failed("no javascript redirect found"),
        }
    }
}

fn inline_scripts(body: &str) -> Vec<String> {
    let document = Html::parse_document(body);
    document
        .select(&INLINE_SCRIPT_SELECTOR)
        .map(|script| script.text().collect::<String>())
        .filter(|source| !source.trim().is_empty())
        .collect()
}

fn join_literals(chain: &str) -> String {
    QUOTED_RE
        .captures_iter(chain)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str())
        .collect()
}

fn candidate(text: &str, page: &Url, origin: &Url) -> Option<Url> {
    let text = text.trim();
    if !text.starts_with("http://") && !text.starts_with("https://") {
        return None;
    }
    Url::parse(text).ok().filter(|url| is_destination(url, page, origin))
}

fn char_codes(list: &str) -> Option<String> {
    list.split(',')
        .map(|code| {
            let code = code.trim();
            let value = match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse::<u32>().ok()?,
            };
            char::from_u32(value)
        })
        .collect()
}

/// Decode `\xNN` and `\uNNNN` escapes.
fn unescape(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len() / 4);
    let mut rest = escaped;
    while let Some(stripped) = rest.strip_prefix('\\') {
        let (width, tail) = match stripped.chars().next()? {
            'x' => (2, &stripped[1..]),
            'u' => (4, &stripped[1..]),
            _ => return None,
        };
        let digits = tail.get(..width)?;
        out.push(char::from_u32(u32::from_str_radix(digits, 16).ok()?)?);
        rest = &tail[width..];
    }
    rest.is_empty().then_some(out)
}

fn decode_obfuscated(text: &str, page: &Url, origin: &Url) -> Option<Url> {
    CHAR_CODE_RE
        .captures_iter(text)
        .filter_map(|caps| char_codes(&caps[1]))
        .find_map(|decoded| candidate(&decoded, page, origin))
        .or_else(|| {
            ATOB_RE
                .captures_iter(text)
                .filter_map(|caps| decode_base64_url(&caps[1]))
                .find(|url| is_destination(url, page, origin))
        })
        .or_else(|| {
            URI_COMPONENT_RE
                .captures_iter(text)
                .filter_map(|caps| urlencoding::decode(&caps[1]).ok().map(|decoded| decoded.into_owned()))
                .find_map(|decoded| candidate(&decoded, page, origin))
        })
        .or_else(|| {
            ESCAPED_RE
                .captures_iter(text)
                .filter_map(|caps| unescape(&caps[1]))
                .find_map(|decoded| candidate(&decoded, page, origin))
        })
}

fn timer_redirect(text: &str, page: &Url, origin: &Url) -> Option<Url> {
    let timed = TIMER_RES.iter().find_map(|re| {
        re.find_iter(text)
            .find_map(|m| find_urls(m.as_str()).find(|url| is_destination(url, page, origin)))
    });
    if timed.is_some() {
        return timed;
    }

    // Countdown pages that write the link into an element when the timer ends.
    if !COUNTDOWN_RE.is_match(text) {
        return None;
    }
    REVEAL_RE
        .captures_iter(text)
        .filter_map(|caps| resolve_href(page, &caps[1]))
        .find(|url| is_destination(url, page, origin))
}

fn link_from_json(value: &serde_json::Value, page: &Url, origin: &Url) -> Option<Url> {
    let object = value.as_object()?;
    LINK_KEYS
        .iter()
        .filter_map(|key| object.get(*key)?.as_str())
        .filter_map(|raw| resolve_href(page, raw))
        .find(|url| is_destination(url, page, origin))
        .or_else(|| {
            // One level of nesting (`{"data": {"url": ..}}`).
            object
                .values()
                .filter(|nested| nested.is_object())
                .find_map(|nested| link_from_json(nested, page, origin))
        })
}

fn variable_link(text: &str, page: &Url, origin: &Url) -> Option<Url> {
    VARIABLE_RE
        .captures_iter(text)
        .filter_map(|caps| resolve_href(page, &caps[1]))
        .find(|url| is_destination(url, page, origin))
        .or_else(|| {
            JSON_OBJECT_RE
                .captures_iter(text)
                .filter_map(|caps| serde_json::from_str::<serde_json::Value>(&caps[1]).ok())
                .find_map(|value| link_from_json(&value, page, origin))
        })
}
