//! Plain HTTP + HTML extraction.
//!
//! Covers shorteners that give the destination away without running any
//! script: server redirects, meta refresh, `og:url`, a form to submit,
//! download anchors, base64 payloads or a literal `location` assignment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::extract::{
    find_base64_url, find_direct_link, find_external_anchor, find_js_redirect, is_destination,
    resolve_href, same_site,
};
use super::{STATIC_HTML, Strategy, StrategyContext, outcome_for_fetch_error};
use crate::core::{FetchRequest, PageFetcher, StrategyOutcome, profile};

/// Forms submitted per page before giving up.
const MAX_FORMS: usize = 3;

static META_REFRESH_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[http-equiv]").unwrap());
static OG_URL_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:url"]"#).unwrap());
static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form").unwrap());
static FIELD_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[name], textarea[name], select[name]").unwrap());
static OPTION_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("option").unwrap());

static REFRESH_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\s*=\s*["']?([^"';]+)"#).unwrap());

/// Which part of the page gave the destination away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technique {
    HttpRedirect,
    MetaRefresh,
    OpenGraphUrl,
    FormSubmission,
    DirectLink,
    ExternalLink,
    Base64,
    ScriptRedirect,
}

impl Technique {
    pub fn as_str(self) -> &'static str {
        match self {
            Technique::HttpRedirect => "http_redirect",
            Technique::MetaRefresh => "meta_refresh",
            Technique::OpenGraphUrl => "og_url",
            Technique::FormSubmission => "form_submission",
            Technique::DirectLink => "direct_link",
            Technique::ExternalLink => "external_link",
            Technique::Base64 => "base64_decode",
            Technique::ScriptRedirect => "js_redirect",
        }
    }
}

/// Form ready to be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSpec {
    pub method: Method,
    pub action: Url,
    pub fields: Vec<(String, String)>,
}

impl FormSpec {
    fn into_request(self, referer: &Url) -> FetchRequest {
        let headers =
            profile::browser_headers_with_referer(profile::random_user_agent(), referer.as_str());
        if self.method == Method::POST {
            FetchRequest::submit_form(Method::POST, self.action, self.fields).with_headers(headers)
        } else {
            let mut action = self.action;
            if !self.fields.is_empty() {
                action.query_pairs_mut().extend_pairs(self.fields.iter());
            }
            FetchRequest::get(action).with_headers(headers)
        }
    }
}

/// Everything the synchronous scan found. The DOM itself never crosses an
/// await point.
#[derive(Debug, Default)]
struct PageScan {
    /// Meta refresh or `og:url`; checked before forms.
    declared: Option<(Url, Technique)>,
    forms: Vec<FormSpec>,
    /// Links found in the body; checked after forms.
    embedded: Option<(Url, Technique)>,
}

/// Attempt budget unless overridden with [`StaticHtmlStrategy::with_timeout`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct StaticHtmlStrategy {
    fetcher: Arc<dyn PageFetcher>,
    timeout: Duration,
}

impl StaticHtmlStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn submit_forms(&self, forms: Vec<FormSpec>, page: &Url, origin: &Url) -> Option<Url> {
        for form in forms.into_iter().take(MAX_FORMS) {
            let action = form.action.clone();
            let response = match self.fetcher.fetch(form.into_request(page)).await {
                Ok(response) => response,
                Err(err) => {
                    log::debug!("Form submission to {action} failed: {err}");
                    continue;
                }
            };

            if !same_site(&response.url, origin) && is_destination(&response.url, page, origin) {
                return Some(response.url);
            }
            if response.is_success()
                && let Some(url) = scan_followup(&response.body, &response.url, origin)
            {
                return Some(url);
            }
        }
        None
    }
}

#[async_trait]
impl Strategy for StaticHtmlStrategy {
    fn name(&self) -> &'static str {
        STATIC_HTML
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome {
        let page = match self.fetcher.fetch(FetchRequest::get(url.clone())).await {
            Ok(page) => page,
            Err(err) => return outcome_for_fetch_error(STATIC_HTML, &err),
        };

        if !same_site(&page.url, url) {
            log::info!("{STATIC_HTML}: {url} redirected to {}", page.url);
            return resolved(ctx, &page.url, Technique::HttpRedirect);
        }
        if !page.is_success() {
            return StrategyOutcome::failed(format!("http status {}", page.status));
        }

        let scan = scan_page(&page.body, &page.url, url);
        if let Some((target, technique)) = scan.declared {
            return resolved(ctx, &target, technique);
        }
        if let Some(target) = self.submit_forms(scan.forms, &page.url, url).await {
            return resolved(ctx, &target, Technique::FormSubmission);
        }
        if let Some((target, technique)) = scan.embedded {
            return resolved(ctx, &target, technique);
        }

        StrategyOutcome::failed("no link found in page")
    }
}

fn resolved(ctx: &StrategyContext, target: &Url, technique: Technique) -> StrategyOutcome {
    log::info!("{STATIC_HTML}: found {target} via {}", technique.as_str());
    ctx.resolved(target, STATIC_HTML)
}

fn scan_page(body: &str, page: &Url, origin: &Url) -> PageScan {
    let document = Html::parse_document(body);

    let declared = meta_refresh(&document, page, origin)
        .map(|url| (url, Technique::MetaRefresh))
        .or_else(|| open_graph_url(&document, page, origin).map(|url| (url, Technique::OpenGraphUrl)));

    let forms = document
        .select(&FORM_SELECTOR)
        .filter_map(|form| form_spec(form, page))
        .collect();

    let embedded = find_direct_link(&document, page, origin)
        .map(|url| (url, Technique::DirectLink))
        .or_else(|| find_external_anchor(&document, page, origin).map(|url| (url, Technique::ExternalLink)))
        .or_else(|| {
            find_base64_url(body)
                .filter(|url| is_destination(url, page, origin))
                .map(|url| (url, Technique::Base64))
        })
        .or_else(|| find_js_redirect(body, page, origin).map(|url| (url, Technique::ScriptRedirect)));

    PageScan {
        declared,
        forms,
        embedded,
    }
}

/// Narrower scan for pages returned by a form submission.
fn scan_followup(body: &str, page: &Url, origin: &Url) -> Option<Url> {
    let document = Html::parse_document(body);
    meta_refresh(&document, page, origin)
        .or_else(|| find_direct_link(&document, page, origin))
        .or_else(|| find_js_redirect(body, page, origin))
}

fn meta_refresh(document: &Html, page: &Url, origin: &Url) -> Option<Url> {
    document
        .select(&META_REFRESH_SELECTOR)
        .filter(|meta| {
            meta.value()
                .attr("http-equiv")
                .is_some_and(|equiv| equiv.eq_ignore_ascii_case("refresh"))
        })
        .filter_map(|meta| meta.value().attr("content"))
        .filter_map(|content| REFRESH_URL_RE.captures(content))
        .filter_map(|caps| resolve_href(page, caps.get(1)?.as_str()))
        .find(|url| is_destination(url, page, origin))
}

fn open_graph_url(document: &Html, page: &Url, origin: &Url) -> Option<Url> {
    document
        .select(&OG_URL_SELECTOR)
        .filter_map(|meta| meta.value().attr("content"))
        .filter_map(|content| resolve_href(page, content))
        .find(|url| !same_site(url, origin) && is_destination(url, page, origin))
}

fn form_spec(form: ElementRef<'_>, page: &Url) -> Option<FormSpec> {
    let action = match form.value().attr("action").map(str::trim) {
        Some(action) if !action.is_empty() => resolve_href(page, action)?,
        _ => page.clone(),
    };
    let method = match form.value().attr("method") {
        Some(method) if method.eq_ignore_ascii_case("post") => Method::POST,
        _ => Method::GET,
    };

    let fields = form
        .select(&FIELD_SELECTOR)
        .filter_map(|field| {
            let element = field.value();
            let name = element.attr("name")?.to_string();
            let value = match element.name() {
                "textarea" => field.text().collect::<String>(),
                "select" => field
                    .select(&OPTION_SELECTOR)
                    .find(|option| option.value().attr("selected").is_some())
                    .or_else(|| field.select(&OPTION_SELECTOR).next())
                    .and_then(|option| option.value().attr("value"))
                    .unwrap_or_default()
                    .to_string(),
                _ => {
                    let kind = element.attr("type").unwrap_or("text");
                    if (kind.eq_ignore_ascii_case("checkbox") || kind.eq_ignore_ascii_case("radio"))
                        && element.attr("checked").is_none()
                    {
                        return None;
                    }
                    element.attr("value").unwrap_or_default().to_string()
                }
            };
            Some((name, value))
        })
        .collect();

    Some(FormSpec {
        method,
        action,
        fields,
    })
}
