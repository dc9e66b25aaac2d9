//! Link extraction helpers shared by the strategies.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use url::Url;

use crate::core::normalize_url;

/// Anchors that usually carry the payload on download/interstitial pages.
const DIRECT_LINK_SELECTORS: &[&str] = &[
    r#"a[href*="download"]"#,
    r#"a[href*="direct"]"#,
    "a.btn-download",
    "a.download-button",
    "a.download",
    "a#download",
    ".download-link a",
    r#"a[href*="drive.google.com"]"#,
    r#"a[href*="mega.nz"]"#,
    r#"a[href*="mediafire.com"]"#,
    r#"a[href$=".mp4"]"#,
    r#"a[href$=".mkv"]"#,
    r#"a[href$=".zip"]"#,
    r#"a[href$=".rar"]"#,
    r#"a[href$=".pdf"]"#,
];

/// Attributes scripts use to stash the target on arbitrary elements.
pub const DATA_LINK_ATTRIBUTES: &[&str] = &["data-url", "data-link", "data-href", "data-download"];

static DIRECT_LINK_SELECTOR_LIST: Lazy<Vec<Selector>> = Lazy::new(|| {
    DIRECT_LINK_SELECTORS
        .iter()
        .map(|raw| Selector::parse(raw).unwrap())
        .collect()
});

static DATA_LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-url], [data-link], [data-href], [data-download]").unwrap());

static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>()\\`]+"#).unwrap());

static BASE64_CANDIDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/_-]{20,}={0,2}").unwrap());

/// Literal navigation targets in script text.
static JS_REDIRECT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"window\.location\.href\s*=\s*["']([^"']+)["']"#,
        r#"window\.location\s*=\s*["']([^"']+)["']"#,
        r#"document\.location(?:\.href)?\s*=\s*["']([^"']+)["']"#,
        r#"location\.replace\(\s*["']([^"']+)["']\s*\)"#,
        r#"location\.assign\(\s*["']([^"']+)["']\s*\)"#,
        r#"(?:top|self|parent)\.location(?:\.href)?\s*=\s*["']([^"']+)["']"#,
        r#"(?:^|[^.\w])location\.href\s*=\s*["']([^"']+)["']"#,
        r#"window\.open\(\s*["']([^"']+)["']"#,
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .unwrap()
    })
    .collect()
});

/// Resolve an attribute value against the page URL, keeping only absolute
/// http(s) targets.
pub fn resolve_href(base: &Url, raw: &str) -> Option<Url> {
    let decoded = html_escape::decode_html_entities(raw);
    let href = decoded.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:", "about:", "blob:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let url = base.join(href).ok()?;
    let has_host = url.host_str().is_some_and(|host| !host.is_empty());
    (matches!(url.scheme(), "http" | "https") && has_host).then_some(url)
}

fn bare_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| host.trim_start_matches("www.").to_ascii_lowercase())
}

/// Same host, ignoring a leading `www.`.
pub fn same_site(a: &Url, b: &Url) -> bool {
    bare_host(a) == bare_host(b)
}

/// A candidate counts as a destination only if it leads somewhere other than
/// the link being resolved or the page currently inspected.
pub fn is_destination(candidate: &Url, page: &Url, origin: &Url) -> bool {
    let key = normalize_url(candidate);
    key != normalize_url(page) && key != normalize_url(origin)
}

/// Decode a base64 (standard or URL-safe, padded or not) payload that hides
/// an absolute http(s) link.
pub fn decode_base64_url(payload: &str) -> Option<Url> {
    let payload = payload.trim();
    if payload.len() < 12 {
        return None;
    }

    let bytes = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(payload).ok())?;
    let text = String::from_utf8(bytes).ok()?;
    let text = text.trim();
    if !text.starts_with("http://") && !text.starts_with("https://") {
        return None;
    }
    let url = Url::parse(text).ok()?;
    url.host_str().is_some().then_some(url)
}

/// Scan free text for base64 blobs that decode to a link.
pub fn find_base64_url(text: &str) -> Option<Url> {
    BASE64_CANDIDATE_RE
        .find_iter(text)
        .find_map(|m| decode_base64_url(m.as_str()))
}

/// Absolute http(s) URLs appearing verbatim in `text`.
pub fn find_urls(text: &str) -> impl Iterator<Item = Url> + '_ {
    URL_RE.find_iter(text).filter_map(|m| {
        let raw = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        Url::parse(raw).ok()
    })
}

/// First literal navigation (`location.href = "..."` and friends) in script
/// or page text.
pub fn find_js_redirect(text: &str, base: &Url, origin: &Url) -> Option<Url> {
    JS_REDIRECT_RES.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let target = caps.get(1)?.as_str();
            if target.starts_with('$') || target.starts_with('{') || target.contains("${") {
                return None;
            }
            resolve_href(base, target).filter(|url| is_destination(url, base, origin))
        })
    })
}

/// Download-style anchors and `data-*` link holders.
pub fn find_direct_link(document: &Html, base: &Url, origin: &Url) -> Option<Url> {
    for selector in DIRECT_LINK_SELECTOR_LIST.iter() {
        for element in document.select(selector) {
            if let Some(url) = element
                .value()
                .attr("href")
                .and_then(|href| resolve_href(base, href))
                .filter(|url| is_destination(url, base, origin))
            {
                return Some(url);
            }
        }
    }

    for element in document.select(&DATA_LINK_SELECTOR) {
        for attribute in DATA_LINK_ATTRIBUTES {
            if let Some(url) = element
                .value()
                .attr(attribute)
                .and_then(|value| resolve_href(base, value))
                .filter(|url| is_destination(url, base, origin))
            {
                return Some(url);
            }
        }
    }

    None
}

/// First anchor pointing to another site.
pub fn find_external_anchor(document: &Html, base: &Url, origin: &Url) -> Option<Url> {
    document
        .select(&ANCHOR_SELECTOR)
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| resolve_href(base, href))
        .find(|url| !same_site(url, base) && !same_site(url, origin))
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
