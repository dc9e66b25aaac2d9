//! Browser-like request profiles.
//!
//! Shorteners and anti-bot front ends serve a different page (or none at all)
//! to clients that do not look like a desktop browser, so every outgoing
//! request carries one of these header sets.

use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use rand::seq::SliceRandom;
use rand::thread_rng;

/// Desktop user agents rotated between attempts.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36 Edg/128.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:131.0) Gecko/20100101 Firefox/131.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:130.0) Gecko/20100101 Firefox/130.0",
];

const HTML_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Search engines used as referer during session warm-up.
pub const SEARCH_REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

pub fn random_search_referer() -> &'static str {
    SEARCH_REFERERS
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or(SEARCH_REFERERS[0])
}

/// Header set for a top-level document navigation.
pub fn browser_headers(user_agent: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        map.insert(USER_AGENT, value);
    }
    map.insert(ACCEPT, HeaderValue::from_static(HTML_ACCEPT));
    map.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    map.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    map.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("document"),
    );
    map.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("navigate"),
    );
    map
}

/// Same as [`browser_headers`] with a `Referer`.
pub fn browser_headers_with_referer(user_agent: &str, referer: &str) -> HeaderMap {
    let mut map = browser_headers(user_agent);
    if let Ok(value) = HeaderValue::from_str(referer) {
        map.insert(REFERER, value);
    }
    map
}

/// Headers for the XHR-style calls scripts issue to fetch a link.
pub fn ajax_headers(user_agent: &str, referer: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        map.insert(USER_AGENT, value);
    }
    map.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
    );
    map.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    if let Ok(value) = HeaderValue::from_str(referer) {
        map.insert(REFERER, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_profile_has_user_agent_and_referer() {
        let ua = random_user_agent();
        let headers = browser_headers_with_referer(ua, "https://www.google.com/");
        assert_eq!(headers.get(USER_AGENT).unwrap(), ua);
        assert_eq!(headers.get(REFERER).unwrap(), "https://www.google.com/");
        assert!(headers.get(ACCEPT).unwrap().to_str().unwrap().starts_with("text/html"));
    }

    #[test]
    fn ajax_profile_marks_xhr() {
        let headers = ajax_headers(random_user_agent(), "https://short.ly/abc");
        assert_eq!(headers.get("x-requested-with").unwrap(), "XMLHttpRequest");
    }
}
