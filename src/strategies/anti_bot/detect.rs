//! Anti-bot interstitial detection.
//!
//! Signature based: every known challenge family lists a few regexes and the
//! family with the most matches wins.

use http::header::SERVER;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::core::FetchedPage;

/// Challenge families the strategy can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    /// "I'm Under Attack" JavaScript challenge; solvable with an interpreter.
    Iuam,
    /// Orchestrated/managed challenge that needs a real browser.
    Managed,
    Turnstile,
    RateLimited,
    AccessDenied,
    BotManagement,
    /// Looks like an interstitial but matches no known family.
    Generic,
}

impl ChallengeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Iuam => "iuam",
            ChallengeKind::Managed => "managed",
            ChallengeKind::Turnstile => "turnstile",
            ChallengeKind::RateLimited => "rate_limited",
            ChallengeKind::AccessDenied => "access_denied",
            ChallengeKind::BotManagement => "bot_management",
            ChallengeKind::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: ChallengeKind,
    pub signature: &'static str,
    pub matched: usize,
}

struct ChallengeSignature {
    id: &'static str,
    kind: ChallengeKind,
    patterns: Vec<Regex>,
}

impl ChallengeSignature {
    fn new(id: &'static str, kind: ChallengeKind, raw_patterns: &[&str]) -> Self {
        let patterns = raw_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .unwrap()
            })
            .collect();
        Self { id, kind, patterns }
    }

    fn matches(&self, body: &str) -> usize {
        self.patterns.iter().filter(|re| re.is_match(body)).count()
    }
}

static SIGNATURES: Lazy<Vec<ChallengeSignature>> = Lazy::new(|| {
    vec![
        ChallengeSignature::new(
            "cf_iuam",
            ChallengeKind::Iuam,
            &[
                r"<title>\s*Just a moment\.\.\.\s*</title>",
                r"var s,t,o,p,b,r,e,a,k,i,n,g,f,u,l,l,y,h,a,r,d,c,o,r,e",
                r"setTimeout\(function\(\)\s*\{\s*var.*?\.submit\(\)",
                r#"<form[^>]*id=["']challenge-form["'][^>]*action=["'][^"']*__cf_chl_(?:f_tk|jschl_tk__)="#,
                r"/cdn-cgi/images/trace/jsch/",
            ],
        ),
        ChallengeSignature::new(
            "cf_managed",
            ChallengeKind::Managed,
            &[
                r#"cpo\.src\s*=\s*['"]/cdn-cgi/challenge-platform/.*?orchestrate/(?:captcha|managed|jsch)/v1"#,
                r"window\._cf_chl_(?:opt|ctx)\s*=",
                r#"<div[^>]*class=["']cf-browser-verification"#,
                r"cf_chl_prog",
            ],
        ),
        ChallengeSignature::new(
            "cf_turnstile",
            ChallengeKind::Turnstile,
            &[
                r#"class=["']cf-turnstile["']"#,
                r"challenges\.cloudflare\.com/turnstile/v0/api\.js",
                r"cf-turnstile-response",
            ],
        ),
        ChallengeSignature::new(
            "cf_rate_limit",
            ChallengeKind::RateLimited,
            &[
                r#"<span[^>]*class=["']cf-error-code["']>1015<"#,
                r"You are being rate limited",
            ],
        ),
        ChallengeSignature::new(
            "cf_access_denied",
            ChallengeKind::AccessDenied,
            &[
                r#"<span[^>]*class=["']cf-error-code["']>1020<"#,
                r"The owner of this website has banned your access",
            ],
        ),
        ChallengeSignature::new(
            "cf_bot_management",
            ChallengeKind::BotManagement,
            &[
                r#"<span[^>]*class=["']cf-error-code["']>1010<"#,
                r"has banned you temporarily",
            ],
        ),
    ]
});

/// Markers that only appear on challenge interstitials.
const INTERSTITIAL_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf-im-under-attack",
    "cf-challenge",
    "challenge-platform",
    "cf_chl_jschl_tk",
    "cf_chl_captcha_tk",
    "cf-spinner-please-wait",
    "cf-captcha-bookmark",
    "checking your browser",
    "ddos protection",
];

/// Markers that are too common on ordinary pages to count unless the
/// response also comes from an anti-bot front end.
const FRONT_END_MARKERS: &[&str] = &["please wait", "ray id", "turnstile", "just a moment"];

pub fn is_cloudflare(page: &FetchedPage) -> bool {
    page.headers
        .get(SERVER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|server| server.to_ascii_lowercase().starts_with("cloudflare"))
        || page.header("cf-ray").is_some()
}

/// Identify the challenge served in `page`, if any.
pub fn detect(page: &FetchedPage) -> Option<Detection> {
    let best = SIGNATURES
        .iter()
        .map(|signature| (signature, signature.matches(&page.body)))
        .filter(|(_, matched)| *matched > 0)
        .max_by_key(|(_, matched)| *matched);
    if let Some((signature, matched)) = best {
        return Some(Detection {
            kind: signature.kind,
            signature: signature.id,
            matched,
        });
    }

    let body = page.body.to_ascii_lowercase();
    let interstitial = INTERSTITIAL_MARKERS.iter().any(|marker| body.contains(marker))
        || (is_cloudflare(page) && FRONT_END_MARKERS.iter().any(|marker| body.contains(marker)));
    interstitial.then_some(Detection {
        kind: ChallengeKind::Generic,
        signature: "interstitial_marker",
        matched: 1,
    })
}
