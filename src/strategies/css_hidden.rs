//! Links hidden with CSS.
//!
//! Looks at stylesheet rules and inline styles to find anchors the page hides
//! from humans (but keeps in the DOM for its own scripts), text hidden with
//! `text-indent`/`font-size: 0`, URLs assembled from `content:` declarations
//! and links left in HTML comments.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use super::extract::{DATA_LINK_ATTRIBUTES, find_base64_url, find_urls, is_destination, resolve_href};
use super::{CSS_HIDDEN, Strategy, StrategyContext, fetch_document};
use crate::core::{FetchRequest, PageFetcher, StrategyOutcome};

/// Linked stylesheets fetched per page.
const MAX_STYLESHEETS: usize = 5;

static STYLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("style").unwrap());
static STYLESHEET_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"link[rel~="stylesheet"][href]"#).unwrap());
static STYLED_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("[style]").unwrap());
static ANY_ELEMENT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("body *").unwrap());
static CHILD_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("span, i, b, em").unwrap());

static RULE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([^{}]+)\{([^{}]*)\}").unwrap());
static CSS_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static CLASS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.([\w-]+)").unwrap());
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#([\w-]+)").unwrap());
static CONTENT_STRING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"content\s*:\s*["']([^"']+)["']"#).unwrap());
static CONTENT_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"content\s*:\s*attr\(\s*([\w-]+)\s*\)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Technique {
    HiddenLink,
    ObfuscatedText,
    PseudoElement,
    Comment,
}

impl Technique {
    fn as_str(self) -> &'static str {
        match self {
            Technique::HiddenLink => "hidden_link",
            Technique::ObfuscatedText => "css_deobfuscation",
            Technique::PseudoElement => "pseudo_element",
            Technique::Comment => "html_comment",
        }
    }
}

/// `property: value` pairs of a declaration block, lowercased.
fn declarations(block: &str) -> Vec<(String, String)> {
    block
        .split(';')
        .filter_map(|declaration| {
            let (property, value) = declaration.split_once(':')?;
            let value = value.trim().trim_end_matches("!important").trim();
            Some((property.trim().to_ascii_lowercase(), value.to_ascii_lowercase()))
        })
        .collect()
}

fn is_zero(value: &str) -> bool {
    let number = value.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%');
    number.parse::<f64>().is_ok_and(|n| n == 0.0)
}

fn is_negative(value: &str) -> bool {
    value.starts_with('-')
}

/// Declarations that take an element out of sight.
fn hides(declarations: &[(String, String)]) -> bool {
    let value = |name: &str| {
        declarations
            .iter()
            .rev()
            .find(|(property, _)| property == name)
            .map(|(_, value)| value.as_str())
    };

    let offscreen = value("position") == Some("absolute")
        && (value("left").is_some_and(is_negative) || value("top").is_some_and(is_negative));

    value("display") == Some("none")
        || value("visibility") == Some("hidden")
        || value("opacity").is_some_and(is_zero)
        || value("height").is_some_and(is_zero)
        || value("width").is_some_and(is_zero)
        || value("z-index").is_some_and(is_negative)
        || offscreen
}

/// Declarations that keep the element but make its text unreadable.
fn obscures_text(declarations: &[(String, String)]) -> bool {
    declarations.iter().any(|(property, value)| {
        (property == "text-indent" && is_negative(value)) || (property == "font-size" && is_zero(value))
    })
}

/// Class and id names targeted by stylesheet rules.
#[derive(Debug, Default)]
struct RuleTargets {
    hidden_classes: HashSet<String>,
    hidden_ids: HashSet<String>,
    obscured_classes: HashSet<String>,
    obscured_ids: HashSet<String>,
}

impl RuleTargets {
    fn from_css(css: &str) -> Self {
        let css = CSS_COMMENT_RE.replace_all(css, "");
        let mut targets = RuleTargets::default();

        for caps in RULE_RE.captures_iter(&css) {
            let block = declarations(&caps[2]);
            let (hidden, obscured) = (hides(&block), obscures_text(&block));
            if !hidden && !obscured {
                continue;
            }

            for selector in caps[1].split(',') {
                // Only the subject (last compound) of the selector matters.
                let Some(subject) = selector.split_whitespace().last() else {
                    continue;
                };
                let subject = subject.split(':').next().unwrap_or(subject);
                for class in CLASS_RE.captures_iter(subject) {
                    if hidden {
                        targets.hidden_classes.insert(class[1].to_string());
                    }
                    if obscured {
                        targets.obscured_classes.insert(class[1].to_string());
                    }
                }
                for id in ID_RE.captures_iter(subject) {
                    if hidden {
                        targets.hidden_ids.insert(id[1].to_string());
                    }
                    if obscured {
                        targets.obscured_ids.insert(id[1].to_string());
                    }
                }
            }
        }
        targets
    }

    fn is_hidden(&self, element: ElementRef<'_>) -> bool {
        let element = element.value();
        element.attr("style").is_some_and(|style| hides(&declarations(style)))
            || element.classes().any(|class| self.hidden_classes.contains(class))
            || element.id().is_some_and(|id| self.hidden_ids.contains(id))
    }

    fn is_obscured(&self, element: ElementRef<'_>) -> bool {
        let element = element.value();
        element.attr("style").is_some_and(|style| obscures_text(&declarations(style)))
            || element.classes().any(|class| self.obscured_classes.contains(class))
            || element.id().is_some_and(|id| self.obscured_ids.contains(id))
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct CssHiddenStrategy {
    fetcher: Arc<dyn PageFetcher>,
    timeout: Duration,
}

impl CssHiddenStrategy {
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

    /// Linked stylesheets that answer; failures are ignored.
    async fn fetch_stylesheets(&self, urls: Vec<Url>) -> Vec<String> {
        let mut sheets = Vec::new();
        for url in urls.into_iter().take(MAX_STYLESHEETS) {
            match self.fetcher.fetch(FetchRequest::get(url.clone())).await {
                Ok(sheet) if sheet.is_success() => sheets.push(sheet.body),
                Ok(sheet) => log::debug!("Stylesheet {url} answered {}", sheet.status),
                Err(err) => log::debug!("Stylesheet {url} failed: {err}"),
            }
        }
        sheets
    }
}

#[async_trait]
impl Strategy for CssHiddenStrategy {
    fn name(&self) -> &'static str {
        CSS_HIDDEN
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn attempt(&self, url: &Url, ctx: &StrategyContext) -> StrategyOutcome {
        let page = match fetch_document(CSS_HIDDEN, self.fetcher.as_ref(), FetchRequest::get(url.clone())).await {
            Ok(page) => page,
            Err(outcome) => return outcome,
        };

        let (mut css, stylesheet_urls) = collect_css(&page.body, &page.url);
        if !stylesheet_urls.is_empty() {
            css.extend(self.fetch_stylesheets(stylesheet_urls).await);
        }

        match analyse(&page.body, &css.join("\n"), &page.url, url) {
            Some((target, technique)) => {
                log::info!("{CSS_HIDDEN}: found {target} via {}", technique.as_str());
                ctx.resolved(&target, CSS_HIDDEN)
            }
            None => StrategyOutcome::failed("no css-hidden link found"),
        }
    }
}

/// Inline `<style>` blocks, `style` attributes wrapped as rules, and the
/// stylesheet URLs still to fetch.
fn collect_css(body: &str, page: &Url) -> (Vec<String>, Vec<Url>) {
    let document = Html::parse_document(body);

    let mut css: Vec<String> = document
        .select(&STYLE_SELECTOR)
        .map(|style| style.text().collect())
        .collect();
    css.extend(
        document
            .select(&STYLED_SELECTOR)
            .filter_map(|element| element.value().attr("style"))
            .map(|style| format!("{{ {style} }}")),
    );

    let sheets = document
        .select(&STYLESHEET_SELECTOR)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| resolve_href(page, href))
        .collect();

    (css, sheets)
}

fn analyse(body: &str, css: &str, page: &Url, origin: &Url) -> Option<(Url, Technique)> {
    let document = Html::parse_document(body);
    let targets = RuleTargets::from_css(css);

    hidden_link(&document, &targets, page, origin)
        .map(|url| (url, Technique::HiddenLink))
        .or_else(|| obfuscated_text(&document, &targets, css, page, origin).map(|url| (url, Technique::ObfuscatedText)))
        .or_else(|| pseudo_element(&document, css, page, origin).map(|url| (url, Technique::PseudoElement)))
        .or_else(|| comment_link(&document, page, origin).map(|url| (url, Technique::Comment)))
}

fn hidden_link(document: &Html, targets: &RuleTargets, page: &Url, origin: &Url) -> Option<Url> {
    document
        .select(&ANY_ELEMENT_SELECTOR)
        .filter(|element| targets.is_hidden(*element))
        .flat_map(|element| {
            // The hidden element itself or any anchor nested in it.
            std::iter::once(element).chain(element.descendants().filter_map(ElementRef::wrap))
        })
        .flat_map(|element| {
            std::iter::once("href")
                .chain(DATA_LINK_ATTRIBUTES.iter().copied())
                .filter_map(move |attribute| element.value().attr(attribute))
        })
        .filter_map(|value| resolve_href(page, value))
        .find(|url| is_destination(url, page, origin))
}

fn text_url(text: &str, page: &Url, origin: &Url) -> Option<Url> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !compact.starts_with("http") {
        return None;
    }
    Url::parse(&compact)
        .ok()
        .filter(|url| {
            url.host_str()
                .is_some_and(|host| host.contains('.') && !host.ends_with('.'))
                && is_destination(url, page, origin)
        })
}

fn obfuscated_text(
    document: &Html,
    targets: &RuleTargets,
    css: &str,
    page: &Url,
    origin: &Url,
) -> Option<Url> {
    // Text of elements that are pushed off-screen or shrunk to nothing.
    let obscured = document
        .select(&ANY_ELEMENT_SELECTOR)
        .filter(|element| targets.is_obscured(*element))
        .find_map(|element| text_url(&element.text().collect::<String>(), page, origin));
    if obscured.is_some() {
        return obscured;
    }

    // URL split across sibling inline elements.
    let split = document.select(&ANY_ELEMENT_SELECTOR).find_map(|element| {
        let pieces: Vec<String> = element
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|child| CHILD_SELECTOR.matches(child))
            .map(|child| child.text().collect())
            .collect();
        (pieces.len() > 1)
            .then(|| text_url(&pieces.concat(), page, origin))
            .flatten()
    });
    if split.is_some() {
        return split;
    }

    // `content: "..."` strings, alone or concatenated in rule order.
    let contents: Vec<String> = CONTENT_STRING_RE
        .captures_iter(css)
        .map(|caps| caps[1].replace('\\', ""))
        .collect();
    contents
        .iter()
        .find_map(|content| text_url(content, page, origin))
        .or_else(|| (contents.len() > 1).then(|| text_url(&contents.concat(), page, origin)).flatten())
}

fn pseudo_element(document: &Html, css: &str, page: &Url, origin: &Url) -> Option<Url> {
    CONTENT_ATTR_RE
        .captures_iter(css)
        .filter_map(|caps| {
            let attribute = caps[1].to_string();
            let selector = Selector::parse(&format!("[{attribute}]")).ok()?;
            Some((attribute, selector))
        })
        .find_map(|(attribute, selector)| {
            document
                .select(&selector)
                .filter_map(|element| element.value().attr(&attribute))
                .filter_map(|value| resolve_href(page, value))
                .find(|url| is_destination(url, page, origin))
        })
}

fn comment_link(document: &Html, page: &Url, origin: &Url) -> Option<Url> {
    document.tree.nodes().find_map(|node| {
        let Node::Comment(comment) = node.value() else {
            return None;
        };
        let text: &str = comment;
        find_urls(text)
            .find(|url| is_destination(url, page, origin))
            .or_else(|| find_base64_url(text).filter(|url| is_destination(url, page, origin)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{CannedPage, StubFetcher};

    const ORIGIN: &str = "https://short.ly/abc";

    fn origin() -> Url {
        Url::parse(ORIGIN).unwrap()
    }

    fn scan(body: &str, css: &str) -> Option<(String, Technique)> {
        let origin = origin();
        let (mut collected, _) = collect_css(body, &origin);
        collected.push(css.to_string());
        analyse(body, &collected.join("\n"), &origin, &origin)
            .map(|(url, technique)| (url.to_string(), technique))
    }

    #[test]
    fn declaration_parsing() {
        assert!(hides(&declarations("display: none !important")));
        assert!(hides(&declarations("opacity:0")));
        assert!(!hides(&declarations("opacity: 0.5")));
        assert!(hides(&declarations("position:absolute; left:-9999px")));
        assert!(obscures_text(&declarations("text-indent: -9999px")));
        assert!(obscures_text(&declarations("font-size:0")));
    }

    #[test]
    fn finds_links_hidden_by_class_rules() {
        let body = r#"<style>.ad { color: red } div.secret-box > a.go::after { visibility: hidden }</style>
            <a class="ad" href="https://ads.example/">Ad</a>
            <a class="go" href="https://dest.example/file">go</a>"#;
        assert_eq!(
            scan(body, ""),
            Some(("https://dest.example/file".to_string(), Technique::HiddenLink))
        );
    }

    #[test]
    fn finds_links_hidden_inline_or_by_id() {
        let inline = r#"<div style="display:none"><a href="https://dest.example/a">x</a></div>"#;
        assert_eq!(scan(inline, "").unwrap().0, "https://dest.example/a");

        let by_id = r#"<span id="real" data-url="https://dest.example/b"></span>"#;
        assert_eq!(scan(by_id, "#real { opacity: 0 }").unwrap().0, "https://dest.example/b");
    }

    #[test]
    fn reads_obscured_and_split_text() {
        let indented = r#"<p class="sr">https://dest.example/indent</p>"#;
        assert_eq!(
            scan(indented, ".sr { text-indent: -9999px }"),
            Some(("https://dest.example/indent".to_string(), Technique::ObfuscatedText))
        );

        let split = r#"<p><span>https://dest</span><span>.example</span><span>/split</span></p>"#;
        assert_eq!(scan(split, "").unwrap().0, "https://dest.example/split");
    }

    #[test]
    fn joins_content_strings() {
        let css = r#".a::before { content: "https://dest." } .b::after { content: "example/css" }"#;
        assert_eq!(scan("<p>wait</p>", css).unwrap().0, "https://dest.example/css");
    }

    #[test]
    fn resolves_attr_pseudo_elements() {
        let body = r#"<button data-target="https://dest.example/attr">Open</button>"#;
        assert_eq!(
            scan(body, "button::after { content: attr(data-target) }"),
            Some(("https://dest.example/attr".to_string(), Technique::PseudoElement))
        );
    }

    #[test]
    fn reads_comments() {
        let body = "<p>wait</p><!-- real: aHR0cHM6Ly9kZXN0LmV4YW1wbGUvZmlsZQ== -->";
        assert_eq!(
            scan(body, ""),
            Some(("https://dest.example/file".to_string(), Technique::Comment))
        );
    }

    #[tokio::test]
    async fn fetches_linked_stylesheets() {
        let body = r#"<link rel="stylesheet" href="/site.css"><a class="h" href="https://dest.example/sheet">x</a>"#;
        let fetcher = Arc::new(
            StubFetcher::new()
                .page(ORIGIN, CannedPage::ok(body))
                .page("https://short.ly/site.css", CannedPage::ok(".h{display:none}")),
        );
        let strategy = CssHiddenStrategy::new(fetcher.clone());
        let outcome = strategy
            .attempt(&origin(), &StrategyContext::new(Duration::from_secs(15)))
            .await;

        assert!(outcome.is_resolved());
        assert_eq!(fetcher.request_count(), 2);
    }

    #[tokio::test]
    async fn visible_page_fails() {
        let fetcher = Arc::new(
            StubFetcher::new().page(ORIGIN, CannedPage::ok(r#"<a href="https://ads.example/">Ad</a>"#)),
        );
        let outcome = CssHiddenStrategy::new(fetcher)
            .attempt(&origin(), &StrategyContext::new(Duration::from_secs(15)))
            .await;
        assert!(matches!(outcome, StrategyOutcome::Failed { .. }));
    }
}
