use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::HeaderMap;
use linkbypass_rs::strategies::{CssHiddenStrategy, StaticHtmlStrategy};
use linkbypass_rs::{
    AttemptVerdict, BypassManager, BypassResult, CacheEntry, DomainListPolicy, FetchError,
    FetchRequest, FetchedPage, PageFetcher, ResultCache, Strategy, StrategyContext,
    StrategyOutcome, normalize,
};
use url::Url;

/// Serves fixed bodies by URL and counts requests.
#[derive(Default)]
struct Pages {
    bodies: HashMap<String, String>,
    requests: AtomicUsize,
}

impl Pages {
    fn with(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl PageFetcher for Pages {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let body = self.bodies.get(request.url.as_str()).cloned();
        Ok(FetchedPage {
            status: if body.is_some() { 200 } else { 404 },
            url: request.url,
            headers: HeaderMap::new(),
            body: body.unwrap_or_default(),
        })
    }
}

/// Strategy with a canned outcome, an optional delay and a call counter.
struct Canned {
    name: &'static str,
    outcome: StrategyOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl Canned {
    fn new(name: &'static str, outcome: StrategyOutcome) -> Arc<Self> {
        Self::slow(name, outcome, Duration::ZERO)
    }

    fn slow(name: &'static str, outcome: StrategyOutcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcome,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Strategy for Canned {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self, _url: &Url, _ctx: &StrategyContext) -> StrategyOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

fn resolved(url: &str, method: &str) -> StrategyOutcome {
    StrategyOutcome::resolved(url, method, Duration::from_millis(5))
}

fn policy() -> Arc<DomainListPolicy> {
    Arc::new(DomainListPolicy::new(["short.ly"], ["blocked.example"]))
}

fn manager_with(strategies: Vec<Arc<dyn Strategy>>) -> BypassManager {
    BypassManager::builder()
        .with_policy_source(policy())
        .with_strategies(strategies)
        .build()
        .unwrap()
}

#[test]
fn normalisation_is_idempotent() {
    for raw in [
        "HTTPS://Short.LY:443/abc/#frag",
        "http://short.ly:80",
        "  https://short.ly/a/b/?q=1  ",
        "https://short.ly/Case/Path",
        "http://short.ly:8080/x/",
    ] {
        let once = normalize(raw).unwrap();
        let twice = normalize(once.as_str()).unwrap();
        assert_eq!(once, twice, "normalising {raw:?} twice changed the key");
    }
    assert_eq!(
        normalize("HTTPS://Short.LY:443/abc/#frag").unwrap().as_str(),
        "https://short.ly/abc"
    );
}

#[tokio::test]
async fn cache_round_trip_and_expiry() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = normalize("https://short.ly/abc").unwrap();
    let t0 = Utc::now();
    let entry = CacheEntry::new("https://dest.example/", "static_html", t0, cache.ttl());
    cache.put(key.clone(), entry.clone()).await;

    assert_eq!(cache.get_at(&key, t0), Some(entry.clone()));
    assert_eq!(
        cache.get_at(&key, t0 + chrono::Duration::seconds(59)),
        Some(entry)
    );
    assert_eq!(cache.get_at(&key, t0 + chrono::Duration::seconds(60)), None);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn concurrent_requests_share_one_cascade_run() {
    let strategy = Canned::slow(
        "slow",
        resolved("https://dest.example/file", "slow"),
        Duration::from_millis(200),
    );
    let manager = Arc::new(manager_with(vec![strategy.clone()]));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .resolve("https://short.ly/abc", &format!("user-{i}"))
                    .await
            })
        })
        .collect();

    let mut urls = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        urls.push(result.final_url().map(str::to_string));
    }

    assert_eq!(strategy.calls(), 1);
    assert!(urls.iter().all(|url| url.as_deref() == Some("https://dest.example/file")));
    let stats = manager.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.cached_links, 1);
    assert_eq!(stats.metrics.unwrap().global.resolutions, 16);
}

#[tokio::test]
async fn concurrent_requests_share_one_failure() {
    let strategy = Canned::slow(
        "slow",
        StrategyOutcome::fatal("slow: host unreachable"),
        Duration::from_millis(200),
    );
    let manager = Arc::new(manager_with(vec![strategy.clone()]));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .resolve("https://short.ly/down", &format!("user-{i}"))
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(strategy.calls(), 1);
    let BypassResult::Unresolved { diagnostics } = &results[0] else {
        panic!("expected an unresolved link");
    };
    assert_eq!(diagnostics.fatal.as_deref(), Some("slow: host unreachable"));
    assert!(results.iter().all(|result| result == &results[0]));

    let stats = manager.stats();
    assert_eq!(stats.cached_links, 0);
    let global = stats.metrics.unwrap().global;
    assert_eq!(global.coalesced, 7);
    assert_eq!(global.unresolved, 8);
}

#[tokio::test]
async fn cache_is_warm_when_waiters_are_released() {
    let strategy = Canned::slow(
        "slow",
        resolved("https://dest.example/file", "slow"),
        Duration::from_millis(200),
    );
    let manager = Arc::new(manager_with(vec![strategy.clone()]));
    let key = normalize("https://short.ly/warm").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let key = key.clone();
            tokio::spawn(async move {
                let result = manager
                    .resolve("https://short.ly/warm", &format!("user-{i}"))
                    .await;
                let cached = manager.cache().get(&key);
                (result, cached)
            })
        })
        .collect();

    for handle in handles {
        let (result, cached) = handle.await.unwrap();
        assert_eq!(result.final_url(), Some("https://dest.example/file"));
        let entry = cached.expect("entry written before release");
        assert_eq!(entry.final_url, "https://dest.example/file");
        assert_eq!(entry.method, "slow");
    }
    assert_eq!(strategy.calls(), 1);
    assert_eq!(manager.stats().metrics.unwrap().global.coalesced, 7);
}

#[tokio::test]
async fn unresolved_links_are_not_cached() {
    let strategy = Canned::new("nothing", StrategyOutcome::failed("no link found in page"));
    let manager = manager_with(vec![strategy.clone()]);

    for _ in 0..2 {
        let result = manager.resolve("https://short.ly/dead", "u1").await;
        let BypassResult::Unresolved { diagnostics } = result else {
            panic!("expected an unresolved link");
        };
        assert_eq!(diagnostics.attempts.len(), 1);
        assert!(diagnostics.to_string().starts_with("all strategies failed"));
    }
    assert_eq!(strategy.calls(), 2);
    assert_eq!(manager.stats().cached_links, 0);
}

#[tokio::test]
async fn cascade_stops_at_first_resolution() {
    let first = Canned::new("first", StrategyOutcome::not_applicable("no scripts"));
    let second = Canned::new("second", resolved("https://dest.example/2", "second"));
    let third = Canned::new("third", resolved("https://dest.example/3", "third"));
    let manager = manager_with(vec![first.clone(), second.clone(), third.clone()]);

    let result = manager.resolve("https://short.ly/abc", "u1").await;
    assert_eq!(
        result,
        BypassResult::Resolved {
            final_url: "https://dest.example/2".into(),
            method: "second".into(),
            cached: false,
        }
    );
    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
}

#[tokio::test]
async fn fatal_error_aborts_the_cascade() {
    let first = Canned::new("first", StrategyOutcome::fatal("first: host unreachable"));
    let second = Canned::new("second", resolved("https://dest.example/2", "second"));
    let manager = manager_with(vec![first.clone(), second.clone()]);

    let result = manager.resolve("https://short.ly/abc", "u1").await;
    let BypassResult::Unresolved { diagnostics } = result else {
        panic!("expected an unresolved link");
    };
    assert_eq!(diagnostics.fatal.as_deref(), Some("first: host unreachable"));
    assert_eq!(diagnostics.attempts.len(), 1);
    assert_eq!(diagnostics.attempts[0].verdict, AttemptVerdict::Fatal);
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn hidden_link_is_resolved_by_the_second_strategy_then_cached() {
    let fetcher = Arc::new(Pages::default().with(
        "https://short.ly/abc",
        r#"<html><body><p>Your link is almost ready</p>
            <!-- destination: https://dest.example/file --></body></html>"#,
    ));
    let manager = manager_with(vec![
        Arc::new(StaticHtmlStrategy::new(fetcher.clone())),
        Arc::new(CssHiddenStrategy::new(fetcher.clone())),
    ]);

    let first = manager.resolve("https://short.ly/abc", "u1").await;
    assert_eq!(
        first,
        BypassResult::Resolved {
            final_url: "https://dest.example/file".into(),
            method: "css_hidden".into(),
            cached: false,
        }
    );
    let fetched = fetcher.requests.load(Ordering::SeqCst);

    let second = manager.resolve("https://SHORT.ly/abc/", "u2").await;
    assert_eq!(
        second,
        BypassResult::Resolved {
            final_url: "https://dest.example/file".into(),
            method: "css_hidden".into(),
            cached: true,
        }
    );
    assert_eq!(fetcher.requests.load(Ordering::SeqCst), fetched);

    let metrics = manager.stats().metrics.unwrap();
    assert_eq!(metrics.global.cache_hits, 1);
    assert_eq!(metrics.strategy("static_html").unwrap().failures, 1);
    assert_eq!(metrics.strategy("css_hidden").unwrap().successes, 1);
}

#[tokio::test]
async fn blocked_domains_never_reach_cache_or_strategies() {
    let strategy = Canned::new("any", resolved("https://dest.example/", "any"));
    let manager = manager_with(vec![strategy.clone()]);

    let result = manager.resolve("https://www.blocked.example/x", "u1").await;
    assert_eq!(
        result,
        BypassResult::Denied {
            reason: "domain www.blocked.example is blocked".into()
        }
    );
    assert_eq!(strategy.calls(), 0);
    let stats = manager.stats();
    assert_eq!(stats.cached_links, 0);
    assert_eq!(stats.metrics.unwrap().global.denied, 1);
}

#[tokio::test]
async fn persisted_results_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("links.redb");

    {
        let strategy = Canned::new("first", resolved("https://dest.example/kept", "first"));
        let manager = BypassManager::builder()
            .with_policy_source(policy())
            .with_strategies(vec![strategy])
            .with_cache_path(&path)
            .build()
            .unwrap();
        assert!(manager.resolve("https://short.ly/keep", "u1").await.is_resolved());
    }

    let strategy = Canned::new("first", StrategyOutcome::failed("should not run"));
    let manager = BypassManager::builder()
        .with_policy_source(policy())
        .with_strategies(vec![strategy.clone()])
        .with_cache_path(&path)
        .build()
        .unwrap();
    assert_eq!(manager.start().await.unwrap(), 1);

    let result = manager.resolve("https://short.ly/keep", "u2").await;
    assert_eq!(result.final_url(), Some("https://dest.example/kept"));
    assert_eq!(strategy.calls(), 0);
    manager.shutdown().await;
}
