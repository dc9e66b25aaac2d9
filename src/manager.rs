//! Bypass manager: the engine's entry point.
//!
//! Wires the policy gate, the result cache, single-flight dispatch and the
//! strategy cascade together. A resolution goes through:
//!
//! 1. URL normalisation into the cache key;
//! 2. the policy gate, on the URL as given;
//! 3. the result cache;
//! 4. single-flight dispatch on the key, whose leader re-checks the cache and
//!    then runs the cascade;
//! 5. a cache write for resolved links, done before the flight is released.
//!
//! Unresolved links are never cached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::cache::{BackingError, CacheBacking, CacheSweeper, RedbBacking, ResultCache};
use crate::config::{ConfigError, EngineConfig};
use crate::core::{
	BypassResult, Diagnostics, FetchError, FetcherOptions, LinkRequest, NormalizeError,
	NormalizedKey, PageFetcher, ReqwestPageFetcher, StrategyOutcome, normalize_url, parse_link,
};
use crate::external_deps::browser::BrowserDriver;
use crate::external_deps::interpreters::{BoaJavascriptInterpreter, JavascriptInterpreter};
use crate::external_deps::llm::{LanguageModel, LanguageModelError, OpenAiProvider};
use crate::flight::{FlightRole, SingleFlight};
use crate::modules::events::{
	BypassEvent, CacheHitEvent, CoalescedEvent, DeniedEvent, EventDispatcher, EventHandler,
	LoggingHandler, MetricsHandler, RequestEvent, ResolvedEvent, UnresolvedEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::policy::{DomainListPolicy, MALFORMED_URL, PolicyDecision, PolicyGate, PolicySource};
use crate::strategies::{
	AiAssistedStrategy, AntiBotStrategy, BrowserStrategy, Cascade, CssHiddenStrategy,
	DEFAULT_STRATEGY_TIMEOUT, JavascriptStrategy, StaticHtmlStrategy, Strategy, StrategyInfo,
	ai_assisted, anti_bot, css_hidden, javascript, static_html,
};

/// Result alias used for engine construction and management calls.
pub type EngineResult<T> = Result<T, BypassError>;

/// Errors surfaced outside of resolutions. Resolutions themselves never fail:
/// they end `Resolved`, `Unresolved` or `Denied`.
#[derive(Debug, Error)]
pub enum BypassError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("http client initialisation failed: {0}")]
	Fetch(#[from] FetchError),
	#[error("cache backing error: {0}")]
	Backing(#[from] BackingError),
	#[error("language model initialisation failed: {0}")]
	LanguageModel(#[from] LanguageModelError),
	#[error("invalid url: {0}")]
	Url(#[from] NormalizeError),
	#[error("link rejected: {0}")]
	Denied(String),
	#[error("unknown strategy '{0}'")]
	UnknownStrategy(String),
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone)]
pub struct EngineStats {
	/// `None` when metrics were disabled on the builder.
	pub metrics: Option<MetricsSnapshot>,
	pub cached_links: usize,
	pub in_flight: usize,
}

/// Fluent builder for [`BypassManager`].
pub struct BypassManagerBuilder {
	config: EngineConfig,
	fetcher: Option<Arc<dyn PageFetcher>>,
	interpreter: Option<Arc<dyn JavascriptInterpreter>>,
	model: Option<Arc<dyn LanguageModel>>,
	browser: Option<Arc<dyn BrowserDriver>>,
	policy: Option<Arc<dyn PolicySource>>,
	backing: Option<Arc<dyn CacheBacking>>,
	strategies: Option<Vec<Arc<dyn Strategy>>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl BypassManagerBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			fetcher: None,
			interpreter: None,
			model: None,
			browser: None,
			policy: None,
			backing: None,
			strategies: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
		self.config.cache_ttl = ttl;
		self
	}

	pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.config.cache_path = Some(path.into());
		self
	}

	/// Attempt budget for every built-in strategy and for supplied ones that
	/// declare none.
	pub fn with_strategy_timeout(mut self, timeout: Duration) -> Self {
		self.config.strategy_timeout = Some(timeout);
		self
	}

	pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
		self.fetcher = Some(fetcher);
		self
	}

	pub fn with_interpreter(mut self, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
		self.interpreter = Some(interpreter);
		self
	}

	pub fn with_language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
		self.model = Some(model);
		self
	}

	pub fn with_browser_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
		self.browser = Some(driver);
		self
	}

	pub fn with_policy_source(mut self, source: Arc<dyn PolicySource>) -> Self {
		self.policy = Some(source);
		self
	}

	pub fn with_cache_backing(mut self, backing: Arc<dyn CacheBacking>) -> Self {
		self.backing = Some(backing);
		self
	}

	/// Replace the default six-strategy cascade.
	pub fn with_strategies(mut self, strategies: Vec<Arc<dyn Strategy>>) -> Self {
		self.strategies = Some(strategies);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> EngineResult<BypassManager> {
		BypassManager::from_parts(self)
	}
}

impl Default for BypassManagerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main resolution engine.
pub struct BypassManager {
	config: EngineConfig,
	policy: PolicyGate,
	cache: Arc<ResultCache>,
	flights: SingleFlight<NormalizedKey, BypassResult>,
	cascade: Arc<Cascade>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
	sweeper: Mutex<Option<CacheSweeper>>,
}

impl BypassManager {
	/// Construct a manager with default configuration.
	pub fn new() -> EngineResult<Self> {
		Self::builder().build()
	}

	/// Construct a manager configured from the environment.
	pub fn from_env() -> EngineResult<Self> {
		Self::builder().with_config(EngineConfig::from_env()?).build()
	}

	/// Obtain a builder to customise the manager.
	pub fn builder() -> BypassManagerBuilder {
		BypassManagerBuilder::new()
	}

	fn from_parts(parts: BypassManagerBuilder) -> EngineResult<Self> {
		let BypassManagerBuilder {
			config,
			fetcher,
			interpreter,
			model,
			browser,
			policy,
			backing,
			strategies,
			handlers,
		} = parts;

		let metrics = config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let strategies = match strategies {
			Some(strategies) => strategies,
			None => default_strategies(&config, fetcher, interpreter, model, browser)?,
		};
		let default_timeout = config.strategy_timeout.unwrap_or(DEFAULT_STRATEGY_TIMEOUT);
		let cascade = Cascade::new(strategies, default_timeout).with_events(Arc::clone(&events));

		let policy_source: Arc<dyn PolicySource> = match policy {
			Some(source) => source,
			None => Arc::new(DomainListPolicy::with_default_lists().with_mode(config.policy_mode)),
		};

		let backing = match (backing, &config.cache_path) {
			(Some(backing), _) => Some(backing),
			(None, Some(path)) => Some(Arc::new(RedbBacking::open(path)?) as Arc<dyn CacheBacking>),
			(None, None) => None,
		};
		let mut cache = ResultCache::new(config.cache_ttl);
		if let Some(backing) = backing {
			cache = cache.with_backing(backing);
		}

		Ok(Self {
			config,
			policy: PolicyGate::new(policy_source),
			cache: Arc::new(cache),
			flights: SingleFlight::new(),
			cascade: Arc::new(cascade),
			metrics,
			events,
			sweeper: Mutex::new(None),
		})
	}

	/// Resolve `raw_url` on behalf of `requester`.
	pub async fn resolve(&self, raw_url: &str, requester: &str) -> BypassResult {
		let request = LinkRequest::new(raw_url, requester);
		let started = Instant::now();

		self.events.dispatch(BypassEvent::Request(RequestEvent {
			url: request.raw_url().to_string(),
			requester: request.requester().to_string(),
			timestamp: request.requested_at(),
		}));
		log::info!("Resolving {} for {}", request.raw_url(), request.requester());

		let (key, url) = match parse_link(request.raw_url()) {
			Ok(url) => (normalize_url(&url), url),
			Err(err) => {
				log::debug!("Rejecting {}: {err}", request.raw_url());
				return self.deny(&request, MALFORMED_URL.to_string());
			}
		};

		if let PolicyDecision::Deny { reason } = self.policy.evaluate_url(&url) {
			return self.deny(&request, reason);
		}

		if let Some(entry) = self.cache.get(&key) {
			let result = BypassResult::Resolved {
				final_url: entry.final_url,
				method: entry.method,
				cached: true,
			};
			self.report(&key, &result, FlightRole::Leader, started);
			return result;
		}

		let work = {
			let cache = Arc::clone(&self.cache);
			let cascade = Arc::clone(&self.cascade);
			let key = key.clone();
			let requester = request.requester().to_string();
			move || resolve_uncached(cache, cascade, key, url, requester)
		};

		let (result, role) = match self.flights.run_exclusive(key.clone(), work).await {
			Ok(output) => output,
			Err(err) => {
				log::error!("Resolution of {key} did not complete: {err}");
				(
					BypassResult::Unresolved {
						diagnostics: Diagnostics::from_message(err.to_string()),
					},
					FlightRole::Leader,
				)
			}
		};
		self.report(&key, &result, role, started);
		result
	}

	/// Drop any cached result for `raw_url`, then resolve it again.
	pub async fn refresh(&self, raw_url: &str, requester: &str) -> BypassResult {
		if let Ok(url) = parse_link(raw_url)
			&& self.policy.evaluate_url(&url).is_allowed()
		{
			let key = normalize_url(&url);
			if self.cache.invalidate(&key).await {
				log::debug!("Invalidated cached result for {key}");
			}
		}
		self.resolve(raw_url, requester).await
	}

	/// Run one strategy by name, bypassing the cache and flight coordination.
	pub async fn attempt_strategy(&self, raw_url: &str, name: &str) -> EngineResult<StrategyOutcome> {
		let url = parse_link(raw_url)?;
		if let PolicyDecision::Deny { reason } = self.policy.evaluate_url(&url) {
			return Err(BypassError::Denied(reason));
		}
		let strategy = self
			.cascade
			.strategy(name)
			.ok_or_else(|| BypassError::UnknownStrategy(name.to_string()))?;

		let (outcome, elapsed) = self.cascade.attempt(&**strategy, &url, None).await;
		log::info!("Strategy {name} on {url}: {outcome:?} in {:.2}s", elapsed.as_secs_f64());
		Ok(outcome)
	}

	/// Registered strategies in cascade order.
	pub fn strategies(&self) -> Vec<StrategyInfo> {
		self.cascade.describe()
	}

	pub fn stats(&self) -> EngineStats {
		EngineStats {
			metrics: self.metrics.as_ref().map(MetricsCollector::snapshot),
			cached_links: self.cache.len(),
			in_flight: self.flights.in_flight(),
		}
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// The result cache behind this manager.
	pub fn cache(&self) -> &ResultCache {
		&self.cache
	}

	/// Reload persisted results and start the expired-entry sweeper.
	///
	/// Returns the number of entries loaded. Calling it again only reloads.
	pub async fn start(&self) -> EngineResult<usize> {
		let loaded = self.cache.warm().await?;
		if loaded > 0 {
			log::info!("Loaded {loaded} cached links from storage");
		}

		let mut sweeper = self.sweeper.lock().await;
		if sweeper.as_ref().is_none_or(CacheSweeper::is_finished) {
			*sweeper = Some(self.cache.spawn_sweeper(self.config.sweep_interval));
		}
		Ok(loaded)
	}

	/// Stop the sweeper. Resolutions keep working afterwards.
	pub async fn shutdown(&self) {
		let sweeper = self.sweeper.lock().await.take();
		if let Some(sweeper) = sweeper {
			sweeper.shutdown().await;
			log::debug!("Cache sweeper stopped");
		}
	}

	pub async fn clear_cache(&self) {
		self.cache.clear().await;
	}

	fn deny(&self, request: &LinkRequest, reason: String) -> BypassResult {
		log::info!("Denied {}: {reason}", request.raw_url());
		self.events.dispatch(BypassEvent::Denied(DeniedEvent {
			url: request.raw_url().to_string(),
			requester: request.requester().to_string(),
			reason: reason.clone(),
			timestamp: Utc::now(),
		}));
		BypassResult::Denied { reason }
	}

	fn report(&self, key: &NormalizedKey, result: &BypassResult, role: FlightRole, started: Instant) {
		let key = key.to_string();
		let timestamp = Utc::now();
		if role == FlightRole::Waiter {
			self.events.dispatch(BypassEvent::Coalesced(CoalescedEvent {
				key: key.clone(),
				timestamp,
			}));
		}

		let event = match result {
			BypassResult::Resolved {
				final_url,
				method,
				cached: true,
			} => BypassEvent::CacheHit(CacheHitEvent {
				key,
				final_url: final_url.clone(),
				method: method.clone(),
				timestamp,
			}),
			BypassResult::Resolved { final_url, method, .. } => BypassEvent::Resolved(ResolvedEvent {
				key,
				final_url: final_url.clone(),
				method: method.clone(),
				elapsed: started.elapsed(),
				timestamp,
			}),
			BypassResult::Unresolved { diagnostics } => BypassEvent::Unresolved(UnresolvedEvent {
				key,
				diagnostics: diagnostics.clone(),
				elapsed: started.elapsed(),
				timestamp,
			}),
			BypassResult::Denied { .. } => return,
		};
		self.events.dispatch(event);
	}
}

impl std::fmt::Debug for BypassManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BypassManager")
			.field("policy", &self.policy)
			.field("cache", &self.cache)
			.field("strategies", &self.cascade.len())
			.field("in_flight", &self.flights.in_flight())
			.finish()
	}
}

/// Leader side of a flight. The cache is checked again because a flight for
/// the same key may have completed after the caller's own lookup.
async fn resolve_uncached(
	cache: Arc<ResultCache>,
	cascade: Arc<Cascade>,
	key: NormalizedKey,
	url: Url,
	requester: String,
) -> BypassResult {
	if let Some(entry) = cache.get(&key) {
		return BypassResult::Resolved {
			final_url: entry.final_url,
			method: entry.method,
			cached: true,
		};
	}

	let report = cascade.run(&url, Some(&requester)).await;
	match report.outcome {
		StrategyOutcome::Resolved {
			final_url, method, ..
		} => {
			cache.put(key, cache.entry_for(&final_url, &method)).await;
			BypassResult::Resolved {
				final_url,
				method,
				cached: false,
			}
		}
		_ => BypassResult::Unresolved {
			diagnostics: report.diagnostics(),
		},
	}
}

fn default_strategies(
	config: &EngineConfig,
	fetcher: Option<Arc<dyn PageFetcher>>,
	interpreter: Option<Arc<dyn JavascriptInterpreter>>,
	model: Option<Arc<dyn LanguageModel>>,
	browser: Option<Arc<dyn BrowserDriver>>,
) -> EngineResult<Vec<Arc<dyn Strategy>>> {
	let fetcher: Arc<dyn PageFetcher> = match fetcher {
		Some(fetcher) => fetcher,
		None => Arc::new(ReqwestPageFetcher::new(FetcherOptions {
			timeout: config.request_timeout,
			..FetcherOptions::default()
		})?),
	};
	let interpreter: Arc<dyn JavascriptInterpreter> = match interpreter {
		Some(interpreter) => interpreter,
		None => Arc::new(BoaJavascriptInterpreter::new()),
	};
	let model = match model {
		Some(model) => Some(model),
		None => default_model(config)?,
	};
	let browser = browser.or_else(|| default_browser(config));
	let budget = |default: Duration| config.strategy_timeout.unwrap_or(default);

	let strategies: Vec<Arc<dyn Strategy>> = vec![
		Arc::new(StaticHtmlStrategy::new(Arc::clone(&fetcher)).with_timeout(budget(static_html::DEFAULT_TIMEOUT))),
		Arc::new(CssHiddenStrategy::new(Arc::clone(&fetcher)).with_timeout(budget(css_hidden::DEFAULT_TIMEOUT))),
		Arc::new(
			JavascriptStrategy::new(Arc::clone(&fetcher))
				.with_interpreter(Arc::clone(&interpreter))
				.with_timeout(budget(javascript::DEFAULT_TIMEOUT)),
		),
		Arc::new(
			AntiBotStrategy::new(Arc::clone(&fetcher))
				.with_interpreter(interpreter)
				.with_timeout(budget(anti_bot::DEFAULT_TIMEOUT)),
		),
		Arc::new(BrowserStrategy::new(browser).with_timeout(browser_budget(config))),
		Arc::new(
			AiAssistedStrategy::new(fetcher, model)
				.with_html_budget(config.html_budget)
				.with_timeout(budget(ai_assisted::DEFAULT_TIMEOUT)),
		),
	];
	Ok(strategies)
}

fn default_model(config: &EngineConfig) -> EngineResult<Option<Arc<dyn LanguageModel>>> {
	let Some(api_key) = &config.openai_api_key else {
		return Ok(None);
	};
	let mut provider = OpenAiProvider::with_config(api_key.clone(), config.model.clone())?;
	if let Some(base_url) = &config.openai_base_url {
		provider = provider.with_base_url(base_url.clone());
	}
	Ok(Some(Arc::new(provider)))
}

/// The browser attempt follows `browser_timeout` unless every strategy is
/// given the same budget.
fn browser_budget(config: &EngineConfig) -> Duration {
	config.strategy_timeout.unwrap_or(config.browser_timeout)
}

#[cfg(feature = "browser")]
fn default_browser(config: &EngineConfig) -> Option<Arc<dyn BrowserDriver>> {
	use crate::external_deps::browser::{BrowserOptions, ChromiumDriver};

	Some(Arc::new(ChromiumDriver::new(BrowserOptions {
		navigation_timeout: config.browser_timeout.min(browser_budget(config)),
		..BrowserOptions::default()
	})))
}

#[cfg(not(feature = "browser"))]
fn default_browser(_config: &EngineConfig) -> Option<Arc<dyn BrowserDriver>> {
	None
}
