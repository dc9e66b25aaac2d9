//! Engine configuration.
//!
//! [`EngineConfig`] carries every tunable of the engine with sensible
//! defaults. It can be filled from the process environment with
//! [`EngineConfig::from_env`], or adjusted through the manager builder.
//!
//! Recognised variables:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `BYPASS_CACHE_TTL_SECS` | result cache time-to-live |
//! | `BYPASS_SWEEP_INTERVAL_SECS` | period of the expired-entry sweeper |
//! | `BYPASS_REQUEST_TIMEOUT` | HTTP request timeout, seconds |
//! | `BYPASS_STRATEGY_TIMEOUT` | attempt budget applied to every strategy |
//! | `BYPASS_BROWSER_TIMEOUT` | browser attempt budget and navigation timeout |
//! | `BYPASS_CACHE_PATH` | redb file backing the cache |
//! | `BYPASS_POLICY_MODE` | `open` or `allow_list` |
//! | `BYPASS_HTML_BUDGET` | HTML characters sent to the language model |
//! | `BYPASS_AI_MAX_TOKENS` / `BYPASS_AI_TEMPERATURE` | generation settings |
//! | `OPENAI_API_KEY` / `OPENAI_MODEL` / `OPENAI_BASE_URL` | language model endpoint |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::cache::DEFAULT_TTL;
use crate::external_deps::llm::ModelConfig;
use crate::policy::PolicyMode;
use crate::strategies::ai_assisted::DEFAULT_HTML_BUDGET;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    /// Optional redb file mirroring the cache.
    pub cache_path: Option<PathBuf>,
    pub request_timeout: Duration,
    /// When set, replaces the attempt budget of every strategy.
    pub strategy_timeout: Option<Duration>,
    /// Budget of the browser attempt. Page navigation never waits longer
    /// than the attempt itself.
    pub browser_timeout: Duration,
    pub policy_mode: PolicyMode,
    pub html_budget: usize,
    pub model: ModelConfig,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub enable_metrics: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            sweep_interval: Duration::from_secs(60 * 60),
            cache_path: None,
            request_timeout: Duration::from_secs(30),
            strategy_timeout: None,
            browser_timeout: Duration::from_secs(60),
            policy_mode: PolicyMode::Open,
            html_budget: DEFAULT_HTML_BUDGET,
            model: ModelConfig::default(),
            openai_api_key: None,
            openai_base_url: None,
            enable_metrics: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(ttl) = seconds(&get, "BYPASS_CACHE_TTL_SECS")? {
            config.cache_ttl = ttl;
        }
        if let Some(interval) = seconds(&get, "BYPASS_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = interval;
        }
        if let Some(timeout) = seconds(&get, "BYPASS_REQUEST_TIMEOUT")? {
            config.request_timeout = timeout;
        }
        if let Some(timeout) = seconds(&get, "BYPASS_STRATEGY_TIMEOUT")? {
            config.strategy_timeout = Some(timeout);
        }
        if let Some(timeout) = seconds(&get, "BYPASS_BROWSER_TIMEOUT")? {
            config.browser_timeout = timeout;
        }
        if let Some(path) = get("BYPASS_CACHE_PATH") {
            config.cache_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = get("BYPASS_POLICY_MODE") {
            config.policy_mode = parse_policy_mode(&mode)?;
        }
        if let Some(budget) = parsed::<usize, _>(&get, "BYPASS_HTML_BUDGET")? {
            if budget == 0 {
                return Err(ConfigError::invalid("BYPASS_HTML_BUDGET", "0", "must be positive"));
            }
            config.html_budget = budget;
        }
        if let Some(tokens) = parsed::<u32, _>(&get, "BYPASS_AI_MAX_TOKENS")? {
            config.model.max_tokens = tokens;
        }
        if let Some(temperature) = parsed::<f32, _>(&get, "BYPASS_AI_TEMPERATURE")? {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::invalid(
                    "BYPASS_AI_TEMPERATURE",
                    &temperature.to_string(),
                    "must be between 0 and 2",
                ));
            }
            config.model.temperature = temperature;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            config.model.model = model;
        }
        config.openai_api_key = get("OPENAI_API_KEY");
        if let Some(base_url) = get("OPENAI_BASE_URL") {
            url::Url::parse(&base_url)
                .map_err(|err| ConfigError::invalid("OPENAI_BASE_URL", &base_url, err.to_string()))?;
            config.openai_base_url = Some(base_url);
        }

        Ok(config)
    }
}

fn parsed<T, F>(get: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| ConfigError::invalid(key, &raw, err.to_string()))
        })
        .transpose()
}

fn seconds<F>(get: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parsed::<u64, _>(get, key)? {
        Some(0) => Err(ConfigError::invalid(key, "0", "must be at least one second")),
        other => Ok(other.map(Duration::from_secs)),
    }
}

fn parse_policy_mode(raw: &str) -> Result<PolicyMode, ConfigError> {
    match raw.to_ascii_lowercase().replace('-', "_").as_str() {
        "open" => Ok(PolicyMode::Open),
        "allow_list" | "allowlist" | "allow_list_only" => Ok(PolicyMode::AllowListOnly),
        _ => Err(ConfigError::invalid(
            "BYPASS_POLICY_MODE",
            raw,
            "expected 'open' or 'allow_list'",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cache_ttl, Duration::from_secs(604_800));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.browser_timeout, Duration::from_secs(60));
        assert_eq!(config.strategy_timeout, None);
        assert_eq!(config.html_budget, 8000);
        assert_eq!(config.model.model, "gpt-4o-mini");
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("BYPASS_CACHE_TTL_SECS", "3600"),
            ("BYPASS_REQUEST_TIMEOUT", " 10 "),
            ("BYPASS_STRATEGY_TIMEOUT", "12"),
            ("BYPASS_CACHE_PATH", "/var/lib/bypass/cache.redb"),
            ("BYPASS_POLICY_MODE", "allow-list"),
            ("BYPASS_AI_TEMPERATURE", "0.1"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL", "gpt-4o"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1"),
            ("BYPASS_BROWSER_TIMEOUT", ""),
        ]))
        .unwrap();

        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.strategy_timeout, Some(Duration::from_secs(12)));
        assert_eq!(config.browser_timeout, Duration::from_secs(60));
        assert_eq!(config.cache_path, Some(PathBuf::from("/var/lib/bypass/cache.redb")));
        assert_eq!(config.policy_mode, PolicyMode::AllowListOnly);
        assert_eq!(config.model.model, "gpt-4o");
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.openai_base_url.as_deref(), Some("http://localhost:8080/v1"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("BYPASS_CACHE_TTL_SECS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "BYPASS_CACHE_TTL_SECS", .. }
        ));

        assert!(EngineConfig::from_lookup(lookup(&[("BYPASS_REQUEST_TIMEOUT", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("BYPASS_POLICY_MODE", "closed")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("BYPASS_AI_TEMPERATURE", "7")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("OPENAI_BASE_URL", "not a url")])).is_err());
    }
}
