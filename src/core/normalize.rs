//! URL canonicalisation used for cache and in-flight identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Canonical form of a link. Two links that lead to the same bypass normalise
/// to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("invalid url: {0}")]
    Invalid(String),
    #[error("unsupported scheme '{0}', only http and https are accepted")]
    UnsupportedScheme(String),
    #[error("url has no host")]
    MissingHost,
}

/// Parse a raw link, rejecting anything that is not an absolute http(s) URL
/// with a host.
pub fn parse_link(raw: &str) -> Result<Url, NormalizeError> {
    let url = Url::parse(raw.trim()).map_err(|err| NormalizeError::Invalid(err.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(NormalizeError::UnsupportedScheme(other.to_string())),
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(NormalizeError::MissingHost);
    }

    Ok(url)
}

/// Compute the [`NormalizedKey`] of a raw link.
///
/// Rules: scheme and host lowercased, default ports dropped, fragment removed,
/// trailing slash removed from non-root paths. Query strings and path case are
/// preserved. The function is idempotent.
pub fn normalize(raw: &str) -> Result<NormalizedKey, NormalizeError> {
    let url = parse_link(raw)?;
    Ok(normalize_url(&url))
}

/// Same as [`normalize`] for an already parsed URL.
pub fn normalize_url(url: &Url) -> NormalizedKey {
    let mut url = url.clone();

    // `Url` already lowercases scheme/host and elides the default port of
    // special schemes; the explicit calls keep the rules visible.
    if let Some(host) = url.host_str() {
        let lowered = host.to_ascii_lowercase();
        if lowered != host {
            let _ = url.set_host(Some(&lowered));
        }
    }
    if matches!(
        (url.scheme(), url.port()),
        ("http", Some(80)) | ("https", Some(443))
    ) {
        let _ = url.set_port(None);
    }

    url.set_fragment(None);

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed }.to_string();
        url.set_path(&trimmed);
    }

    NormalizedKey(url.to_string())
}
