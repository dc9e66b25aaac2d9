//! Page fetching abstraction and its reqwest implementation.
//!
//! Strategies only see [`PageFetcher`]; tests substitute canned pages and the
//! anti-bot strategy asks for a fresh cookie session per attempt.

use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use reqwest::{Client, redirect::Policy};
use thiserror::Error;
use url::Url;

use super::profile;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Failures that say the environment is broken rather than the page.
    /// These abort a cascade instead of letting the next strategy run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::Timeout)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() {
            FetchError::Unreachable(err.to_string())
        } else if err.is_builder() {
            FetchError::InvalidRequest(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Outgoing request description.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub form: Option<Vec<(String, String)>>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            form: None,
        }
    }

    pub fn submit_form(method: Method, url: Url, fields: Vec<(String, String)>) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            form: Some(fields),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Response as seen by the strategies. `url` is the address after redirects.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        StatusCode::from_u16(self.status).is_ok_and(|status| status.is_success())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError>;

    /// Fetcher with its own cookie jar, owned by a single attempt.
    ///
    /// `None` means the implementation has no session notion and the caller
    /// should keep using `self`.
    fn session(&self) -> Result<Option<Box<dyn PageFetcher>>, FetchError> {
        Ok(None)
    }
}

/// Transport settings for [`ReqwestPageFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Add a rotated browser header profile to requests that carry no
    /// `User-Agent` of their own.
    pub browser_profile: bool,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            browser_profile: true,
        }
    }
}

/// Reqwest-backed fetcher. Redirects are followed so `FetchedPage::url`
/// reports the landing address.
#[derive(Debug, Clone)]
pub struct ReqwestPageFetcher {
    client: Client,
    options: FetcherOptions,
}

impl ReqwestPageFetcher {
    pub fn new(options: FetcherOptions) -> Result<Self, FetchError> {
        let client = build_client(&options, false)?;
        Ok(Self { client, options })
    }

    /// Wrap an existing reqwest client.
    pub fn from_client(client: Client, options: FetcherOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &FetcherOptions {
        &self.options
    }
}

fn build_client(options: &FetcherOptions, cookies: bool) -> Result<Client, FetchError> {
    Client::builder()
        .redirect(Policy::limited(options.max_redirects))
        .timeout(options.timeout)
        .cookie_store(cookies)
        .build()
        .map_err(|err| FetchError::InvalidRequest(err.to_string()))
}

#[async_trait]
impl PageFetcher for ReqwestPageFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedPage, FetchError> {
        let FetchRequest {
            method,
            url,
            mut headers,
            form,
        } = request;

        if self.options.browser_profile && !headers.contains_key(http::header::USER_AGENT) {
            for (name, value) in profile::browser_headers(profile::random_user_agent()).iter() {
                if !headers.contains_key(name) {
                    headers.insert(name.clone(), value.clone());
                }
            }
        }

        let mut builder = self.client.request(method, url.as_str()).headers(headers);
        if let Some(fields) = form.as_ref() {
            builder = builder.form(fields);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let response_headers = response.headers().clone();
        let body = response.text().await?;

        Ok(FetchedPage {
            status,
            url: final_url,
            headers: response_headers,
            body,
        })
    }

    fn session(&self) -> Result<Option<Box<dyn PageFetcher>>, FetchError> {
        let client = build_client(&self.options, true)?;
        Ok(Some(Box::new(ReqwestPageFetcher {
            client,
            options: self.options.clone(),
        })))
    }
}
