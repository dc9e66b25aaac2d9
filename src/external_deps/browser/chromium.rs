//! Chromium sessions through chromiumoxide.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::{BrowserDriver, BrowserError, BrowserOptions, BrowserSession};

/// Launches one headless Chromium per session so attempts never share
/// cookies, storage or open tabs.
#[derive(Debug, Clone, Default)]
pub struct ChromiumDriver {
    options: BrowserOptions,
}

impl ChromiumDriver {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }

    fn config(&self) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-blink-features=AutomationControlled")
            .request_timeout(self.options.navigation_timeout);

        if let Some(path) = &self.options.executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(agent) = &self.options.user_agent {
            builder = builder.arg(format!("--user-agent={agent}"));
        }

        builder.build().map_err(BrowserError::Unavailable)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let (browser, mut handler) = Browser::launch(self.config()?)
            .await
            .map_err(|err| BrowserError::Unavailable(err.to_string()))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    log::trace!("Chromium event error: {err}");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                events.abort();
                return Err(BrowserError::Unavailable(err.to_string()));
            }
        };

        Ok(Box::new(ChromiumSession {
            browser: Some(browser),
            page,
            events,
            timeout: self.options.navigation_timeout,
        }))
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    page: Page,
    events: JoinHandle<()>,
    timeout: std::time::Duration,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        match tokio::time::timeout(self.timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {
                let waited = tokio::time::timeout(self.timeout, self.page.wait_for_navigation())
                    .await
                    .ok();
                if let Some(note) = settle_failure(waited, self.timeout) {
                    log::debug!("{url}: {note}");
                }
                Ok(())
            }
            Ok(Err(err)) => Err(BrowserError::Navigation(err.to_string())),
            Err(_) => Err(BrowserError::Timeout(self.timeout)),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.page
            .url()
            .await
            .map(Option::unwrap_or_default)
            .map_err(|err| BrowserError::Other(err.to_string()))
    }

    async fn close(mut self: Box<Self>) -> Result<(), BrowserError> {
        if let Err(err) = self.page.clone().close().await {
            log::debug!("Chromium page close failed: {err}");
        }
        if let Some(mut browser) = self.browser.take() {
            if let Err(err) = browser.close().await {
                log::debug!("Chromium close failed: {err}");
            }
            if let Err(err) = browser.wait().await {
                log::debug!("Chromium process wait failed: {err}");
            }
        }
        self.events.abort();
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        // Dropping `Browser` kills the child process; the event loop has to
        // go as well.
        self.events.abort();
    }
}

/// Log line for a post-navigation wait that did not complete. `None` in
/// `waited` means the wait timed out.
fn settle_failure<T, E: std::fmt::Display>(
    waited: Option<Result<T, E>>,
    timeout: std::time::Duration,
) -> Option<String> {
    match waited {
        Some(Ok(_)) => None,
        Some(Err(err)) => Some(format!("navigation did not settle: {err}")),
        None => Some(format!(
            "page still loading after {:.1}s",
            timeout.as_secs_f64()
        )),
    }
}
