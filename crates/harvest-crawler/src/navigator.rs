use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::browser::{Browser, BrowserError, NavigateOptions, Page};
use crate::config::CrawlerConfig;
use crate::retry::{retry, RetryBudget};

const SELECTOR_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("couldn't load {url} got: {last_error}")]
pub struct NavigationError {
    pub url: String,
    pub last_error: BrowserError,
}

/// Opens pages and loads URLs into them with bounded retries.
#[derive(Clone)]
pub struct Navigator {
    browser: Arc<dyn Browser>,
    options: NavigateOptions,
    ready_timeout: Duration,
    budget: RetryBudget,
    cancel: CancellationToken,
}

impl Navigator {
    pub fn new(browser: Arc<dyn Browser>, config: &CrawlerConfig, cancel: CancellationToken) -> Self {
        Self {
            browser,
            options: config.navigate_options(),
            ready_timeout: config.ready_timeout(),
            budget: config.nav_budget(),
            cancel,
        }
    }

    pub fn browser(&self) -> &Arc<dyn Browser> {
        &self.browser
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Loads `url` in a fresh page, using the configured number of attempts.
    /// When `ready` is set the page is also given time to show that element.
    pub async fn goto(
        &self,
        url: &str,
        ready: Option<&str>,
    ) -> Result<Box<dyn Page>, NavigationError> {
        self.goto_with(url, ready, self.budget).await
    }

    /// Each attempt opens its own page and closes it when the load fails, the
    /// returned page belongs to the caller.
    pub async fn goto_with(
        &self,
        url: &str,
        ready: Option<&str>,
        budget: RetryBudget,
    ) -> Result<Box<dyn Page>, NavigationError> {
        let label = format!("Navigate {url}");
        retry(budget, &self.cancel, &label, move |attempt| async move {
            log::debug!("Navigating to {url} (attempt {attempt})");
            let mut page = self.browser.open_page().await?;
            match page.navigate(url, &self.options).await {
                Ok(()) => {
                    self.settle(page.as_mut(), ready).await;
                    Ok(page)
                }
                Err(e) => {
                    close_page(page.as_mut(), url).await;
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| {
            let cancelled = e.is_cancelled();
            let last_error = e.into_last();
            NavigationError {
                url: url.to_string(),
                last_error: if cancelled {
                    BrowserError::Cancelled
                } else {
                    last_error
                },
            }
        })
    }

    /// Waits for the page to go quiet, then for `ready` to show up. Running
    /// out of time only degrades the page.
    pub async fn settle(&self, page: &mut dyn Page, ready: Option<&str>) {
        match timeout(self.ready_timeout, page.wait_for_idle()).await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => log::warn!("Readiness wait failed, proceeding with the page as is: {e}"),
            Err(_) => log::warn!(
                "Page not idle after {:?}, proceeding with the page as is",
                self.ready_timeout
            ),
        }

        let Some(selector) = ready else {
            return;
        };
        // The outer bound covers backends that overrun their own deadline.
        let wait = page.wait_for_selector(selector, self.ready_timeout);
        match timeout(self.ready_timeout + SELECTOR_GRACE, wait).await {
            Ok(Ok(true)) => (),
            Ok(Ok(false)) | Err(_) => log::warn!(
                "No {selector} after {:?}, proceeding with the page as is",
                self.ready_timeout
            ),
            Ok(Err(e)) => log::warn!("Waiting for {selector} failed, proceeding with the page as is: {e}"),
        }
    }
}

/// Close errors are logged only: the page is gone from our side either way.
pub async fn close_page(page: &mut dyn Page, url: &str) {
    if let Err(e) = page.close().await {
        log::warn!("Couldn't close page for {url}: {e}");
    }
}
