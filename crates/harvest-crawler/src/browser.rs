//! The narrow browser surface the pipeline drives.
//!
//! A [`Browser`] only spawns pages. Every [`Page`] is owned by the task that
//! opened it and must be closed by that task on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid selector {0}")]
    Selector(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Engine(String),
}

/// The browser engine itself could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("couldn't build http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid browser configuration: {0}")]
    Config(String),

    #[error("couldn't launch browser: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    Load,
    NetworkIdle,
}

#[derive(Debug, Clone, Copy)]
pub struct NavigateOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::NetworkIdle,
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn Page>, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait Page: Send {
    async fn navigate(&mut self, url: &str, options: &NavigateOptions)
        -> Result<(), BrowserError>;

    /// Resolves once network activity is quiescent. Callers bound it with a timeout.
    async fn wait_for_idle(&mut self) -> Result<(), BrowserError>;

    /// Waits up to `timeout` for an element matching `selector`. Returns
    /// `false` when none showed up in time.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError>;

    /// The current DOM serialized as HTML.
    async fn content(&mut self) -> Result<String, BrowserError>;

    async fn current_url(&mut self) -> Result<String, BrowserError>;

    /// Scrolls to the current bottom and returns the scroll extent.
    async fn scroll_to_bottom(&mut self) -> Result<u64, BrowserError>;

    /// Clicks the first element matching `selector` and waits for the resulting
    /// navigation. Returns `false` when the element is absent or disabled.
    async fn click(&mut self, selector: &str) -> Result<bool, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}
