//! Headless Chrome pages over the DevTools protocol.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::browser::{Browser, BrowserError, LaunchError, NavigateOptions, Page, WaitUntil};
use crate::config::CrawlerConfig;

const IDLE_POLL: Duration = Duration::from_millis(250);

pub struct ChromeBrowser {
    inner: Mutex<chromiumoxide::Browser>,
    handler: JoinHandle<()>,
}

impl ChromeBrowser {
    pub async fn launch(config: &CrawlerConfig) -> Result<Self, LaunchError> {
        let browser_cfg = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg(format!("--user-agent={}", config.user_agent))
            .request_timeout(config.request_timeout())
            .build()
            .map_err(LaunchError::Config)?;

        let (browser, mut handler) = chromiumoxide::Browser::launch(browser_cfg)
            .await
            .map_err(|e| LaunchError::Engine(e.to_string()))?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Self {
            inner: Mutex::new(browser),
            handler,
        })
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn open_page(&self) -> Result<Box<dyn Page>, BrowserError> {
        let page = self.inner.lock().await.new_page("about:blank").await.map_err(cdp)?;
        Ok(Box::new(ChromePage { page: Some(page) }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let res = self.inner.lock().await.close().await.map(|_| ()).map_err(cdp);
        self.handler.abort();
        res
    }
}

struct ChromePage {
    page: Option<chromiumoxide::Page>,
}

impl ChromePage {
    fn page(&self) -> Result<&chromiumoxide::Page, BrowserError> {
        self.page
            .as_ref()
            .ok_or_else(|| BrowserError::Engine("page already closed".into()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, js: String) -> Result<T, BrowserError> {
        self.page()?
            .evaluate(js)
            .await
            .map_err(cdp)?
            .into_value::<T>()
            .map_err(|e| BrowserError::Engine(format!("unexpected script result: {e}")))
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn navigate(
        &mut self,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<(), BrowserError> {
        let page = self.page()?;
        timeout(options.timeout, async {
            page.goto(url).await?;
            if options.wait_until == WaitUntil::Load {
                page.wait_for_navigation().await?;
            }
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| BrowserError::Timeout(options.timeout))?
        .map_err(cdp)
    }

    /// Polls until no resource has finished loading for one poll interval.
    async fn wait_for_idle(&mut self) -> Result<(), BrowserError> {
        let count = "performance.getEntriesByType('resource').length".to_string();
        let mut previous: u64 = self.eval(count.clone()).await?;
        loop {
            tokio::time::sleep(IDLE_POLL).await;
            let ready: bool = self.eval("document.readyState === 'complete'".into()).await?;
            let current: u64 = self.eval(count.clone()).await?;
            if ready && current == previous {
                return Ok(());
            }
            previous = current;
        }
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError> {
        let quoted = serde_json::to_string(selector)
            .map_err(|e| BrowserError::Selector(format!("{selector}: {e}")))?;
        let js = format!("document.querySelector({quoted}) !== null");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found: bool = self.eval(js.clone()).await?;
            if found {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        self.page()?.content().await.map_err(cdp)
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        self.page()?
            .url()
            .await
            .map_err(cdp)?
            .ok_or_else(|| BrowserError::Engine("page has no url".into()))
    }

    async fn scroll_to_bottom(&mut self) -> Result<u64, BrowserError> {
        self.eval(
            "(() => { window.scrollTo(0, document.body.scrollHeight); \
             return document.body.scrollHeight; })()"
                .into(),
        )
        .await
    }

    async fn click(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let quoted = serde_json::to_string(selector)
            .map_err(|e| BrowserError::Selector(format!("{selector}: {e}")))?;
        let js = format!(
            "(() => {{ const el = document.querySelector({quoted}); \
             if (!el || el.disabled || el.getAttribute('aria-disabled') === 'true' \
                 || el.classList.contains('disabled')) return false; \
             el.click(); return true; }})()"
        );
        let clicked: bool = self.eval(js).await?;
        if clicked {
            // Not every next control triggers a navigation, some only swap content.
            let _ = timeout(Duration::from_secs(10), self.page()?.wait_for_navigation()).await;
        }
        Ok(clicked)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        match self.page.take() {
            Some(page) => page.close().await.map_err(cdp),
            None => Ok(()),
        }
    }
}

fn cdp(e: chromiumoxide::error::CdpError) -> BrowserError {
    BrowserError::Engine(e.to_string())
}
