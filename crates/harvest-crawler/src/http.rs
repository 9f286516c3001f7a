//! Plain HTTP pages: a GET per navigation, no script execution.

use std::io::prelude::*;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::header::CONTENT_TYPE;
use scraper::{Html, Selector};
use tokio::time::timeout;
use url::Url;

use crate::browser::{Browser, BrowserError, LaunchError, NavigateOptions, Page};
use crate::config::CrawlerConfig;

pub struct HttpBrowser {
    client: reqwest::Client,
    options: NavigateOptions,
}

impl HttpBrowser {
    pub fn launch(config: &CrawlerConfig) -> Result<Self, LaunchError> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .deflate(true)
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            options: config.navigate_options(),
        })
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn open_page(&self) -> Result<Box<dyn Page>, BrowserError> {
        Ok(Box::new(HttpPage {
            client: self.client.clone(),
            options: self.options,
            url: None,
            body: String::new(),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

struct HttpPage {
    client: reqwest::Client,
    /// Used for navigations the page starts itself, such as following a click
    options: NavigateOptions,
    url: Option<Url>,
    body: String,
}

impl HttpPage {
    async fn download(&self, url: &str) -> Result<(Url, String), BrowserError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let final_url = resp.url().clone();

        let body = match resp.headers().get(CONTENT_TYPE) {
            Some(c) if c == "application/x-gzip" || c == "application/gzip" => {
                let compressed = resp.bytes().await?;
                let mut gz = GzDecoder::new(&compressed[..]);
                let mut body = String::new();
                gz.read_to_string(&mut body)?;
                body
            }
            _ => resp.text().await?,
        };

        Ok((final_url, body))
    }
}

#[async_trait]
impl Page for HttpPage {
    async fn navigate(
        &mut self,
        url: &str,
        options: &NavigateOptions,
    ) -> Result<(), BrowserError> {
        let (final_url, body) = timeout(options.timeout, self.download(url))
            .await
            .map_err(|_| BrowserError::Timeout(options.timeout))??;
        self.url = Some(final_url);
        self.body = body;
        Ok(())
    }

    async fn wait_for_idle(&mut self) -> Result<(), BrowserError> {
        Ok(())
    }

    /// The body never changes after the download, one look is enough.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, BrowserError> {
        has_match(&self.body, selector)
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.body.clone())
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        self.url
            .as_ref()
            .map(Url::to_string)
            .ok_or_else(|| BrowserError::Engine("page was never navigated".into()))
    }

    async fn scroll_to_bottom(&mut self) -> Result<u64, BrowserError> {
        Ok(self.body.len() as u64)
    }

    async fn click(&mut self, selector: &str) -> Result<bool, BrowserError> {
        match follow_target(&self.body, self.url.as_ref(), selector)? {
            Some(href) => {
                let options = self.options;
                self.navigate(&href, &options).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.body.clear();
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, BrowserError> {
    Selector::parse(selector).map_err(|e| BrowserError::Selector(format!("{selector}: {e:?}")))
}

pub(crate) fn has_match(body: &str, selector: &str) -> Result<bool, BrowserError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(body);
    let found = document.select(&parsed).next().is_some();
    Ok(found)
}

/// A class marks a control as disabled when it is `disabled` or ends in
/// `-disabled` (`is-disabled`, `pager-disabled`).
fn disabled_class(class: &str) -> bool {
    class == "disabled" || class.ends_with("-disabled")
}

/// The absolute `href` a click on `selector` would follow, `None` when the
/// element is missing, disabled or not a link.
pub(crate) fn follow_target(
    body: &str,
    base: Option<&Url>,
    selector: &str,
) -> Result<Option<String>, BrowserError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(body);
    let Some(elem) = document.select(&parsed).next() else {
        return Ok(None);
    };

    let value = elem.value();
    let disabled = value.attr("disabled").is_some()
        || value.attr("aria-disabled") == Some("true")
        || value.classes().any(disabled_class);
    if disabled {
        return Ok(None);
    }

    let Some(href) = value.attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(None);
    };
    if href.starts_with('#') || href.starts_with("javascript:") {
        return Ok(None);
    }

    let target = match base {
        Some(base) => base
            .join(href)
            .map_err(|source| BrowserError::Url {
                url: href.to_string(),
                source,
            })?
            .to_string(),
        None => href.to_string(),
    };
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGER: &str = r#"
        <html><body>
          <a class="next" href="/list?page=2">Next</a>
          <a class="prev disabled" href="/list?page=0">Prev</a>
          <button id="more" disabled>More</button>
        </body></html>"#;

    #[test]
    fn follows_relative_next_link() {
        let base = Url::parse("https://shop.test/list?page=1").unwrap();
        let target = follow_target(PAGER, Some(&base), "a.next").unwrap();
        assert_eq!(target.as_deref(), Some("https://shop.test/list?page=2"));
    }

    #[test]
    fn disabled_or_missing_controls_are_not_followed() {
        let base = Url::parse("https://shop.test/list").unwrap();
        assert_eq!(follow_target(PAGER, Some(&base), "a.prev").unwrap(), None);
        assert_eq!(follow_target(PAGER, Some(&base), "#more").unwrap(), None);
        assert_eq!(follow_target(PAGER, Some(&base), "a.missing").unwrap(), None);
    }

    #[test]
    fn disabled_class_must_be_a_whole_word() {
        let pager = r#"
            <a class="next not-disabled" href="/list?page=2">Next</a>
            <a class="undisabled more" href="/list?page=3">More</a>
            <a class="btn is-disabled" href="/list?page=4">Last</a>"#;
        let base = Url::parse("https://shop.test/list").unwrap();
        assert_eq!(
            follow_target(pager, Some(&base), "a.next").unwrap().as_deref(),
            Some("https://shop.test/list?page=2")
        );
        assert_eq!(
            follow_target(pager, Some(&base), "a.more").unwrap().as_deref(),
            Some("https://shop.test/list?page=3")
        );
        assert_eq!(follow_target(pager, Some(&base), "a.btn").unwrap(), None);
    }

    #[test]
    fn selector_wait_looks_at_the_body() {
        assert!(has_match(PAGER, "a.next").unwrap());
        assert!(!has_match(PAGER, "div.products").unwrap());
        assert!(has_match(PAGER, "p[[").is_err());
    }

    #[test]
    fn pages_navigate_with_the_configured_timeout() {
        let config = CrawlerConfig {
            request_timeout_ms: 1_234,
            ..Default::default()
        };
        let browser = HttpBrowser::launch(&config).unwrap();
        assert_eq!(browser.options.timeout, Duration::from_millis(1_234));
    }

    #[test]
    fn invalid_selector_is_an_error() {
        assert!(matches!(
            follow_target(PAGER, None, "a[[["),
            Err(BrowserError::Selector(_))
        ));
    }
}
