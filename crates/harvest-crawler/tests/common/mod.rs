#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvest_crawler::{
    Browser, BrowserError, CancellationToken, Checkpoint, CrawlerConfig, ExtractionResult,
    ExtractionStatus, KnownKeys, ListingReference, NavigateOptions, Page, PersistenceError,
    Record, Scrapable, Strategy, WriteMode,
};

pub const SENTINEL: &str = "N/A";

/// No waiting anywhere, no signal handler.
pub fn fast_config() -> CrawlerConfig {
    CrawlerConfig {
        concurrency: 3,
        nav_attempts: 2,
        nav_retry_delay_ms: 0,
        item_attempts: 2,
        item_retry_delay_ms: 0,
        batch_delay_ms: 0,
        ready_timeout_ms: 1_000,
        handle_sigint: false,
        strategy: Strategy::Scroll {
            max_rounds: 20,
            settle_ms: 0,
        },
        ..Default::default()
    }
}

/// How `wait_for_idle` behaves on every page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Idle {
    #[default]
    Quiet,
    Hangs,
    Fails,
}

#[derive(Default)]
struct Site {
    bodies: HashMap<String, String>,
    next: HashMap<String, String>,
    extents: Vec<u64>,
    delay: Duration,
    idle: Idle,
    cancel_on: Option<(String, CancellationToken)>,
}

#[derive(Default)]
struct Counters {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opened: AtomicUsize,
    navigations: AtomicUsize,
    scrolls: AtomicUsize,
    selector_waits: AtomicUsize,
    browser_closed: AtomicUsize,
}

/// In-memory browser serving canned bodies by URL.
#[derive(Clone, Default)]
pub struct MockBrowser {
    site: Arc<Site>,
    failures: Arc<Mutex<HashMap<String, usize>>>,
    counters: Arc<Counters>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn site_mut(&mut self) -> &mut Site {
        Arc::get_mut(&mut self.site).expect("configure the mock before sharing it")
    }

    pub fn page(mut self, url: &str, body: impl Into<String>) -> Self {
        self.site_mut().bodies.insert(url.to_string(), body.into());
        self
    }

    /// A click on the current page of `from` lands on `to`.
    pub fn next(mut self, from: &str, to: &str) -> Self {
        self.site_mut().next.insert(from.to_string(), to.to_string());
        self
    }

    /// Successive scroll extents, the last one repeats.
    pub fn extents(mut self, extents: impl IntoIterator<Item = u64>) -> Self {
        self.site_mut().extents = extents.into_iter().collect();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.site_mut().delay = delay;
        self
    }

    pub fn idle(mut self, idle: Idle) -> Self {
        self.site_mut().idle = idle;
        self
    }

    /// Fires `token` when `url` starts loading.
    pub fn cancel_on(mut self, url: &str, token: CancellationToken) -> Self {
        self.site_mut().cancel_on = Some((url.to_string(), token));
        self
    }

    /// The next `times` loads of `url` fail.
    pub fn fail(self, url: &str, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    pub fn open_pages(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn max_open_pages(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }

    pub fn opened_pages(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.counters.navigations.load(Ordering::SeqCst)
    }

    pub fn scrolls(&self) -> usize {
        self.counters.scrolls.load(Ordering::SeqCst)
    }

    pub fn selector_waits(&self) -> usize {
        self.counters.selector_waits.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.counters.browser_closed.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn open_page(&self) -> Result<Box<dyn Page>, BrowserError> {
        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(open, Ordering::SeqCst);
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPage {
            browser: self.clone(),
            url: None,
            body: String::new(),
            scrolls: 0,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.counters.browser_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockPage {
    browser: MockBrowser,
    url: Option<String>,
    body: String,
    scrolls: usize,
    closed: bool,
}

#[async_trait]
impl Page for MockPage {
    async fn navigate(
        &mut self,
        url: &str,
        _options: &NavigateOptions,
    ) -> Result<(), BrowserError> {
        let site = &self.browser.site;
        self.browser
            .counters
            .navigations
            .fetch_add(1, Ordering::SeqCst);
        if let Some((target, token)) = &site.cancel_on {
            if target == url {
                token.cancel();
            }
        }
        if !site.delay.is_zero() {
            tokio::time::sleep(site.delay).await;
        }

        let failing = {
            let mut failures = self.browser.failures.lock().unwrap();
            match failures.get_mut(url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if failing {
            return Err(BrowserError::Engine(format!("injected failure for {url}")));
        }

        let body = site
            .bodies
            .get(url)
            .cloned()
            .ok_or_else(|| BrowserError::Engine(format!("404 for {url}")))?;
        self.url = Some(url.to_string());
        self.body = body;
        Ok(())
    }

    async fn wait_for_idle(&mut self) -> Result<(), BrowserError> {
        match self.browser.site.idle {
            Idle::Quiet => Ok(()),
            Idle::Hangs => std::future::pending().await,
            Idle::Fails => Err(BrowserError::Engine("network never settled".into())),
        }
    }

    /// An element "matches" when the body contains `selector` as text.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError> {
        self.browser
            .counters
            .selector_waits
            .fetch_add(1, Ordering::SeqCst);
        if self.body.contains(selector) {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(false)
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.body.clone())
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        self.url
            .clone()
            .ok_or_else(|| BrowserError::Engine("blank page".into()))
    }

    async fn scroll_to_bottom(&mut self) -> Result<u64, BrowserError> {
        self.browser.counters.scrolls.fetch_add(1, Ordering::SeqCst);
        let extents = &self.browser.site.extents;
        let extent = extents
            .get(self.scrolls.min(extents.len().saturating_sub(1)))
            .copied()
            .unwrap_or(0);
        self.scrolls += 1;
        Ok(extent)
    }

    async fn click(&mut self, _selector: &str) -> Result<bool, BrowserError> {
        let next = self
            .url
            .as_ref()
            .and_then(|url| self.browser.site.next.get(url))
            .cloned();
        match next {
            Some(next) => {
                self.navigate(&next, &NavigateOptions::default()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.closed {
            self.closed = true;
            self.browser.counters.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Reads line based pages.
///
/// Listing lines look like `link=<url>|name=<value>`, a `total=<n>` line gives
/// the page count. Detail lines are `key=value`, `spec:key=value` lines are
/// dynamic keys.
pub struct LineScraper;

impl Scrapable for LineScraper {
    fn listing(&self, html: &str, _page_url: &str) -> Vec<ListingReference> {
        html.lines()
            .filter_map(|line| line.trim().strip_prefix("link="))
            .map(|rest| {
                let mut parts = rest.split('|');
                let url = parts.next().unwrap_or_default();
                parts
                    .filter_map(|kv| kv.split_once('='))
                    .fold(ListingReference::new(url), |link, (k, v)| {
                        link.with_field(k, v)
                    })
            })
            .collect()
    }

    fn extract(&self, html: &str, _page_url: &str) -> ExtractionResult {
        let mut fields = BTreeMap::new();
        let mut dynamic_keys = BTreeSet::new();
        for line in html.lines().map(str::trim) {
            if line.starts_with("link=") || line.starts_with("total=") {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                if let Some(key) = k.strip_prefix("spec:") {
                    dynamic_keys.insert(key.to_string());
                    fields.insert(key.to_string(), v.to_string());
                } else {
                    fields.insert(k.to_string(), v.to_string());
                }
            }
        }

        let mut missing = 0;
        for key in self.expected_fields() {
            fields.entry(key).or_insert_with(|| {
                missing += 1;
                SENTINEL.to_string()
            });
        }
        let status = match missing {
            0 => ExtractionStatus::Ok,
            n if n == self.expected_fields().len() => ExtractionStatus::Failure,
            _ => ExtractionStatus::PartialFailure,
        };

        ExtractionResult {
            fields,
            dynamic_keys,
            status,
        }
    }

    fn expected_fields(&self) -> Vec<String> {
        vec!["name".to_string(), "price".to_string()]
    }

    fn total_pages(&self, html: &str, _items_on_page: usize) -> Option<usize> {
        html.lines()
            .find_map(|line| line.trim().strip_prefix("total="))
            .and_then(|n| n.parse().ok())
    }

    fn sentinel(&self) -> &str {
        SENTINEL
    }
}

/// [`LineScraper`] with ready elements and a derived `label` column.
pub struct ReadyScraper {
    pub listing: Option<&'static str>,
    pub detail: Option<&'static str>,
}

impl Scrapable for ReadyScraper {
    fn listing(&self, html: &str, page_url: &str) -> Vec<ListingReference> {
        LineScraper.listing(html, page_url)
    }

    fn extract(&self, html: &str, page_url: &str) -> ExtractionResult {
        LineScraper.extract(html, page_url)
    }

    fn expected_fields(&self) -> Vec<String> {
        LineScraper.expected_fields()
    }

    fn sentinel(&self) -> &str {
        SENTINEL
    }

    fn listing_ready(&self) -> Option<&str> {
        self.listing
    }

    fn detail_ready(&self) -> Option<&str> {
        self.detail
    }

    fn complete(&self, record: &mut Record) {
        let label = format!(
            "{} / {}",
            record.get("thumb").unwrap_or(SENTINEL),
            record.get("price").unwrap_or(SENTINEL)
        );
        record.fields.insert("label".to_string(), label);
    }
}

/// Keeps rows in memory the way a file would: create replaces, append extends.
#[derive(Default)]
pub struct MemoryCheckpoint {
    pub rows: Vec<Record>,
    pub schemas: Vec<Vec<String>>,
    pub writes: Vec<(WriteMode, usize)>,
    pub fail_next: usize,
}

impl Checkpoint for MemoryCheckpoint {
    fn persist(
        &mut self,
        records: &[Record],
        keys: &KnownKeys,
        mode: WriteMode,
    ) -> Result<(), PersistenceError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(PersistenceError {
                target: "memory".to_string(),
                count: records.len(),
                source: "disk full".into(),
            });
        }
        self.writes.push((mode, records.len()));
        match mode {
            WriteMode::Create => {
                self.rows = records.to_vec();
                self.schemas.push(keys.snapshot());
            }
            WriteMode::Append => self.rows.extend_from_slice(records),
        }
        Ok(())
    }
}

impl MemoryCheckpoint {
    pub fn urls(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.url.as_str()).collect()
    }
}

pub fn item_url(i: usize) -> String {
    format!("https://shop.test/p/{i}")
}

pub fn detail_body(i: usize) -> String {
    format!("name=Product {i}\nprice={}\nspec:Weight={i}00 g", 100 + i)
}

/// A listing page at `listing` linking `count` items, each detail page served.
pub fn shop(listing: &str, count: usize) -> MockBrowser {
    let links = (1..=count)
        .map(|i| format!("link={}|name=Card {i}|thumb=t{i}.png", item_url(i)))
        .collect::<Vec<_>>()
        .join("\n");
    (1..=count)
        .fold(MockBrowser::new().page(listing, links), |browser, i| {
            browser.page(&item_url(i), detail_body(i))
        })
        .extents([1_000])
}
