use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::{Browser, BrowserError, Page};
use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::config::CrawlerConfig;
use crate::discover::discover_links;
use crate::navigator::{close_page, NavigationError, Navigator};
use crate::retry::{jitter, pause, retry, RetryBudget};
use crate::scrapable::{ExtractionResult, ExtractionStatus, ListingReference, Record, Scrapable};
use crate::session::{KnownKeys, ScrapeSession};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error("couldn't read {url}: {source}")]
    Browser {
        url: String,
        #[source]
        source: BrowserError,
    },

    #[error("nothing could be extracted from {url}")]
    Empty { url: String },
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("listing discovery failed: {0}")]
    Discovery(#[from] NavigationError),
}

/// Fans links out through the navigator and the scraper, one batch at a time.
pub struct Orchestrator<'a> {
    navigator: Navigator,
    scraper: &'a dyn Scrapable,
    keys: KnownKeys,
    concurrency: usize,
    item_budget: RetryBudget,
    batch_delay: Duration,
    jitter: Duration,
}

impl<'a> Orchestrator<'a> {
    pub fn new(navigator: Navigator, scraper: &'a dyn Scrapable, config: &CrawlerConfig) -> Self {
        Self {
            navigator,
            scraper,
            keys: KnownKeys::new(),
            concurrency: config.effective_concurrency(),
            item_budget: config.item_budget(),
            batch_delay: config.batch_delay(),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    pub fn known_keys(&self) -> &KnownKeys {
        &self.keys
    }

    fn cancel(&self) -> &CancellationToken {
        self.navigator.cancel_token()
    }

    /// Scrapes every link and checkpoints after each batch.
    ///
    /// A batch that resolves after cancellation is dropped whole, so the
    /// checkpoint only ever holds complete batches.
    pub async fn run(
        &self,
        links: &[ListingReference],
        checkpoint: &mut dyn Checkpoint,
    ) -> ScrapeSession {
        let mut session = ScrapeSession::new();
        let mut checkpointer = Checkpointer::new(checkpoint, self.keys.clone());

        let batches = links.chunks(self.concurrency).collect::<Vec<_>>();
        let total = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            let number = i + 1;
            if self.cancel().is_cancelled() {
                log::warn!("Interrupted before batch {number}/{total}");
                session.set_interrupted();
                break;
            }

            log::info!("Batch {number}/{total}: {} item(s)", batch.len());
            let records = stream::iter(batch)
                .map(|link| self.fetch_item(link))
                .buffered(self.concurrency)
                .collect::<Vec<_>>()
                .await;

            if self.cancel().is_cancelled() {
                log::warn!(
                    "Interrupted during batch {number}/{total}, discarding its {} record(s)",
                    records.len()
                );
                session.set_interrupted();
                break;
            }

            session.push_batch(records);
            // Failures stay pending for the next save.
            let _ = checkpointer.save_pending(&mut session);

            if number < total {
                let delay = self.batch_delay + jitter(self.jitter);
                if !pause(delay, self.cancel()).await {
                    log::warn!("Interrupted after batch {number}/{total}");
                    session.set_interrupted();
                    break;
                }
            }
        }

        let _ = checkpointer.save_pending(&mut session);
        let _ = checkpointer.save_all(&mut session);
        session
    }

    /// Never fails: an item that exhausts its attempts becomes a degraded record.
    pub async fn fetch_item(&self, link: &ListingReference) -> Record {
        let label = format!("Item {}", link.url);
        let res = retry(self.item_budget, self.cancel(), &label, move |_| {
            self.fetch_once(link)
        })
        .await;

        let sentinel = self.scraper.sentinel();
        match res {
            Ok(extraction) => {
                if extraction.status == ExtractionStatus::PartialFailure {
                    log::debug!("Some fields missing for {}", link.url);
                }
                self.keys.extend(extraction.dynamic_keys.iter().cloned());
                let mut record = Record::merge(link, extraction, sentinel);
                self.scraper.complete(&mut record);
                record
            }
            Err(e) => {
                log::error!("Degraded record for {}: {e}", link.url);
                Record::degraded(link, &self.scraper.expected_fields(), sentinel)
            }
        }
    }

    async fn fetch_once(&self, link: &ListingReference) -> Result<ExtractionResult, FetchError> {
        let ready = self.scraper.detail_ready();
        let mut page = self.navigator.goto(&link.url, ready).await?;
        let loaded = read_page(page.as_mut()).await;
        close_page(page.as_mut(), &link.url).await;

        let (html, page_url) = loaded.map_err(|source| FetchError::Browser {
            url: link.url.clone(),
            source,
        })?;
        let extraction = self.scraper.extract(&html, &page_url);
        if extraction.status == ExtractionStatus::Failure {
            return Err(FetchError::Empty {
                url: link.url.clone(),
            });
        }
        Ok(extraction)
    }
}

async fn read_page(page: &mut dyn Page) -> Result<(String, String), BrowserError> {
    let html = page.content().await?;
    let url = page.current_url().await?;
    Ok((html, url))
}

/// Cancels `cancel` on the first Ctrl-C, exits right away on the second.
pub fn spawn_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            log::warn!("Couldn't listen for Ctrl-C, interrupts won't be handled");
            return;
        }
        log::warn!("Interrupted, finishing in-flight items then saving (Ctrl-C again to quit now)");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            log::error!("Interrupted twice, exiting without saving");
            std::process::exit(130);
        }
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub discovered: usize,
    pub records: usize,
    pub degraded: usize,
    pub persisted: usize,
    pub interrupted: bool,
}

/// Discovers items from `listing_url`, scrapes them and checkpoints the
/// records. The browser is closed on every path.
pub async fn crawl_site(
    config: &CrawlerConfig,
    listing_url: &str,
    browser: Arc<dyn Browser>,
    scraper: &dyn Scrapable,
    checkpoint: &mut dyn Checkpoint,
    cancel: CancellationToken,
) -> Result<CrawlReport, CrawlError> {
    let interrupts = config
        .handle_sigint
        .then(|| spawn_interrupt_handler(cancel.clone()));

    let navigator = Navigator::new(browser.clone(), config, cancel);
    let res = crawl(config, listing_url, navigator, scraper, checkpoint).await;

    if let Err(e) = browser.close().await {
        log::warn!("Couldn't close browser: {e}");
    }
    if let Some(handle) = interrupts {
        handle.abort();
    }

    let report = res?;
    log::info!(
        "Done: {} discovered, {} record(s) ({} degraded), {} persisted{}",
        report.discovered,
        report.records,
        report.degraded,
        report.persisted,
        if report.interrupted {
            ", interrupted"
        } else {
            ""
        }
    );
    Ok(report)
}

async fn crawl(
    config: &CrawlerConfig,
    listing_url: &str,
    navigator: Navigator,
    scraper: &dyn Scrapable,
    checkpoint: &mut dyn Checkpoint,
) -> Result<CrawlReport, CrawlError> {
    let res = discover_links(&navigator, scraper, listing_url, &config.strategy).await;
    let mut discovery = match res {
        Ok(discovery) => discovery,
        Err(e) if navigator.cancel_token().is_cancelled() => {
            log::warn!("Interrupted during discovery, nothing to scrape: {e}");
            return Ok(CrawlReport {
                interrupted: true,
                ..Default::default()
            });
        }
        Err(e) => return Err(e.into()),
    };
    let discovered = discovery.links.len();
    if let Some(max) = config.max_items {
        if discovery.links.len() > max {
            log::info!("Keeping the first {max} of {discovered} item(s)");
            discovery.links.truncate(max);
        }
    }

    let interrupted_early = navigator.cancel_token().is_cancelled();
    let orchestrator = Orchestrator::new(navigator, scraper, config);
    let session = orchestrator.run(&discovery.links, checkpoint).await;

    Ok(CrawlReport {
        discovered,
        records: session.len(),
        degraded: session.degraded(),
        persisted: session.persisted(),
        interrupted: interrupted_early || session.is_interrupted(),
    })
}
