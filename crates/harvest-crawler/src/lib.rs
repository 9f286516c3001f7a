mod browser;
mod checkpoint;
#[cfg(feature = "chrome")]
mod chrome;
mod config;
mod crawler;
mod discover;
mod http;
mod navigator;
mod retry;
mod scrapable;
mod session;

pub use browser::{Browser, BrowserError, LaunchError, NavigateOptions, Page, WaitUntil};
pub use checkpoint::{Checkpoint, Checkpointer, PersistenceError, WriteMode};
#[cfg(feature = "chrome")]
pub use chrome::ChromeBrowser;
pub use config::{Backoff, CrawlerConfig, Strategy, StrategyKind};
pub use crawler::{
    crawl_site, spawn_interrupt_handler, CrawlError, CrawlReport, FetchError, Orchestrator,
};
pub use discover::{dedupe, discover_links, Discovery};
pub use http::HttpBrowser;
pub use navigator::{close_page, NavigationError, Navigator};
pub use retry::{retry, RetryBudget, RetryError};
pub use scrapable::{ExtractionResult, ExtractionStatus, ListingReference, Record, Scrapable};
pub use session::{KnownKeys, ScrapeSession};

pub mod defaults {
    pub use crate::config::{default_max_pages, default_max_rounds, default_page_param, default_settle_ms};
}

pub use tokio_util::sync::CancellationToken;
