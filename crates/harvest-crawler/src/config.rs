use std::cmp;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::{NavigateOptions, WaitUntil};
use crate::retry::RetryBudget;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_nav_attempts")]
    pub nav_attempts: usize,

    #[serde(default = "default_nav_retry_delay_ms")]
    pub nav_retry_delay_ms: u64,

    #[serde(default = "default_item_attempts")]
    pub item_attempts: usize,

    #[serde(default = "default_item_retry_delay_ms")]
    pub item_retry_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default)]
    pub jitter_ms: u64,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub max_items: Option<usize>,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            concurrency: default_concurrency(),
            nav_attempts: default_nav_attempts(),
            nav_retry_delay_ms: default_nav_retry_delay_ms(),
            item_attempts: default_item_attempts(),
            item_retry_delay_ms: default_item_retry_delay_ms(),
            backoff: Backoff::default(),
            jitter_ms: 0,
            ready_timeout_ms: default_ready_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            batch_delay_ms: default_batch_delay_ms(),
            strategy: Strategy::default(),
            max_items: None,
            handle_sigint: default_handle_sigint(),
        }
    }
}

impl CrawlerConfig {
    pub fn nav_budget(&self) -> RetryBudget {
        RetryBudget::new(self.nav_attempts, Duration::from_millis(self.nav_retry_delay_ms))
            .with_backoff(self.backoff)
            .with_jitter(Duration::from_millis(self.jitter_ms))
    }

    pub fn item_budget(&self) -> RetryBudget {
        RetryBudget::new(self.item_attempts, Duration::from_millis(self.item_retry_delay_ms))
            .with_backoff(self.backoff)
            .with_jitter(Duration::from_millis(self.jitter_ms))
    }

    pub fn navigate_options(&self) -> NavigateOptions {
        NavigateOptions {
            wait_until: WaitUntil::NetworkIdle,
            timeout: self.request_timeout(),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Zero is treated as one, a batch always holds at least one item.
    pub fn effective_concurrency(&self) -> usize {
        cmp::max(1, self.concurrency)
    }
}

fn default_user_agent() -> String {
    String::from(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    )
}

fn default_concurrency() -> usize {
    cmp::min(5, cmp::max(1, num_cpus::get().saturating_sub(2)))
}

fn default_nav_attempts() -> usize {
    3
}

fn default_nav_retry_delay_ms() -> u64 {
    1_500
}

fn default_item_attempts() -> usize {
    3
}

fn default_item_retry_delay_ms() -> u64 {
    2_000
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_batch_delay_ms() -> u64 {
    2_500
}

fn default_handle_sigint() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// How item links are enumerated from the listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Strategy {
    /// Scroll until the page extent stops growing
    #[serde(rename_all = "camelCase")]
    Scroll {
        #[serde(default = "default_max_rounds")]
        max_rounds: usize,
        #[serde(default = "default_settle_ms")]
        settle_ms: u64,
    },
    /// Visit `?<page_param>=1..N` where N is read from the first page
    #[serde(rename_all = "camelCase")]
    Paginate {
        #[serde(default = "default_page_param")]
        page_param: String,
        #[serde(default = "default_max_pages")]
        max_pages: usize,
    },
    /// Follow a "next page" control until it is absent or disabled
    #[serde(rename_all = "camelCase")]
    ClickNext {
        selector: String,
        #[serde(default = "default_max_pages")]
        max_pages: usize,
        #[serde(default = "default_settle_ms")]
        settle_ms: u64,
    },
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Scroll {
            max_rounds: default_max_rounds(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Scroll { .. } => StrategyKind::Scroll,
            Self::Paginate { .. } => StrategyKind::Paginate,
            Self::ClickNext { .. } => StrategyKind::ClickNext,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Scroll,
    Paginate,
    ClickNext,
}

pub fn default_max_rounds() -> usize {
    20
}

pub fn default_settle_ms() -> u64 {
    3_000
}

pub fn default_page_param() -> String {
    String::from("page")
}

pub fn default_max_pages() -> usize {
    5
}
