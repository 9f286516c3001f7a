use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use env_logger::Env;
use harvest_crawler::defaults::{
    default_max_pages, default_max_rounds, default_page_param, default_settle_ms,
};
use harvest_crawler::{
    close_page, crawl_site, Browser, CancellationToken, CrawlerConfig, HttpBrowser, Navigator,
    Scrapable, Strategy, StrategyKind,
};
use harvest_fields::{CsvCheckpoint, FieldScraper};
use tokio::runtime;

const DEFAULT_LOG_FILTER: &str = "harvest_crawler=info,harvest_fields=info";

/// Listing scraper with incremental CSV checkpoints
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[command(name = "crawl")]
    Crawl(CrawlArgs),
    #[command(name = "extract")]
    Extract(ExtractArgs),
    #[command(hide = true)]
    Completion,
}

/// Discover items from a listing page and scrape each detail page
#[derive(Debug, clap::Args)]
pub struct CrawlArgs {
    /// Path to the YAML field spec describing the site
    #[arg(long, short)]
    pub spec: PathBuf,
    /// Listing page to start from
    #[arg(long, short)]
    pub url: String,
    /// CSV file receiving the records, checkpointed after every batch
    #[arg(long, short)]
    pub output: PathBuf,
    /// Optional default crawler yaml configuration file
    #[arg(env = "HARVEST_CRAWLER_CONFIG", long)]
    pub crawler_config: Option<PathBuf>,
    /// Override how item links are discovered
    #[arg(value_enum, long)]
    pub strategy: Option<StrategyKind>,
    /// Override the scroll rounds cap
    #[arg(long)]
    pub max_rounds: Option<usize>,
    /// Override the listing pages cap
    #[arg(long)]
    pub max_pages: Option<usize>,
    /// Query parameter holding the page number
    #[arg(long)]
    pub page_param: Option<String>,
    /// Selector of the "next page" control
    #[arg(long)]
    pub next_selector: Option<String>,
    /// Override the wait after each scroll or click, in milliseconds
    #[arg(long)]
    pub settle_ms: Option<u64>,
    /// Override the number of detail pages fetched at once
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Override the browser's user agent
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Only scrape the first N discovered items
    #[arg(long)]
    pub max_items: Option<usize>,
    /// No SIGINT handling, an interrupt kills the process without a final save
    #[arg(long)]
    pub no_sigint: bool,
    /// Drive headless Chrome instead of plain HTTP requests
    #[arg(long)]
    pub chrome: bool,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

impl TryFrom<&CrawlArgs> for CrawlerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CrawlArgs) -> Result<Self, Self::Error> {
        let mut conf: CrawlerConfig = match &args.crawler_config {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Couldn't open {}", path.display()))?;
                serde_yaml::from_reader(file)
                    .with_context(|| format!("Invalid crawler config {}", path.display()))?
            }
            None => CrawlerConfig::default(),
        };
        if let Some(user_agent) = &args.user_agent {
            conf.user_agent = user_agent.to_string();
        }
        if let Some(concurrency) = args.concurrency {
            conf.concurrency = concurrency;
        }
        if let Some(max_items) = args.max_items {
            conf.max_items = Some(max_items);
        }
        if args.no_sigint {
            conf.handle_sigint = false;
        }

        if let Some(kind) = args.strategy {
            if conf.strategy.kind() != kind {
                conf.strategy = match kind {
                    StrategyKind::Scroll => Strategy::Scroll {
                        max_rounds: default_max_rounds(),
                        settle_ms: default_settle_ms(),
                    },
                    StrategyKind::Paginate => Strategy::Paginate {
                        page_param: default_page_param(),
                        max_pages: default_max_pages(),
                    },
                    StrategyKind::ClickNext => Strategy::ClickNext {
                        selector: args
                            .next_selector
                            .clone()
                            .context("--next-selector is required by the click-next strategy")?,
                        max_pages: default_max_pages(),
                        settle_ms: default_settle_ms(),
                    },
                };
            }
        }
        match &mut conf.strategy {
            Strategy::Scroll {
                max_rounds,
                settle_ms,
            } => {
                if let Some(n) = args.max_rounds {
                    *max_rounds = n;
                }
                if let Some(ms) = args.settle_ms {
                    *settle_ms = ms;
                }
            }
            Strategy::Paginate {
                page_param,
                max_pages,
            } => {
                if let Some(param) = &args.page_param {
                    *page_param = param.clone();
                }
                if let Some(n) = args.max_pages {
                    *max_pages = n;
                }
            }
            Strategy::ClickNext {
                selector,
                max_pages,
                settle_ms,
            } => {
                if let Some(s) = &args.next_selector {
                    *selector = s.clone();
                }
                if let Some(n) = args.max_pages {
                    *max_pages = n;
                }
                if let Some(ms) = args.settle_ms {
                    *settle_ms = ms;
                }
            }
        }

        Ok(conf)
    }
}

async fn launch(config: &CrawlerConfig, chrome: bool) -> anyhow::Result<Arc<dyn Browser>> {
    if chrome {
        #[cfg(feature = "chrome")]
        {
            let browser = harvest_crawler::ChromeBrowser::launch(config).await?;
            return Ok(Arc::new(browser));
        }
        #[cfg(not(feature = "chrome"))]
        anyhow::bail!("This build has no Chrome support, rebuild with `--features chrome`");
    }
    Ok(Arc::new(HttpBrowser::launch(config)?))
}

pub fn crawl(args: CrawlArgs) -> anyhow::Result<()> {
    let crawler_conf: CrawlerConfig = (&args).try_into()?;
    let scraper = FieldScraper::from_path(&args.spec)?;
    let mut checkpoint = CsvCheckpoint::new(
        &args.output,
        scraper.base_columns(),
        scraper.sentinel(),
        scraper.spec().csv.clone(),
    );

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let browser = launch(&crawler_conf, args.chrome).await?;
        crawl_site(
            &crawler_conf,
            &args.url,
            browser,
            &scraper,
            &mut checkpoint,
            CancellationToken::new(),
        )
        .await?;
        Ok(())
    })
}

/// Run a field spec against one page and print the result as JSON
#[derive(Debug, clap::Args)]
#[command(group = clap::ArgGroup::new("page").required(true))]
pub struct ExtractArgs {
    /// Path to the YAML field spec describing the site
    #[arg(long, short)]
    pub spec: PathBuf,
    /// A local html page
    #[arg(group = "page", long)]
    pub file: Option<PathBuf>,
    /// A distant html page
    #[arg(group = "page", long)]
    pub url: Option<String>,
    /// Base URL used to resolve relative links of a local page
    #[arg(long, conflicts_with = "url")]
    pub base_url: Option<String>,
    /// Read the page as a listing instead of a detail page
    #[arg(long)]
    pub listing: bool,
    /// Custom user agent to download the page
    #[arg(long, conflicts_with = "file")]
    pub ua: Option<String>,
}

pub fn extract(args: ExtractArgs) -> anyhow::Result<()> {
    let scraper = FieldScraper::from_path(&args.spec)?;
    let ready = if args.listing {
        scraper.listing_ready()
    } else {
        scraper.detail_ready()
    };

    let (page, page_url) = if let Some(url) = args.url {
        let mut conf = CrawlerConfig {
            handle_sigint: false,
            ..Default::default()
        };
        if let Some(ua) = args.ua {
            conf.user_agent = ua;
        }
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(fetch(&conf, &url, ready))?
    } else if let Some(path) = args.file {
        let page = std::fs::read_to_string(&path)
            .with_context(|| format!("Couldn't read {}", path.display()))?;
        (page, args.base_url.unwrap_or_default())
    } else {
        anyhow::bail!("Missing `url` or `file`");
    };

    let stdout = io::stdout();
    if args.listing {
        let links = scraper.listing(&page, &page_url);
        log::info!("{} item(s) found", links.len());
        serde_json::to_writer_pretty(stdout.lock(), &links)?;
    } else {
        serde_json::to_writer_pretty(stdout.lock(), &scraper.extract(&page, &page_url))?;
    }
    println!();
    Ok(())
}

async fn fetch(
    conf: &CrawlerConfig,
    url: &str,
    ready: Option<&str>,
) -> anyhow::Result<(String, String)> {
    let browser: Arc<dyn Browser> = Arc::new(HttpBrowser::launch(conf)?);
    let navigator = Navigator::new(browser, conf, CancellationToken::new());
    let mut page = navigator.goto(url, ready).await?;
    let content = page.content().await;
    let current = page.current_url().await;
    close_page(page.as_mut(), url).await;
    Ok((content?, current?))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Crawl(args) => {
            if !args.quiet {
                env_logger::Builder::from_env(Env::default().default_filter_or(DEFAULT_LOG_FILTER))
                    .init();
            }
            crawl(args)
        }
        SubCommand::Extract(args) => {
            env_logger::Builder::from_env(Env::default().default_filter_or("harvest_fields=warn"))
                .init();
            extract(args)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "harvest", &mut io::stdout());
            Ok(())
        }
    }
}
