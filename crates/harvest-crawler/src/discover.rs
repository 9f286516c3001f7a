use std::collections::HashSet;
use std::time::Duration;

use url::Url;

use crate::browser::{BrowserError, Page};
use crate::config::Strategy;
use crate::navigator::{close_page, NavigationError, Navigator};
use crate::retry::pause;
use crate::scrapable::{ListingReference, Scrapable};

/// Outcome of walking a listing.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Deduplicated, in order of first appearance
    pub links: Vec<ListingReference>,
    /// Scroll rounds that grew the page
    pub rounds: usize,
    /// Listing pages read
    pub pages: usize,
}

/// Enumerates item links from `listing_url` following `strategy`.
///
/// Only a failure to load the listing itself is an error, an empty listing is
/// a valid result.
pub async fn discover_links(
    navigator: &Navigator,
    scraper: &dyn Scrapable,
    listing_url: &str,
    strategy: &Strategy,
) -> Result<Discovery, NavigationError> {
    log::info!("Discovering links from {listing_url}");
    let mut discovery = match strategy {
        Strategy::Scroll {
            max_rounds,
            settle_ms,
        } => {
            let settle = Duration::from_millis(*settle_ms);
            scroll(navigator, scraper, listing_url, *max_rounds, settle).await?
        }
        Strategy::Paginate {
            page_param,
            max_pages,
        } => paginate(navigator, scraper, listing_url, page_param, *max_pages).await?,
        Strategy::ClickNext {
            selector,
            max_pages,
            settle_ms,
        } => {
            let settle = Duration::from_millis(*settle_ms);
            click_next(navigator, scraper, listing_url, selector, *max_pages, settle).await?
        }
    };

    let found = discovery.links.len();
    discovery.links = dedupe(discovery.links);
    if discovery.links.is_empty() {
        log::warn!("No items found on {listing_url}");
    } else {
        log::info!(
            "Discovered {} item(s) ({} duplicate(s) dropped) over {} page(s)",
            discovery.links.len(),
            found - discovery.links.len(),
            discovery.pages
        );
    }
    Ok(discovery)
}

/// Keeps the first occurrence of each URL.
pub fn dedupe(links: Vec<ListingReference>) -> Vec<ListingReference> {
    let mut seen = HashSet::new();
    links
        .into_iter()
        .filter(|link| {
            let fresh = seen.insert(link.url.clone());
            if !fresh {
                log::debug!("Duplicate link {}", link.url);
            }
            fresh
        })
        .collect()
}

async fn read_listing(
    page: &mut dyn Page,
    scraper: &dyn Scrapable,
) -> Result<(String, Vec<ListingReference>), BrowserError> {
    let html = page.content().await?;
    let page_url = page.current_url().await?;
    let links = scraper.listing(&html, &page_url);
    Ok((html, links))
}

async fn scroll(
    navigator: &Navigator,
    scraper: &dyn Scrapable,
    listing_url: &str,
    max_rounds: usize,
    settle: Duration,
) -> Result<Discovery, NavigationError> {
    let mut page = navigator.goto(listing_url, scraper.listing_ready()).await?;
    let cancel = navigator.cancel_token();

    let mut rounds = 0;
    let mut extent = 0;
    while rounds < max_rounds {
        let current = match page.scroll_to_bottom().await {
            Ok(current) => current,
            Err(e) => {
                log::warn!("Scrolling {listing_url} failed after {rounds} round(s): {e}");
                break;
            }
        };
        if current <= extent {
            log::debug!("Scroll extent settled at {extent} after {rounds} round(s)");
            break;
        }
        extent = current;
        rounds += 1;
        log::debug!("Scroll round {rounds}: extent {extent}");

        if !pause(settle, cancel).await {
            log::warn!("Scrolling interrupted after {rounds} round(s)");
            break;
        }
        navigator.settle(page.as_mut(), None).await;
    }
    if rounds == max_rounds {
        log::info!("Stopped scrolling at the {max_rounds} round(s) cap");
    }

    let listing = read_listing(page.as_mut(), scraper).await;
    close_page(page.as_mut(), listing_url).await;
    let (_, links) = listing.map_err(|last_error| NavigationError {
        url: listing_url.to_string(),
        last_error,
    })?;

    Ok(Discovery {
        links,
        rounds,
        pages: 1,
    })
}

async fn paginate(
    navigator: &Navigator,
    scraper: &dyn Scrapable,
    listing_url: &str,
    page_param: &str,
    max_pages: usize,
) -> Result<Discovery, NavigationError> {
    let base = Url::parse(listing_url).map_err(|source| NavigationError {
        url: listing_url.to_string(),
        last_error: BrowserError::Url {
            url: listing_url.to_string(),
            source,
        },
    })?;

    let mut page = navigator.goto(listing_url, scraper.listing_ready()).await?;
    let first = read_listing(page.as_mut(), scraper).await;
    close_page(page.as_mut(), listing_url).await;
    let (html, mut links) = first.map_err(|last_error| NavigationError {
        url: listing_url.to_string(),
        last_error,
    })?;

    let total = scraper.total_pages(&html, links.len()).unwrap_or(1).max(1);
    let last = total.min(max_pages.max(1));
    log::info!("Listing has {total} page(s), visiting {last}");

    let mut pages = 1;
    for number in 2..=last {
        if navigator.cancel_token().is_cancelled() {
            log::warn!("Pagination interrupted at page {number}");
            break;
        }
        let page_url = with_page(&base, page_param, number);
        let mut page = match navigator.goto(&page_url, scraper.listing_ready()).await {
            Ok(page) => page,
            Err(e) => {
                log::warn!("Skipping listing page {number}: {e}");
                continue;
            }
        };
        let listing = read_listing(page.as_mut(), scraper).await;
        close_page(page.as_mut(), &page_url).await;
        match listing {
            Ok((_, found)) => {
                log::debug!("Page {number}: {} item(s)", found.len());
                links.extend(found);
                pages += 1;
            }
            Err(e) => log::warn!("Skipping listing page {number}: {e}"),
        }
    }

    Ok(Discovery {
        links,
        rounds: 0,
        pages,
    })
}

/// `base` with `param` set to `number`, other query pairs kept.
fn with_page(base: &Url, param: &str, number: usize) -> String {
    let pairs = base
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(param, &number.to_string());
    url.to_string()
}

async fn click_next(
    navigator: &Navigator,
    scraper: &dyn Scrapable,
    listing_url: &str,
    selector: &str,
    max_pages: usize,
    settle: Duration,
) -> Result<Discovery, NavigationError> {
    let mut page = navigator.goto(listing_url, scraper.listing_ready()).await?;
    let res = walk_pages(navigator, page.as_mut(), scraper, selector, max_pages, settle).await;
    close_page(page.as_mut(), listing_url).await;
    let (links, pages) = res.map_err(|last_error| NavigationError {
        url: listing_url.to_string(),
        last_error,
    })?;

    Ok(Discovery {
        links,
        rounds: 0,
        pages,
    })
}

async fn walk_pages(
    navigator: &Navigator,
    page: &mut dyn Page,
    scraper: &dyn Scrapable,
    selector: &str,
    max_pages: usize,
    settle: Duration,
) -> Result<(Vec<ListingReference>, usize), BrowserError> {
    let (_, mut links) = read_listing(page, scraper).await?;
    let mut pages = 1;

    while pages < max_pages {
        match page.click(selector).await {
            Ok(true) => (),
            Ok(false) => {
                log::info!("No usable next control after page {pages}");
                break;
            }
            Err(e) => {
                log::warn!("Next page failed after page {pages}: {e}");
                break;
            }
        }
        if !pause(settle, navigator.cancel_token()).await {
            log::warn!("Pagination interrupted after page {pages}");
            break;
        }
        navigator.settle(page, scraper.listing_ready()).await;

        match read_listing(page, scraper).await {
            Ok((_, found)) => {
                pages += 1;
                log::debug!("Page {pages}: {} item(s)", found.len());
                links.extend(found);
            }
            Err(e) => {
                log::warn!("Couldn't read page {}: {e}", pages + 1);
                break;
            }
        }
    }

    Ok((links, pages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let links = vec![
            ListingReference::new("a").with_field("name", "first"),
            ListingReference::new("b"),
            ListingReference::new("a").with_field("name", "second"),
        ];
        let links = dedupe(links);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].partial_fields["name"], "first");
        assert_eq!(links[1].url, "b");
    }

    #[test]
    fn page_param_replaces_existing_value() {
        let base = Url::parse("https://shop.test/c/rice?sort=new&page=1").unwrap();
        assert_eq!(
            with_page(&base, "page", 3),
            "https://shop.test/c/rice?sort=new&page=3"
        );
        let bare = Url::parse("https://shop.test/c/rice").unwrap();
        assert_eq!(with_page(&bare, "p", 2), "https://shop.test/c/rice?p=2");
    }
}
