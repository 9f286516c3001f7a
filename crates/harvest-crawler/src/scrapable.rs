use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Site knowledge plugged into the pipeline: how to read listing cards and
/// detail pages out of a loaded document.
pub trait Scrapable: Send + Sync {
    /// Items exposed by a listing page, with whatever fields the card shows.
    fn listing(&self, html: &str, page_url: &str) -> Vec<ListingReference>;

    /// Fields of one detail page. Every expected field is present in the result.
    fn extract(&self, html: &str, page_url: &str) -> ExtractionResult;

    /// The detail fields every record carries, used to build degraded records.
    fn expected_fields(&self) -> Vec<String>;

    /// Total number of listing pages, read from the first page.
    fn total_pages(&self, _html: &str, _items_on_page: usize) -> Option<usize> {
        None
    }

    /// Placeholder written for unavailable values.
    fn sentinel(&self) -> &str;

    /// Element a listing page must show before its cards are read.
    fn listing_ready(&self) -> Option<&str> {
        None
    }

    /// Element a detail page must show before it is extracted.
    fn detail_ready(&self) -> Option<&str> {
        None
    }

    /// Last pass over a merged record, for values that depend on both the
    /// listing and the detail page.
    fn complete(&self, _record: &mut Record) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingReference {
    pub url: String,
    pub partial_fields: BTreeMap<String, String>,
}

impl ListingReference {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            partial_fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.partial_fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtractionStatus {
    Ok,
    PartialFailure,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub fields: BTreeMap<String, String>,
    /// Keys that came from key/value sets rather than named fields.
    pub dynamic_keys: BTreeSet<String>,
    pub status: ExtractionStatus,
}

/// One output row: listing fields merged with detail fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub url: String,
    pub fields: BTreeMap<String, String>,
    pub degraded: bool,
}

impl Record {
    /// Listing values go first, a detail value replaces them unless it is the
    /// sentinel.
    pub fn merge(link: &ListingReference, result: ExtractionResult, sentinel: &str) -> Self {
        let mut fields = link.partial_fields.clone();
        for (key, value) in result.fields {
            if value == sentinel && fields.contains_key(&key) {
                continue;
            }
            fields.insert(key, value);
        }
        Self {
            url: link.url.clone(),
            fields,
            degraded: false,
        }
    }

    /// Every expected detail field set to the sentinel, listing-only fields kept.
    pub fn degraded(link: &ListingReference, expected: &[String], sentinel: &str) -> Self {
        let mut fields = link.partial_fields.clone();
        for key in expected {
            fields.insert(key.clone(), sentinel.to_string());
        }
        Self {
            url: link.url.clone(),
            fields,
            degraded: true,
        }
    }

    /// Value of an output column, `url` included.
    pub fn get(&self, column: &str) -> Option<&str> {
        if column == "url" {
            Some(&self.url)
        } else {
            self.fields.get(column).map(String::as_str)
        }
    }
}
