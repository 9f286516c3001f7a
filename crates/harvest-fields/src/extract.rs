use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::anyhow;
use harvest_crawler::{ExtractionResult, ExtractionStatus, ListingReference, Record, Scrapable};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::offer::{last_number, offer_percentage};
use crate::spec::{FieldSpec, KeyValueSet, MrpPolicy, ScalarField, Selection, TotalKind};

/// A [`Scrapable`] driven entirely by a [`FieldSpec`].
pub struct FieldScraper {
    spec: FieldSpec,
    listing: Option<CompiledListing>,
    fields: Vec<CompiledField>,
    sets: Vec<CompiledSet>,
}

struct CompiledSelection {
    selectors: Vec<Selector>,
    attr: Option<String>,
    all: bool,
    separator: String,
}

struct CompiledField {
    name: String,
    selection: CompiledSelection,
}

struct CompiledListing {
    card: Selector,
    link: CompiledSelection,
    fields: Vec<CompiledField>,
    total: Option<(Selector, TotalKind)>,
}

enum PairSource {
    Children { key: Selector, value: Selector },
    Split(String),
}

struct CompiledSet {
    container: Selector,
    source: PairSource,
}

fn parse_selector(raw: &str) -> anyhow::Result<Selector> {
    Selector::parse(raw).map_err(|e| anyhow!("Invalid selector {raw:?}: {e}"))
}

impl CompiledSelection {
    fn compile(s: &Selection) -> anyhow::Result<Self> {
        Ok(Self {
            selectors: s.selectors().map(parse_selector).collect::<Result<_, _>>()?,
            attr: s.attr.clone(),
            all: s.all,
            separator: s.separator.clone(),
        })
    }

    /// First selector, then each fallback, until one yields a value.
    fn pick(&self, scope: ElementRef, base: Option<&Url>) -> Option<String> {
        self.selectors.iter().find_map(|selector| {
            if self.all {
                let mut values = Vec::new();
                for value in scope.select(selector).filter_map(|el| self.read(el, base)) {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
                (!values.is_empty()).then(|| values.join(&self.separator))
            } else {
                scope.select(selector).find_map(|el| self.read(el, base))
            }
        })
    }

    fn read(&self, el: ElementRef, base: Option<&Url>) -> Option<String> {
        match &self.attr {
            Some(attr) => {
                let value = el.value().attr(attr)?.trim();
                if value.is_empty() {
                    None
                } else if attr == "href" || attr == "src" {
                    Some(resolve(base, value))
                } else {
                    Some(value.to_string())
                }
            }
            None => Some(collapse(el)).filter(|text| !text.is_empty()),
        }
    }
}

impl CompiledField {
    fn compile(f: &ScalarField) -> anyhow::Result<Self> {
        Ok(Self {
            name: f.name.clone(),
            selection: CompiledSelection::compile(&f.selection)?,
        })
    }
}

impl CompiledSet {
    fn compile(set: &KeyValueSet) -> anyhow::Result<Self> {
        let source = match (&set.key, &set.value) {
            (Some(key), Some(value)) => PairSource::Children {
                key: parse_selector(key)?,
                value: parse_selector(value)?,
            },
            (None, None) => PairSource::Split(set.split.clone()),
            _ => anyhow::bail!(
                "Key/value set {:?} needs both key and value selectors or neither",
                set.container
            ),
        };
        Ok(Self {
            container: parse_selector(&set.container)?,
            source,
        })
    }

    fn pairs<'a>(&'a self, root: ElementRef<'a>) -> impl Iterator<Item = (String, String)> + 'a {
        root.select(&self.container).filter_map(move |el| {
            let (key, value) = match &self.source {
                PairSource::Children { key, value } => (
                    el.select(key).next().map(collapse)?,
                    el.select(value).next().map(collapse)?,
                ),
                PairSource::Split(sep) => {
                    let text = collapse(el);
                    let (key, value) = text.split_once(sep.as_str())?;
                    (key.trim().to_string(), value.trim().to_string())
                }
            };
            let key = key.trim_end_matches(':').trim().to_string();
            (!key.is_empty() && !value.is_empty()).then_some((key, value))
        })
    }
}

/// Text content with runs of whitespace folded into single spaces.
fn collapse(el: ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve(base: Option<&Url>, value: &str) -> String {
    base.and_then(|b| b.join(value).ok())
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

impl FieldScraper {
    pub fn new(spec: FieldSpec) -> anyhow::Result<Self> {
        let ready = spec.listing.iter().filter_map(|l| l.ready.as_deref());
        for selector in ready.chain(spec.detail.ready.as_deref()) {
            parse_selector(selector)?;
        }
        let listing = spec
            .listing
            .as_ref()
            .map(|l| {
                Ok::<_, anyhow::Error>(CompiledListing {
                    card: parse_selector(&l.card)?,
                    link: CompiledSelection::compile(&l.link)?,
                    fields: l
                        .fields
                        .iter()
                        .map(CompiledField::compile)
                        .collect::<Result<_, _>>()?,
                    total: l
                        .total
                        .as_ref()
                        .map(|t| Ok::<_, anyhow::Error>((parse_selector(&t.selector)?, t.kind)))
                        .transpose()?,
                })
            })
            .transpose()?;
        let fields = spec
            .detail
            .fields
            .iter()
            .map(CompiledField::compile)
            .collect::<Result<_, _>>()?;
        let sets = spec
            .detail
            .sets
            .iter()
            .map(CompiledSet::compile)
            .collect::<Result<_, _>>()?;

        Ok(Self {
            spec,
            listing,
            fields,
            sets,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::new(FieldSpec::from_path(path)?)
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    /// Output columns known before any page is read: `url`, listing fields,
    /// detail fields, then the offer column.
    pub fn base_columns(&self) -> Vec<String> {
        let listing = self.spec.listing.iter().flat_map(|l| &l.fields);
        let offer = self.spec.detail.offer.iter().map(|o| &o.column);

        let mut columns = vec!["url".to_string()];
        for name in listing
            .chain(&self.spec.detail.fields)
            .map(|f| &f.name)
            .chain(offer)
        {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        columns
    }

    fn derive_offer(&self, fields: &mut BTreeMap<String, String>) {
        let Some(offer) = &self.spec.detail.offer else {
            return;
        };
        let sentinel = self.spec.sentinel.as_str();
        let price = fields
            .get(&offer.price)
            .cloned()
            .unwrap_or_else(|| sentinel.to_string());
        let mut mrp = fields
            .get(&offer.mrp)
            .cloned()
            .unwrap_or_else(|| sentinel.to_string());

        if offer.when_mrp_missing == MrpPolicy::CopyPrice && mrp == sentinel && price != sentinel {
            mrp = price.clone();
            fields.insert(offer.mrp.clone(), mrp.clone());
        }
        fields.insert(offer.column.clone(), offer_percentage(&price, &mrp, sentinel));
    }
}

impl Scrapable for FieldScraper {
    fn listing(&self, html: &str, page_url: &str) -> Vec<ListingReference> {
        let Some(listing) = &self.listing else {
            log::warn!("Field spec has no listing section, no links can be discovered");
            return vec![];
        };
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();

        document
            .select(&listing.card)
            .filter_map(|card| {
                let url = listing.link.pick(card, base.as_ref());
                if url.is_none() {
                    log::debug!("Skipping a card without link on {page_url}");
                }
                let link = ListingReference::new(url?);
                let link = listing.fields.iter().fold(link, |link, field| {
                    match field.selection.pick(card, base.as_ref()) {
                        Some(value) => link.with_field(&field.name, value),
                        None => link,
                    }
                });
                Some(link)
            })
            .collect()
    }

    fn extract(&self, html: &str, page_url: &str) -> ExtractionResult {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let base = Url::parse(page_url).ok();
        let sentinel = &self.spec.sentinel;

        let mut fields = BTreeMap::new();
        let mut resolved = 0;
        for field in &self.fields {
            let value = match field.selection.pick(root, base.as_ref()) {
                Some(value) => {
                    resolved += 1;
                    value
                }
                None => {
                    log::debug!("{} not found on {page_url}", field.name);
                    sentinel.clone()
                }
            };
            fields.insert(field.name.clone(), value);
        }

        let mut dynamic_keys = BTreeSet::new();
        for set in &self.sets {
            for (key, value) in set.pairs(root) {
                if fields.contains_key(&key) {
                    continue;
                }
                fields.insert(key.clone(), value);
                dynamic_keys.insert(key);
            }
        }

        self.derive_offer(&mut fields);

        let status = if resolved == self.fields.len() && (resolved > 0 || !dynamic_keys.is_empty())
        {
            ExtractionStatus::Ok
        } else if resolved > 0 || !dynamic_keys.is_empty() {
            ExtractionStatus::PartialFailure
        } else {
            ExtractionStatus::Failure
        };

        ExtractionResult {
            fields,
            dynamic_keys,
            status,
        }
    }

    fn expected_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|f| f.name.clone())
            .chain(self.spec.detail.offer.iter().map(|o| o.column.clone()))
            .collect()
    }

    fn total_pages(&self, html: &str, items_on_page: usize) -> Option<usize> {
        let (selector, kind) = self.listing.as_ref()?.total.as_ref()?;
        let document = Html::parse_document(html);
        let text = document.select(selector).next().map(collapse)?;
        let count = last_number(&text)? as usize;
        match kind {
            TotalKind::Pages => Some(count),
            TotalKind::Items if items_on_page > 0 => Some(count.div_ceil(items_on_page)),
            TotalKind::Items => None,
        }
    }

    fn sentinel(&self) -> &str {
        &self.spec.sentinel
    }

    fn listing_ready(&self) -> Option<&str> {
        self.spec.listing.as_ref()?.ready.as_deref()
    }

    fn detail_ready(&self) -> Option<&str> {
        self.spec.detail.ready.as_deref()
    }

    /// The offer is derived again from the merged values, a price that only
    /// the listing card showed still counts.
    fn complete(&self, record: &mut Record) {
        self.derive_offer(&mut record.fields);
    }
}
