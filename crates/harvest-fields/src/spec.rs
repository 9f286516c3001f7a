use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::writer::CsvWriterConfig;

/// Everything site specific: selectors, derived columns and output format.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
    #[serde(default)]
    pub listing: Option<ListingSpec>,
    pub detail: DetailSpec,
    #[serde(default)]
    pub csv: CsvWriterConfig,
}

impl FieldSpec {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs_err::read_to_string(path)?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid field spec {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

fn default_sentinel() -> String {
    String::from("N/A")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingSpec {
    /// One element per item on the listing page
    pub card: String,
    /// Relative to the card, usually an anchor's `href`
    pub link: Selection,
    #[serde(default, deserialize_with = "ordered")]
    pub fields: Vec<ScalarField>,
    #[serde(default)]
    pub total: Option<TotalSpec>,
    /// Element the page must show before cards are read
    #[serde(default)]
    pub ready: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TotalSpec {
    pub selector: String,
    #[serde(default)]
    pub kind: TotalKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalKind {
    /// The element shows the number of pages, the last number is taken
    #[default]
    Pages,
    /// The element shows the number of items
    Items,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailSpec {
    #[serde(default, deserialize_with = "ordered")]
    pub fields: Vec<ScalarField>,
    #[serde(default)]
    pub sets: Vec<KeyValueSet>,
    #[serde(default)]
    pub offer: Option<OfferSpec>,
    /// Element the page must show before fields are read
    #[serde(default)]
    pub ready: Option<String>,
}

/// Where one value lives in a document.
#[derive(Debug, Clone, Deserialize)]
pub struct Selection {
    pub selector: String,
    /// Tried in order when `selector` matches nothing
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Read this attribute instead of the text
    #[serde(default)]
    pub attr: Option<String>,
    /// Join every match instead of taking the first
    #[serde(default)]
    pub all: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Selection {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            fallbacks: vec![],
            attr: None,
            all: false,
            separator: default_separator(),
        }
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.selector.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

fn default_separator() -> String {
    String::from("; ")
}

#[derive(Debug, Clone)]
pub struct ScalarField {
    pub name: String,
    pub selection: Selection,
}

/// Label/value pairs found under a container, each becoming a column.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyValueSet {
    pub container: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    /// Used when `key`/`value` are not given: the container text is cut at
    /// the first occurrence
    #[serde(default = "default_split")]
    pub split: String,
}

fn default_split() -> String {
    String::from(":")
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfferSpec {
    #[serde(default = "default_price")]
    pub price: String,
    #[serde(default = "default_mrp")]
    pub mrp: String,
    #[serde(default = "default_offer")]
    pub column: String,
    #[serde(default)]
    pub when_mrp_missing: MrpPolicy,
}

fn default_price() -> String {
    String::from("price")
}

fn default_mrp() -> String {
    String::from("mrp")
}

fn default_offer() -> String {
    String::from("offer")
}

/// What a missing MRP means when a price was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrpPolicy {
    /// Leave it unavailable
    #[default]
    Sentinel,
    /// No discount shown means the item sells at its MRP
    CopyPrice,
}

/// A YAML mapping `name: selection` read in document order.
fn ordered<'de, D>(deserializer: D) -> Result<Vec<ScalarField>, D::Error>
where
    D: Deserializer<'de>,
{
    struct FieldsVisitor;

    impl<'de> Visitor<'de> for FieldsVisitor {
        type Value = Vec<ScalarField>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of field names to selections")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut fields: Vec<ScalarField> = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, selection)) = map.next_entry::<String, Selection>()? {
                if fields.iter().any(|f| f.name == name) {
                    return Err(de::Error::custom(format!("duplicate field {name}")));
                }
                fields.push(ScalarField { name, selection });
            }
            Ok(fields)
        }
    }

    deserializer.deserialize_map(FieldsVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r##"
listing:
  card: "div.card"
  link: { selector: "a.title", attr: href }
  fields:
    thumb: { selector: "img", attr: src }
    name: { selector: "a.title" }
  total: { selector: "span.count", kind: items }
detail:
  fields:
    name: { selector: "h1", fallbacks: ["#title"] }
    price: { selector: ".price" }
    mrp: { selector: ".mrp" }
  sets:
    - container: ".specs li"
  offer: { when_mrp_missing: copy_price }
"##;

    #[test]
    fn parses_with_defaults_and_keeps_field_order() {
        let spec = FieldSpec::from_yaml(SPEC).unwrap();
        assert_eq!(spec.sentinel, "N/A");

        let listing = spec.listing.unwrap();
        let names = listing.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["thumb", "name"]);
        assert_eq!(listing.total.unwrap().kind, TotalKind::Items);

        let detail = spec.detail;
        let names = detail.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["name", "price", "mrp"]);
        assert_eq!(
            detail.fields[0].selection.selectors().collect::<Vec<_>>(),
            ["h1", "#title"]
        );
        assert_eq!(detail.sets[0].split, ":");

        let offer = detail.offer.unwrap();
        assert_eq!(offer.column, "offer");
        assert_eq!(offer.when_mrp_missing, MrpPolicy::CopyPrice);
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let raw = "detail:\n  fields:\n    a: { selector: p }\n    a: { selector: h1 }\n";
        assert!(FieldSpec::from_yaml(raw).is_err());
    }
}
