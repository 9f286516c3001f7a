use once_cell::sync::Lazy;
use regex::Regex;

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d[\d,]*(?:\.\d+)?|\.\d+").unwrap_or_else(|e| panic!("invalid number regex: {e}"))
});

/// First decimal number in `raw`, currency symbols and thousands separators
/// ignored: `"₹1,299.00"` is `1299.0`.
pub fn parse_number(raw: &str) -> Option<f64> {
    NUMBER
        .find(raw)
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// Last number in `raw`, for texts like `"Page 1 of 25"`.
pub fn last_number(raw: &str) -> Option<f64> {
    NUMBER
        .find_iter(raw)
        .last()
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// Discount of `price` against `mrp` as `"33.33%"`, the sentinel when either
/// value is unusable or there is no discount.
pub fn offer_percentage(price: &str, mrp: &str, sentinel: &str) -> String {
    match (parse_number(price), parse_number(mrp)) {
        (Some(p), Some(m)) if p > 0.0 && m > p => format!("{:.2}%", (m - p) / m * 100.0),
        _ => sentinel.to_string(),
    }
}
