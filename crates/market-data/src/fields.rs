//! Ordered field-name synonym tables and tolerant numeric extraction.
//!
//! Providers rename fields between API versions. Each canonical quantity is
//! looked up through an ordered list of labels; the first label holding a
//! usable number wins and values are never merged across labels.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use valuation_core::CashFlowPeriod;

/// A path of object keys from a JSON root to a field.
pub type FieldPath = &'static [&'static str];

#[derive(Debug, Clone, Copy)]
pub struct FieldSynonyms {
    pub operating_cash_flow: &'static [&'static str],
    pub capital_expenditure: &'static [&'static str],
    pub free_cash_flow: &'static [&'static str],
    pub period_end: &'static [&'static str],
}

impl FieldSynonyms {
    /// Build a canonical period. `dated` holds the period-end field and
    /// `values` the cash-flow line items (the same object for most providers).
    pub fn extract_period(&self, dated: &Value, values: &Value) -> CashFlowPeriod {
        CashFlowPeriod {
            period_end: first_date(dated, self.period_end),
            operating_cash_flow: first_numeric(values, self.operating_cash_flow),
            capital_expenditure: first_numeric(values, self.capital_expenditure),
            free_cash_flow: first_numeric(values, self.free_cash_flow),
        }
    }
}

/// Read a number from the shapes providers use: plain numbers, numeric
/// strings, `{"raw": n}` (Yahoo) and `{"value": n}` (Polygon).
pub fn numeric_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("none") || s == "-" {
                None
            } else {
                s.parse::<f64>().ok()
            }
        }
        Value::Object(map) => map
            .get("raw")
            .or_else(|| map.get("value"))
            .and_then(numeric_value),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// First key in `keys` whose value is present and numeric.
pub fn first_numeric(record: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| record.get(*key).and_then(numeric_value))
}

fn value_at<'a>(root: &'a Value, path: FieldPath) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, key| node.get(*key))
}

/// First path in `paths` that resolves to a numeric value.
pub fn first_numeric_at(root: &Value, paths: &[FieldPath]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| value_at(root, path).and_then(numeric_value))
}

fn date_value(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.date_naive()),
        Value::Object(map) => map
            .get("fmt")
            .and_then(date_value)
            .or_else(|| map.get("raw").and_then(date_value)),
        _ => None,
    }
}

pub fn first_date(record: &Value, keys: &[&str]) -> Option<NaiveDate> {
    keys.iter().find_map(|key| record.get(*key).and_then(date_value))
}
