//! Per-source normalizers mapping raw listing records into canonical products.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use petcat_core::{CanonicalProduct, Variant};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "petcat-adapters";

const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{source_tag} record is missing required field `{field}`")]
    MissingRequiredField {
        source_tag: String,
        field: &'static str,
    },
    #[error("no normalizer registered for source `{0}`")]
    UnknownSource(String),
}

/// One field-mapping strategy per source. Implementations are pure.
pub trait SourceNormalizer: Send + Sync {
    fn source_tag(&self) -> &'static str;

    fn normalize(&self, raw: &JsonValue, observed_at: DateTime<Utc>) -> Result<CanonicalProduct, NormalizeError>;
}

pub const REGISTERED_SOURCES: &[&str] = &["zooplus", "arcaplanet", "isoladeitesori"];

pub fn normalizer_for_source(source_tag: &str) -> Option<Box<dyn SourceNormalizer>> {
    match source_tag {
        "zooplus" => Some(Box::new(ZooplusNormalizer)),
        "arcaplanet" => Some(Box::new(ArcaplanetNormalizer)),
        "isoladeitesori" => Some(Box::new(IsolaDeiTesoriNormalizer)),
        _ => None,
    }
}

/// Normalize one raw record with the strategy registered for `source_tag`.
pub fn normalize(
    raw: &JsonValue,
    source_tag: &str,
    observed_at: DateTime<Utc>,
) -> Result<CanonicalProduct, NormalizeError> {
    let normalizer = normalizer_for_source(source_tag)
        .ok_or_else(|| NormalizeError::UnknownSource(source_tag.to_string()))?;
    normalizer.normalize(raw, observed_at)
}

/// Accepts a bare JSON array or an object wrapping it under a known key.
pub fn parse_raw_records(bytes: &[u8]) -> Result<Vec<JsonValue>> {
    let value: JsonValue = serde_json::from_slice(bytes).context("parsing raw payload as JSON")?;
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => {
            for key in ["products", "items", "results"] {
                if let Some(JsonValue::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            anyhow::bail!("raw payload object has no products/items/results array")
        }
        other => anyhow::bail!("raw payload must be a JSON array, got {}", json_kind(&other)),
    }
}

pub fn load_raw_records(path: impl AsRef<Path>) -> Result<Vec<JsonValue>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_raw_records(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match segment.parse::<usize>() {
            Ok(idx) => cur.get(idx)?,
            Err(_) => cur.get(*segment)?,
        };
    }
    Some(cur)
}

/// Text at `path`; numbers are rendered so numeric ids survive.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(value: &JsonValue, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| json_text(value, path))
}

fn json_flag(value: &JsonValue, path: &[&str]) -> Option<bool> {
    match json_at(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_f64().map(|v| v > 0.0),
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "in_stock" | "instock" | "available" | "disponibile" => Some(true),
            "false" | "no" | "0" | "out_of_stock" | "outofstock" | "unavailable" | "esaurito" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn json_price(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price_text(s),
        _ => None,
    }
}

fn first_price(value: &JsonValue, paths: &[&[&str]]) -> Option<f64> {
    paths.iter().find_map(|path| json_price(value, path))
}

/// Parses shop-formatted amounts such as `12,99 €`, `1.299,00` or `€ 4.50`.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(_)) if dots_group_thousands(&cleaned) => cleaned.replace('.', ""),
        _ => cleaned,
    };
    normalized.parse::<f64>().ok()
}

/// `1.299` and `12.500.000`: every group after the first dot has three digits.
fn dots_group_thousands(text: &str) -> bool {
    let mut groups = text.split('.');
    let lead = groups.next().unwrap_or_default().trim_start_matches('-');
    !lead.is_empty()
        && lead.len() <= 3
        && !lead.starts_with('0')
        && groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

fn required(value: Option<String>, source_tag: &str, field: &'static str) -> Result<String, NormalizeError> {
    value.ok_or_else(|| NormalizeError::MissingRequiredField {
        source_tag: source_tag.to_string(),
        field,
    })
}

/// Either a plain URL string or an object carrying `url`.
fn image_at(value: &JsonValue, path: &[&str]) -> Option<String> {
    let node = json_at(value, path)?;
    match node {
        JsonValue::String(_) => json_text(node, &[]),
        JsonValue::Object(_) => json_text(node, &["url"]),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct ZooplusNormalizer;

impl SourceNormalizer for ZooplusNormalizer {
    fn source_tag(&self) -> &'static str {
        "zooplus"
    }

    fn normalize(&self, raw: &JsonValue, observed_at: DateTime<Utc>) -> Result<CanonicalProduct, NormalizeError> {
        let tag = self.source_tag();
        let source_id = required(first_text(raw, &[&["id"], &["sku"]]), tag, "id")?;
        let name = required(first_text(raw, &[&["title"], &["name"]]), tag, "name")?;
        let category = json_text(raw, &["category"]).or_else(|| {
            json_at(raw, &["breadcrumbs"])
                .and_then(JsonValue::as_array)
                .map(|crumbs| {
                    crumbs
                        .iter()
                        .filter_map(|c| json_text(c, &[]))
                        .collect::<Vec<_>>()
                        .join(" > ")
                })
                .filter(|joined| !joined.is_empty())
        });
        let variants = json_at(raw, &["variants"])
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| {
                        Some(Variant {
                            variant_id: first_text(v, &[&["id"], &["sku"]])?,
                            description: first_text(v, &[&["label"], &["description"]]).unwrap_or_default(),
                            available: json_flag(v, &["available"]).unwrap_or(true),
                            price: json_price(v, &["price"]),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CanonicalProduct {
            source: tag.to_string(),
            source_id,
            name,
            brand: json_text(raw, &["brand"]),
            category,
            image_url: image_at(raw, &["images", "0"]),
            store: tag.to_string(),
            price: first_price(raw, &[&["price"], &["price", "amount"]]).unwrap_or(0.0),
            currency: json_text(raw, &["currency"]).unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            url: json_text(raw, &["url"]),
            in_stock: json_flag(raw, &["available"]).unwrap_or(true),
            variants,
            observed_at,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ArcaplanetNormalizer;

impl SourceNormalizer for ArcaplanetNormalizer {
    fn source_tag(&self) -> &'static str {
        "arcaplanet"
    }

    fn normalize(&self, raw: &JsonValue, observed_at: DateTime<Utc>) -> Result<CanonicalProduct, NormalizeError> {
        let tag = self.source_tag();
        let source_id = required(first_text(raw, &[&["sku"], &["id"]]), tag, "id")?;
        let name = required(first_text(raw, &[&["name"], &["title"]]), tag, "name")?;
        let in_stock = json_flag(raw, &["stock"])
            .or_else(|| json_flag(raw, &["inStock"]))
            .unwrap_or(true);
        let variants = json_at(raw, &["options"])
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|o| {
                        Some(Variant {
                            variant_id: json_text(o, &["code"])?,
                            description: json_text(o, &["name"]).unwrap_or_default(),
                            available: json_flag(o, &["inStock"]).unwrap_or(true),
                            price: first_price(o, &[&["price", "value"], &["price"]]),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(CanonicalProduct {
            source: tag.to_string(),
            source_id,
            name,
            brand: first_text(raw, &[&["brand", "name"], &["brand"]]),
            category: first_text(raw, &[&["categories", "0"], &["category"]]),
            image_url: image_at(raw, &["image"]).or_else(|| image_at(raw, &["images", "0"])),
            store: tag.to_string(),
            price: first_price(raw, &[&["price", "value"], &["price"]]).unwrap_or(0.0),
            currency: json_text(raw, &["price", "currency"]).unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            url: first_text(raw, &[&["link"], &["url"]]),
            in_stock,
            variants,
            observed_at,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct IsolaDeiTesoriNormalizer;

impl SourceNormalizer for IsolaDeiTesoriNormalizer {
    fn source_tag(&self) -> &'static str {
        "isoladeitesori"
    }

    fn normalize(&self, raw: &JsonValue, observed_at: DateTime<Utc>) -> Result<CanonicalProduct, NormalizeError> {
        let tag = self.source_tag();
        let source_id = required(first_text(raw, &[&["productId"], &["id"]]), tag, "id")?;
        let name = required(first_text(raw, &[&["productName"], &["name"]]), tag, "name")?;

        Ok(CanonicalProduct {
            source: tag.to_string(),
            source_id,
            name,
            brand: first_text(raw, &[&["manufacturer"], &["brand"]]),
            category: first_text(raw, &[&["breadcrumb"], &["category"]]),
            image_url: image_at(raw, &["media", "0"]),
            store: tag.to_string(),
            price: first_price(raw, &[&["finalPrice"], &["price"]]).unwrap_or(0.0),
            currency: DEFAULT_CURRENCY.to_string(),
            url: json_text(raw, &["url"]),
            in_stock: json_flag(raw, &["inStock"]).unwrap_or(true),
            variants: Vec::new(),
            observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GoldenProduct {
        source_id: String,
        name: String,
        brand: Option<String>,
        category: Option<String>,
        image_url: Option<String>,
        store: String,
        price: f64,
        currency: String,
        in_stock: bool,
        variant_count: usize,
    }

    fn observed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_dir(source_tag: &str) -> PathBuf {
        workspace_root().join("fixtures").join(source_tag).join("sample")
    }

    fn to_golden(products: &[CanonicalProduct]) -> Vec<GoldenProduct> {
        products
            .iter()
            .map(|p| GoldenProduct {
                source_id: p.source_id.clone(),
                name: p.name.clone(),
                brand: p.brand.clone(),
                category: p.category.clone(),
                image_url: p.image_url.clone(),
                store: p.store.clone(),
                price: p.price,
                currency: p.currency.clone(),
                in_stock: p.in_stock,
                variant_count: p.variants.len(),
            })
            .collect()
    }

    fn assert_matches_snapshot(source_tag: &str) {
        let dir = fixture_dir(source_tag);
        let records = load_raw_records(dir.join("records.json")).unwrap();
        let products = records
            .iter()
            .map(|r| normalize(r, source_tag, observed_at()).unwrap())
            .collect::<Vec<_>>();
        let expected: Vec<GoldenProduct> =
            serde_json::from_str(&fs::read_to_string(dir.join("snapshot.json")).unwrap()).unwrap();
        assert_eq!(to_golden(&products), expected);
    }

    #[test]
    fn golden_snapshot_zooplus() {
        assert_matches_snapshot("zooplus");
    }

    #[test]
    fn golden_snapshot_arcaplanet() {
        assert_matches_snapshot("arcaplanet");
    }

    #[test]
    fn golden_snapshot_isoladeitesori() {
        assert_matches_snapshot("isoladeitesori");
    }

    #[test]
    fn missing_identity_is_rejected() {
        let err = normalize(&json!({ "title": "Crocchette" }), "zooplus", observed_at()).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingRequiredField {
                source_tag: "zooplus".into(),
                field: "id"
            }
        );
    }

    #[test]
    fn blank_name_is_rejected() {
        let err = normalize(&json!({ "sku": "A1", "name": "   " }), "arcaplanet", observed_at()).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingRequiredField { field: "name", .. }));
    }

    #[test]
    fn unknown_source_is_reported() {
        let err = normalize(&json!({ "id": "1", "name": "x" }), "petsmart", observed_at()).unwrap_err();
        assert_eq!(err, NormalizeError::UnknownSource("petsmart".into()));
    }

    #[test]
    fn non_numeric_price_normalizes_to_zero() {
        let product = normalize(
            &json!({ "id": "1", "title": "Tiragraffi", "price": "su richiesta" }),
            "zooplus",
            observed_at(),
        )
        .unwrap();
        assert_eq!(product.price, 0.0);
    }

    #[test]
    fn normalization_is_deterministic() {
        let raw = json!({ "productId": "9", "productName": "Gioco per gatti", "finalPrice": "3,20 €" });
        let a = normalize(&raw, "isoladeitesori", observed_at()).unwrap();
        let b = normalize(&raw, "isoladeitesori", observed_at()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn price_text_formats() {
        assert_eq!(parse_price_text("12,99 €"), Some(12.99));
        assert_eq!(parse_price_text("1.299,00"), Some(1299.0));
        assert_eq!(parse_price_text("€ 4.50"), Some(4.5));
        assert_eq!(parse_price_text("1,299.00"), Some(1299.0));
        assert_eq!(parse_price_text("gratis"), None);
    }

    #[test]
    fn lone_dot_before_three_digits_groups_thousands() {
        assert_eq!(parse_price_text("1.299 €"), Some(1299.0));
        assert_eq!(parse_price_text("€ 12.500"), Some(12500.0));
        assert_eq!(parse_price_text("1.250.000"), Some(1_250_000.0));
        assert_eq!(parse_price_text("0.750"), Some(0.75));
        assert_eq!(parse_price_text("19.9"), Some(19.9));
    }

    #[test]
    fn wrapped_payloads_are_unwrapped() {
        let items = parse_raw_records(br#"{"items":[{"id":1},{"id":2}]}"#).unwrap();
        assert_eq!(items.len(), 2);
        assert!(parse_raw_records(br#"{"data":{}}"#).is_err());
        assert!(parse_raw_records(b"42").is_err());
    }

    #[test]
    fn load_raw_records_names_the_failing_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("cani.json");
        fs::write(&good, br#"{"results":[{"id":"a"}]}"#).unwrap();
        assert_eq!(load_raw_records(&good).unwrap().len(), 1);

        let bad = dir.path().join("gatti.json");
        fs::write(&bad, b"<html>").unwrap();
        let err = load_raw_records(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("gatti.json"));
    }

    #[test]
    fn every_registered_source_has_a_normalizer() {
        for tag in REGISTERED_SOURCES {
            let normalizer = normalizer_for_source(tag).expect("registered");
            assert_eq!(normalizer.source_tag(), *tag);
        }
    }
}
