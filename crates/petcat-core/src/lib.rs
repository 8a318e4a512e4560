//! Core domain model for the pet product price catalog.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "petcat-core";

/// Namespace for deterministic product ids derived from `(source, source_id)`.
const PRODUCT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_0c2e_94d3_4a57_8a0e_5f2d_7c31_b9e4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PetType {
    Dog,
    Cat,
    SmallAnimal,
    #[default]
    Other,
}

impl PetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PetType::Dog => "dog",
            PetType::Cat => "cat",
            PetType::SmallAnimal => "small-animal",
            PetType::Other => "other",
        }
    }
}

impl fmt::Display for PetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dog" => Ok(PetType::Dog),
            "cat" => Ok(PetType::Cat),
            "small-animal" | "small_animal" => Ok(PetType::SmallAnimal),
            "other" => Ok(PetType::Other),
            other => Err(format!("unknown pet type: {other}")),
        }
    }
}

/// `(source, source_id)` pair naming one canonical product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductIdentity {
    pub source: String,
    pub source_id: String,
}

impl ProductIdentity {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
        }
    }

    /// Stable id for this identity; the same pair always maps to the same id.
    pub fn product_id(&self) -> Uuid {
        let key = format!("{}:{}", self.source, self.source_id);
        Uuid::new_v5(&PRODUCT_ID_NAMESPACE, key.as_bytes())
    }
}

impl fmt::Display for ProductIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

/// Live price of a product at one store. At most one per store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorePrice {
    pub store: String,
    pub price: f64,
    pub currency: String,
    pub url: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub in_stock: bool,
}

impl StorePrice {
    /// Zero means the source did not publish a usable price.
    pub fn is_known(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub variant_id: String,
    pub description: String,
    pub available: bool,
    pub price: Option<f64>,
}

/// Canonical persisted product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub pet_type: PetType,
    pub image_url: Option<String>,
    /// Ordered by `store`.
    pub prices: Vec<StorePrice>,
    pub variants: Vec<Variant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn identity(&self) -> ProductIdentity {
        ProductIdentity::new(self.source.clone(), self.source_id.clone())
    }

    pub fn price_for_store(&self, store: &str) -> Option<&StorePrice> {
        self.prices.iter().find(|p| p.store == store)
    }

    /// Lowest known live price across all stores.
    pub fn best_known_price(&self) -> Option<f64> {
        self.prices
            .iter()
            .filter(|p| p.is_known())
            .map(|p| p.price)
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Normalized handoff contract from source normalizers into the merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub source: String,
    pub source_id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub store: String,
    pub price: f64,
    pub currency: String,
    pub url: Option<String>,
    pub in_stock: bool,
    pub variants: Vec<Variant>,
    pub observed_at: DateTime<Utc>,
}

impl CanonicalProduct {
    pub fn identity(&self) -> ProductIdentity {
        ProductIdentity::new(self.source.clone(), self.source_id.clone())
    }
}

/// Immutable price observation. Appended once per merge event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub product_id: Uuid,
    pub store: String,
    pub amount: f64,
    pub currency: String,
    pub recorded_at: DateTime<Utc>,
}

/// Directed similarity link. Stored in symmetric pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarProductEdge {
    pub product_id: Uuid,
    pub similar_product_id: Uuid,
    pub similarity: f64,
    pub price_difference: f64,
    pub price_ratio: f64,
    pub updated_at: DateTime<Utc>,
}

impl SimilarProductEdge {
    pub fn reversed(&self) -> Self {
        Self {
            product_id: self.similar_product_id,
            similar_product_id: self.product_id,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl MergeStats {
    pub fn absorb(&mut self, other: MergeStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    pub fn processed(&self) -> usize {
        self.created + self.updated + self.skipped + self.errors
    }
}

impl fmt::Display for MergeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} skipped={} errors={}",
            self.created, self.updated, self.skipped, self.errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn price(store: &str, amount: f64) -> StorePrice {
        StorePrice {
            store: store.to_string(),
            price: amount,
            currency: "EUR".into(),
            url: None,
            last_updated: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
            in_stock: true,
        }
    }

    #[test]
    fn product_id_is_stable_per_identity() {
        let a = ProductIdentity::new("zooplus", "123");
        let b = ProductIdentity::new("zooplus", "123");
        let c = ProductIdentity::new("arcaplanet", "123");
        assert_eq!(a.product_id(), b.product_id());
        assert_ne!(a.product_id(), c.product_id());
    }

    #[test]
    fn pet_type_round_trips_through_serde_and_str() {
        let json = serde_json::to_string(&PetType::SmallAnimal).unwrap();
        assert_eq!(json, "\"small-animal\"");
        assert_eq!("small-animal".parse::<PetType>().unwrap(), PetType::SmallAnimal);
        assert!("fish".parse::<PetType>().is_err());
    }

    #[test]
    fn best_known_price_ignores_unknown_amounts() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let product = Product {
            id: Uuid::nil(),
            source: "zooplus".into(),
            source_id: "1".into(),
            name: "Crocchette".into(),
            brand: None,
            category: None,
            pet_type: PetType::Dog,
            image_url: None,
            prices: vec![price("a", 0.0), price("b", 12.5), price("c", 9.9)],
            variants: vec![],
            created_at: now,
            updated_at: now,
        };
        assert_eq!(product.best_known_price(), Some(9.9));
    }

    #[test]
    fn reversed_edge_keeps_metrics() {
        let edge = SimilarProductEdge {
            product_id: Uuid::from_u128(1),
            similar_product_id: Uuid::from_u128(2),
            similarity: 0.8,
            price_difference: 4.0,
            price_ratio: 1.2,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
        };
        let rev = edge.reversed();
        assert_eq!(rev.product_id, edge.similar_product_id);
        assert_eq!(rev.similar_product_id, edge.product_id);
        assert_eq!(rev.similarity, edge.similarity);
        assert_eq!(rev.price_ratio, edge.price_ratio);
    }
}
