//! Cross-source entity resolution over a catalog snapshot.
//!
//! Names are reduced to token sets, compared pairwise with Jaccard similarity
//! inside each pet type partition, and every pair at or above the threshold
//! becomes two directed edges carrying identical metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use petcat_core::{PetType, Product, SimilarProductEdge};
use petcat_storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_STOP_WORDS: &[&str] = &[
    "per", "con", "del", "della", "delle", "dei", "degli", "dello", "di", "da", "in", "il", "lo", "la",
    "le", "gli", "un", "uno", "una", "e", "ed", "al", "allo", "alla", "alle", "ai", "agli", "nel",
    "nella", "nei", "sul", "sulla", "su", "senza", "the", "and", "for", "with",
];

const DEFAULT_UNITS: &[&str] = &[
    "kg", "g", "gr", "mg", "ml", "l", "lt", "cl", "cm", "mm", "m", "pz", "pcs", "x",
];

#[derive(Debug, Clone, Deserialize)]
struct SimilarityRulesFile {
    #[serde(default)]
    stop_words: Vec<String>,
    #[serde(default)]
    units: Vec<String>,
}

/// Tokenizer configured with stop words and units of measure.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    stop_words: BTreeSet<String>,
    units: BTreeSet<String>,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(
            DEFAULT_STOP_WORDS.iter().map(|s| s.to_string()),
            DEFAULT_UNITS.iter().map(|s| s.to_string()),
        )
    }
}

impl TextNormalizer {
    pub fn new(stop_words: impl IntoIterator<Item = String>, units: impl IntoIterator<Item = String>) -> Self {
        Self {
            stop_words: stop_words.into_iter().map(|w| w.to_lowercase()).collect(),
            units: units.into_iter().map(|u| u.to_lowercase()).collect(),
        }
    }

    /// Loads `rules/similarity.yaml`; built-in lists fill any list left empty.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("similarity.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: SimilarityRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let defaults = Self::default();
        Ok(Self {
            stop_words: if file.stop_words.is_empty() {
                defaults.stop_words
            } else {
                file.stop_words.iter().map(|w| w.to_lowercase()).collect()
            },
            units: if file.units.is_empty() {
                defaults.units
            } else {
                file.units.iter().map(|u| u.to_lowercase()).collect()
            },
        })
    }

    pub fn tokens(&self, text: &str) -> BTreeSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .filter(|token| !self.is_quantity(token))
            .filter(|token| token.chars().count() > 2)
            .filter(|token| !self.stop_words.contains(*token) && !self.units.contains(*token))
            .map(ToString::to_string)
            .collect()
    }

    /// Standalone numbers and glued quantities such as `4kg` or `12x85g`.
    fn is_quantity(&self, token: &str) -> bool {
        if !token.chars().any(|c| c.is_ascii_digit()) {
            return false;
        }
        let letters: String = token.chars().filter(|c| !c.is_ascii_digit()).collect();
        if letters.is_empty() || self.units.contains(&letters) {
            return true;
        }
        match letters.strip_prefix('x') {
            Some(rest) => rest.is_empty() || self.units.contains(rest),
            None => false,
        }
    }
}

/// `|A ∩ B| / |A ∪ B|`; two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { threshold: 0.7 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveStats {
    pub products: usize,
    pub compared_pairs: usize,
    pub retained_pairs: usize,
    /// Retained pairs dropped because one side has no known price.
    pub unpriced_pairs: usize,
    pub edges: usize,
}

impl fmt::Display for ResolveStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "products={} compared={} retained={} unpriced={} edges={}",
            self.products, self.compared_pairs, self.retained_pairs, self.unpriced_pairs, self.edges
        )
    }
}

/// The store failed during a resolve run. Carries the counts reached so far.
#[derive(Debug, Error)]
#[error("resolve aborted after {stats}: {source}")]
pub struct ResolveAborted {
    pub stats: ResolveStats,
    #[source]
    pub source: StoreError,
}

pub struct SimilarityResolver {
    config: ResolverConfig,
    text: TextNormalizer,
}

struct Candidate<'a> {
    product: &'a Product,
    tokens: BTreeSet<String>,
}

impl SimilarityResolver {
    pub fn new(config: ResolverConfig, text: TextNormalizer) -> Self {
        Self { config, text }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        jaccard(&self.text.tokens(a), &self.text.tokens(b))
    }

    pub fn resolve(&self, snapshot: &[Product], now: DateTime<Utc>) -> Vec<SimilarProductEdge> {
        self.resolve_with_stats(snapshot, now).0
    }

    /// All-pairs comparison restricted to cross-source pairs in the same pet
    /// type partition. Quadratic in partition size.
    pub fn resolve_with_stats(
        &self,
        snapshot: &[Product],
        now: DateTime<Utc>,
    ) -> (Vec<SimilarProductEdge>, ResolveStats) {
        let mut stats = ResolveStats {
            products: snapshot.len(),
            ..Default::default()
        };

        let mut partitions: BTreeMap<PetType, Vec<Candidate<'_>>> = BTreeMap::new();
        for product in snapshot {
            partitions.entry(product.pet_type).or_default().push(Candidate {
                product,
                tokens: self.text.tokens(&product.name),
            });
        }

        let mut edges = Vec::new();
        for candidates in partitions.values() {
            for (i, a) in candidates.iter().enumerate() {
                for b in &candidates[i + 1..] {
                    if a.product.source == b.product.source {
                        continue;
                    }
                    stats.compared_pairs += 1;
                    let similarity = jaccard(&a.tokens, &b.tokens);
                    if similarity < self.config.threshold {
                        continue;
                    }
                    stats.retained_pairs += 1;
                    let (Some(price_a), Some(price_b)) =
                        (a.product.best_known_price(), b.product.best_known_price())
                    else {
                        stats.unpriced_pairs += 1;
                        continue;
                    };
                    let edge = SimilarProductEdge {
                        product_id: a.product.id,
                        similar_product_id: b.product.id,
                        similarity,
                        price_difference: (price_a - price_b).abs(),
                        price_ratio: price_a.max(price_b) / price_a.min(price_b),
                        updated_at: now,
                    };
                    edges.push(edge.reversed());
                    edges.push(edge);
                }
            }
        }

        edges.sort_by(|x, y| {
            (x.product_id, x.similar_product_id).cmp(&(y.product_id, y.similar_product_id))
        });
        stats.edges = edges.len();
        (edges, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use petcat_core::{ProductIdentity, StorePrice};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 3, 0, 0).single().unwrap()
    }

    fn set(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn product(source: &str, id: &str, name: &str, pet_type: PetType, price: Option<f64>) -> Product {
        let identity = ProductIdentity::new(source, id);
        Product {
            id: identity.product_id(),
            source: source.into(),
            source_id: id.into(),
            name: name.into(),
            brand: None,
            category: None,
            pet_type,
            image_url: None,
            prices: price
                .map(|p| StorePrice {
                    store: source.into(),
                    price: p,
                    currency: "EUR".into(),
                    url: None,
                    last_updated: now(),
                    in_stock: true,
                })
                .into_iter()
                .collect(),
            variants: vec![],
            created_at: now(),
            updated_at: now(),
        }
    }

    fn resolver(threshold: f64) -> SimilarityResolver {
        SimilarityResolver::new(ResolverConfig { threshold }, TextNormalizer::default())
    }

    #[test]
    fn jaccard_identity_disjoint_and_symmetry() {
        let x = set(&["royal", "canin", "adult"]);
        assert_eq!(jaccard(&x, &x), 1.0);
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["c", "d"])), 0.0);
        let y = set(&["royal", "canin", "mini", "puppy"]);
        assert_eq!(jaccard(&x, &y), jaccard(&y, &x));
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn tokens_drop_quantities_units_stop_words_and_short_tokens() {
        let text = TextNormalizer::default();
        assert_eq!(text.tokens("Royal Canin Adult 4kg"), set(&["royal", "canin", "adult"]));
        assert_eq!(text.tokens("Royal Canin Adult 4 kg"), set(&["royal", "canin", "adult"]));
        assert_eq!(
            text.tokens("Bocconcini per gatti, con Pollo (12x85g)"),
            set(&["bocconcini", "gatti", "pollo"])
        );
        assert_eq!(text.tokens("Sabbia 10 lt - XL"), set(&["sabbia"]));
    }

    #[test]
    fn threshold_is_inclusive() {
        let a = product("s1", "1", "Royal Canin Adult Pollo", PetType::Dog, Some(10.0));
        let b = product("s2", "2", "Royal Canin Adult Manzo", PetType::Dog, Some(12.0));
        let at_cutoff = resolver(0.6).resolve(&[a.clone(), b.clone()], now());
        assert_eq!(at_cutoff.len(), 2);
        let above_cutoff = resolver(0.6 + 1e-9).resolve(&[a, b], now());
        assert!(above_cutoff.is_empty());
    }

    #[test]
    fn same_source_pairs_never_link() {
        let a = product("s1", "1", "Royal Canin Adult", PetType::Dog, Some(10.0));
        let b = product("s1", "2", "Royal Canin Adult", PetType::Dog, Some(11.0));
        assert!(resolver(0.7).resolve(&[a, b], now()).is_empty());
    }

    #[test]
    fn different_pet_types_never_link() {
        let a = product("s1", "1", "Royal Canin Adult", PetType::Dog, Some(10.0));
        let b = product("s2", "2", "Royal Canin Adult", PetType::Cat, Some(11.0));
        assert!(resolver(0.7).resolve(&[a, b], now()).is_empty());
    }

    #[test]
    fn unpriced_pairs_are_not_materialized() {
        let a = product("s1", "1", "Royal Canin Adult", PetType::Dog, Some(10.0));
        let b = product("s2", "2", "Royal Canin Adult", PetType::Dog, Some(0.0));
        let (edges, stats) = resolver(0.7).resolve_with_stats(&[a, b], now());
        assert!(edges.is_empty());
        assert_eq!(stats.retained_pairs, 1);
        assert_eq!(stats.unpriced_pairs, 1);
    }

    #[test]
    fn edges_come_in_symmetric_pairs() {
        let products = vec![
            product("s1", "1", "Royal Canin Adult 4kg", PetType::Dog, Some(20.0)),
            product("s2", "2", "Royal Canin Adult 4 kg", PetType::Dog, Some(24.0)),
            product("s3", "3", "Royal Canin Adult", PetType::Dog, Some(22.0)),
            product("s3", "4", "Trixie Tiragraffi Torre", PetType::Cat, Some(40.0)),
        ];
        let (edges, stats) = resolver(0.7).resolve_with_stats(&products, now());
        assert_eq!(stats.retained_pairs, 3);
        assert_eq!(edges.len(), 6);
        for edge in &edges {
            let back = edges
                .iter()
                .find(|e| e.product_id == edge.similar_product_id && e.similar_product_id == edge.product_id)
                .expect("reverse edge");
            assert_eq!(back.similarity, edge.similarity);
            assert_eq!(back.price_difference, edge.price_difference);
            assert_eq!(back.price_ratio, edge.price_ratio);
        }
    }

    #[test]
    fn price_metrics_use_lowest_known_price() {
        let a = product("s1", "1", "Royal Canin Adult", PetType::Dog, Some(20.0));
        let b = product("s2", "2", "Royal Canin Adult", PetType::Dog, Some(24.0));
        let edges = resolver(0.7).resolve(&[a, b], now());
        assert_eq!(edges.len(), 2);
        assert!((edges[0].price_difference - 4.0).abs() < 1e-9);
        assert!((edges[0].price_ratio - 1.2).abs() < 1e-9);
    }
}
