//! Idempotent upsert of canonical products plus append-only price history.

use chrono::{DateTime, Utc};
use petcat_adapters::{normalizer_for_source, NormalizeError};
use petcat_core::{CanonicalProduct, MergeStats, PricePoint, Product, StorePrice};
use petcat_storage::{CatalogStore, StoreError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::classify::PetTypeClassifier;

/// Record-level rejection; the rest of the batch continues.
#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("invalid price {price} for {identity}")]
    InvalidPrice { identity: String, price: f64 },
    #[error("record {identity} has no store")]
    MissingStore { identity: String },
}

/// Store connectivity was lost mid-run. Carries the counts reached so far.
#[derive(Debug, Error)]
#[error("merge aborted after {stats}: {source}")]
pub struct MergeAborted {
    pub stats: MergeStats,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Updated,
    Skipped,
}

enum RecordFailure {
    Rejected(MergeError),
    Store(StoreError),
}

impl From<StoreError> for RecordFailure {
    fn from(err: StoreError) -> Self {
        RecordFailure::Store(err)
    }
}

pub struct UpsertMerger<'a, S: ?Sized> {
    store: &'a S,
    classifier: &'a PetTypeClassifier,
    batch_size: usize,
}

impl<'a, S> UpsertMerger<'a, S>
where
    S: CatalogStore + ?Sized,
{
    pub fn new(store: &'a S, classifier: &'a PetTypeClassifier, batch_size: usize) -> Self {
        Self {
            store,
            classifier,
            batch_size: batch_size.max(1),
        }
    }

    /// Chunking bounds the work per round; results do not depend on chunk size.
    pub async fn merge(&self, records: &[CanonicalProduct]) -> Result<MergeStats, MergeAborted> {
        let span = info_span!("merge", records = records.len(), batch_size = self.batch_size);
        self.merge_chunks(records).instrument(span).await
    }

    async fn merge_chunks(&self, records: &[CanonicalProduct]) -> Result<MergeStats, MergeAborted> {
        let mut stats = MergeStats::default();

        for (chunk_no, chunk) in records.chunks(self.batch_size).enumerate() {
            let mut chunk_stats = MergeStats::default();
            for record in chunk {
                match self.merge_one(record).await {
                    Ok(Outcome::Created) => chunk_stats.created += 1,
                    Ok(Outcome::Updated) => chunk_stats.updated += 1,
                    Ok(Outcome::Skipped) => chunk_stats.skipped += 1,
                    Err(RecordFailure::Rejected(err)) => {
                        warn!(error = %err, "record rejected");
                        chunk_stats.errors += 1;
                    }
                    Err(RecordFailure::Store(err)) if err.is_fatal() => {
                        stats.absorb(chunk_stats);
                        return Err(MergeAborted { stats, source: err });
                    }
                    Err(RecordFailure::Store(err)) => {
                        warn!(identity = %record.identity(), error = %err, "record write failed");
                        chunk_stats.errors += 1;
                    }
                }
            }
            debug!(chunk = chunk_no, %chunk_stats, "merged chunk");
            stats.absorb(chunk_stats);
        }

        info!(%stats, "merge finished");
        Ok(stats)
    }

    async fn merge_one(&self, record: &CanonicalProduct) -> Result<Outcome, RecordFailure> {
        if record.source.trim().is_empty() || record.source_id.trim().is_empty() {
            return Ok(Outcome::Skipped);
        }
        validate(record).map_err(RecordFailure::Rejected)?;

        let identity = record.identity();
        let (product, outcome) = match self.store.find_product(&identity).await? {
            Some(mut existing) => {
                self.apply_observation(&mut existing, record);
                (existing, Outcome::Updated)
            }
            None => (self.new_product(record), Outcome::Created),
        };

        let observation = PricePoint {
            product_id: product.id,
            store: record.store.clone(),
            amount: record.price,
            currency: record.currency.clone(),
            recorded_at: record.observed_at,
        };
        self.store.commit_upsert(&product, &observation).await?;
        Ok(outcome)
    }

    fn new_product(&self, record: &CanonicalProduct) -> Product {
        Product {
            id: record.identity().product_id(),
            source: record.source.clone(),
            source_id: record.source_id.clone(),
            name: record.name.clone(),
            brand: record.brand.clone(),
            category: record.category.clone(),
            pet_type: self.classifier.classify(&record.name, record.category.as_deref()),
            image_url: record.image_url.clone(),
            prices: vec![store_price(record)],
            variants: record.variants.clone(),
            created_at: record.observed_at,
            updated_at: record.observed_at,
        }
    }

    fn apply_observation(&self, product: &mut Product, record: &CanonicalProduct) {
        product.name = record.name.clone();
        if record.brand.is_some() {
            product.brand = record.brand.clone();
        }
        if record.category.is_some() {
            product.category = record.category.clone();
        }
        if record.image_url.is_some() {
            product.image_url = record.image_url.clone();
        }
        product.pet_type = self.classifier.classify(&product.name, product.category.as_deref());

        let price = store_price(record);
        match product.prices.iter_mut().find(|p| p.store == price.store) {
            Some(slot) => *slot = price,
            None => {
                product.prices.push(price);
                product.prices.sort_by(|a, b| a.store.cmp(&b.store));
            }
        }

        if !record.variants.is_empty() {
            product.variants = record.variants.clone();
        }
        product.updated_at = record.observed_at;
    }
}

fn validate(record: &CanonicalProduct) -> Result<(), MergeError> {
    if !record.price.is_finite() || record.price < 0.0 {
        return Err(MergeError::InvalidPrice {
            identity: record.identity().to_string(),
            price: record.price,
        });
    }
    if record.store.trim().is_empty() {
        return Err(MergeError::MissingStore {
            identity: record.identity().to_string(),
        });
    }
    Ok(())
}

fn store_price(record: &CanonicalProduct) -> StorePrice {
    StorePrice {
        store: record.store.clone(),
        price: record.price,
        currency: record.currency.clone(),
        url: record.url.clone(),
        last_updated: record.observed_at,
        in_stock: record.in_stock,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub products: Vec<CanonicalProduct>,
    /// Records rejected for a missing identity or name.
    pub skipped: usize,
}

/// Normalize every raw record of one source. An unregistered source fails the
/// whole batch; a bad record only skips itself.
pub fn normalize_batch(
    records: &[JsonValue],
    source_tag: &str,
    observed_at: DateTime<Utc>,
) -> Result<NormalizedBatch, NormalizeError> {
    let normalizer =
        normalizer_for_source(source_tag).ok_or_else(|| NormalizeError::UnknownSource(source_tag.to_string()))?;
    let mut batch = NormalizedBatch::default();
    for (index, raw) in records.iter().enumerate() {
        match normalizer.normalize(raw, observed_at) {
            Ok(product) => batch.products.push(product),
            Err(err) => {
                debug!(source = source_tag, index, error = %err, "skipping raw record");
                batch.skipped += 1;
            }
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use petcat_core::{PetType, ProductIdentity, Variant};
    use petcat_storage::MemoryStore;
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, minute, 0).single().unwrap()
    }

    fn record(source_id: &str, name: &str, price: f64) -> CanonicalProduct {
        CanonicalProduct {
            source: "zooplus".into(),
            source_id: source_id.into(),
            name: name.into(),
            brand: Some("Royal Canin".into()),
            category: Some("Cibo secco cane".into()),
            image_url: None,
            store: "zooplus".into(),
            price,
            currency: "EUR".into(),
            url: None,
            in_stock: true,
            variants: vec![],
            observed_at: ts(0),
        }
    }

    #[tokio::test]
    async fn repeated_merges_keep_one_product_and_one_price_per_store() {
        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let merger = UpsertMerger::new(&store, &classifier, 50);
        let rec = record("A", "Royal Canin Adult 4kg", 20.0);

        let first = merger.merge(std::slice::from_ref(&rec)).await.unwrap();
        assert_eq!(first.created, 1);
        let mut again = rec.clone();
        again.price = 19.5;
        again.observed_at = ts(5);
        let second = merger.merge(&[again.clone(), again]).await.unwrap();
        assert_eq!(second.updated, 2);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].prices.len(), 1);
        assert_eq!(snapshot[0].prices[0].price, 19.5);
        assert_eq!(snapshot[0].pet_type, PetType::Dog);
        assert_eq!(snapshot[0].created_at, ts(0));
        assert_eq!(snapshot[0].updated_at, ts(5));
    }

    #[tokio::test]
    async fn every_merge_appends_a_price_point() {
        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let merger = UpsertMerger::new(&store, &classifier, 50);
        let rec = record("A", "Royal Canin Adult", 20.0);
        for _ in 0..4 {
            merger.merge(std::slice::from_ref(&rec)).await.unwrap();
        }
        let id = ProductIdentity::new("zooplus", "A").product_id();
        assert_eq!(store.price_history(id, None, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn new_store_price_is_appended_in_store_order() {
        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let merger = UpsertMerger::new(&store, &classifier, 50);
        let mut rec = record("A", "Royal Canin Adult", 20.0);
        rec.store = "zooplus-it".into();
        merger.merge(std::slice::from_ref(&rec)).await.unwrap();
        rec.store = "amazon".into();
        rec.price = 18.0;
        rec.variants = vec![Variant {
            variant_id: "4kg".into(),
            description: "4 kg".into(),
            available: true,
            price: Some(18.0),
        }];
        merger.merge(std::slice::from_ref(&rec)).await.unwrap();

        let product = store.find_product(&rec.identity()).await.unwrap().unwrap();
        let stores = product.prices.iter().map(|p| p.store.as_str()).collect::<Vec<_>>();
        assert_eq!(stores, vec!["amazon", "zooplus-it"]);
        assert_eq!(product.variants.len(), 1);
        assert_eq!(product.best_known_price(), Some(18.0));
    }

    #[tokio::test]
    async fn empty_incoming_variants_keep_existing_ones() {
        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let merger = UpsertMerger::new(&store, &classifier, 50);
        let mut rec = record("A", "Royal Canin Adult", 20.0);
        rec.variants = vec![Variant {
            variant_id: "v1".into(),
            description: "2 kg".into(),
            available: true,
            price: None,
        }];
        merger.merge(std::slice::from_ref(&rec)).await.unwrap();
        rec.variants.clear();
        merger.merge(std::slice::from_ref(&rec)).await.unwrap();
        let product = store.find_product(&rec.identity()).await.unwrap().unwrap();
        assert_eq!(product.variants.len(), 1);
    }

    #[tokio::test]
    async fn bad_record_is_isolated_from_the_batch() {
        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let merger = UpsertMerger::new(&store, &classifier, 3);
        let mut records = (0..10)
            .map(|i| record(&format!("P{i}"), &format!("Crocchette cane gusto {i}"), 10.0 + i as f64))
            .collect::<Vec<_>>();
        records[4].price = f64::NAN;
        records[6].store = String::new();

        let stats = merger.merge(&records).await.unwrap();
        assert_eq!(stats.created, 8);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.processed(), 10);
        assert_eq!(store.snapshot().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn missing_identity_in_raw_batch_is_skipped() {
        let raw = (0..10)
            .map(|i| {
                if i == 4 {
                    json!({"name": "Senza id", "price": 9.99})
                } else {
                    json!({"id": format!("Z{i}"), "name": format!("Snack per cani {i}"), "price": 3.5})
                }
            })
            .collect::<Vec<_>>();
        let batch = normalize_batch(&raw, "zooplus", ts(0)).unwrap();
        assert_eq!(batch.products.len(), 9);
        assert_eq!(batch.skipped, 1);

        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let stats = UpsertMerger::new(&store, &classifier, 50)
            .merge(&batch.products)
            .await
            .unwrap();
        assert_eq!(stats.created + stats.updated, 9);
    }

    #[test]
    fn unknown_source_fails_whole_batch() {
        let err = normalize_batch(&[json!({"id": 1})], "nowhere", ts(0)).unwrap_err();
        assert_eq!(err, NormalizeError::UnknownSource("nowhere".into()));
    }

    #[tokio::test]
    async fn chunk_size_does_not_change_the_result() {
        let mut records = (0..7)
            .map(|i| record(&format!("P{}", i % 4), &format!("Umido gatto {}", i % 4), 1.0 + i as f64))
            .collect::<Vec<_>>();
        for (i, rec) in records.iter_mut().enumerate() {
            rec.observed_at = ts(0) + Duration::minutes(i as i64);
        }

        let classifier = PetTypeClassifier::default();
        let small = MemoryStore::new();
        let large = MemoryStore::new();
        let small_stats = UpsertMerger::new(&small, &classifier, 2).merge(&records).await.unwrap();
        let large_stats = UpsertMerger::new(&large, &classifier, 100).merge(&records).await.unwrap();

        assert_eq!(small_stats, large_stats);
        assert_eq!(small.snapshot().await.unwrap(), large.snapshot().await.unwrap());
        assert_eq!(small.price_point_count().await, large.price_point_count().await);
    }

    #[tokio::test]
    async fn lost_store_aborts_with_partial_counts() {
        let store = MemoryStore::new();
        let classifier = PetTypeClassifier::default();
        let merger = UpsertMerger::new(&store, &classifier, 50);
        merger.merge(&[record("A", "Royal Canin Adult", 20.0)]).await.unwrap();

        store.set_available(false);
        let aborted = merger
            .merge(&[record("B", "Royal Canin Mini", 18.0), record("C", "Royal Canin Maxi", 30.0)])
            .await
            .unwrap_err();
        assert!(aborted.source.is_fatal());
        assert_eq!(aborted.stats.processed(), 0);
    }
}
