//! Persistence boundary for the catalog, price history and similarity edges.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use petcat_core::{PetType, PricePoint, Product, ProductIdentity, SimilarProductEdge};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity to the store is gone; no further writes are possible.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilter {
    pub pet_type: Option<PetType>,
    pub category: Option<String>,
    pub brand: Option<String>,
}

impl ProductFilter {
    pub fn matches(&self, product: &Product) -> bool {
        fn same(wanted: &Option<String>, actual: &Option<String>) -> bool {
            match (wanted, actual) {
                (None, _) => true,
                (Some(w), Some(a)) => w.eq_ignore_ascii_case(a),
                (Some(_), None) => false,
            }
        }
        self.pet_type.map_or(true, |p| p == product.pet_type)
            && same(&self.category, &product.category)
            && same(&self.brand, &product.brand)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeOrder {
    #[default]
    Similarity,
    /// Largest price difference first.
    Savings,
}

pub fn sort_edges(edges: &mut [SimilarProductEdge], order: EdgeOrder) {
    edges.sort_by(|a, b| {
        let primary = match order {
            EdgeOrder::Similarity => b.similarity.total_cmp(&a.similarity),
            EdgeOrder::Savings => b.price_difference.total_cmp(&a.price_difference),
        };
        match primary {
            CmpOrdering::Equal => a.similar_product_id.cmp(&b.similar_product_id),
            other => other,
        }
    });
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_product(&self, identity: &ProductIdentity) -> Result<Option<Product>, StoreError>;

    /// Write the full product state and append one price observation as a
    /// single atomic unit.
    async fn commit_upsert(&self, product: &Product, observation: &PricePoint) -> Result<(), StoreError>;

    async fn snapshot(&self) -> Result<Vec<Product>, StoreError>;

    async fn query_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError>;

    async fn price_history(
        &self,
        product_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PricePoint>, StoreError>;

    async fn set_pet_type(&self, product_id: Uuid, pet_type: PetType) -> Result<bool, StoreError>;

    async fn remove_product(&self, identity: &ProductIdentity) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Discard every stored edge and write `edges` in their place.
    async fn replace_all(&self, edges: &[SimilarProductEdge]) -> Result<usize, StoreError>;

    async fn edges_for(&self, product_id: Uuid, order: EdgeOrder) -> Result<Vec<SimilarProductEdge>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    products: BTreeMap<Uuid, Product>,
    identities: HashMap<ProductIdentity, Uuid>,
    price_points: Vec<PricePoint>,
    edges: Vec<SimilarProductEdge>,
}

/// In-process store used by tests and dry runs.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    edges_available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            edges_available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate the edge table going away while products stay readable.
    pub fn set_edges_available(&self, available: bool) {
        self.edges_available.store(available, Ordering::SeqCst);
    }

    pub async fn all_edges(&self) -> Vec<SimilarProductEdge> {
        self.state.lock().await.edges.clone()
    }

    pub async fn price_point_count(&self) -> usize {
        self.state.lock().await.price_points.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_product(&self, identity: &ProductIdentity) -> Result<Option<Product>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .identities
            .get(identity)
            .and_then(|id| state.products.get(id))
            .cloned())
    }

    async fn commit_upsert(&self, product: &Product, observation: &PricePoint) -> Result<(), StoreError> {
        self.check()?;
        if observation.product_id != product.id {
            return Err(StoreError::Query(format!(
                "price point for {} does not belong to product {}",
                observation.product_id, product.id
            )));
        }
        let mut state = self.state.lock().await;
        let identity = product.identity();
        if let Some(existing) = state.identities.get(&identity) {
            if *existing != product.id {
                return Err(StoreError::Query(format!("identity {identity} already bound to {existing}")));
            }
        }
        state.identities.insert(identity, product.id);
        state.products.insert(product.id, product.clone());
        state.price_points.push(observation.clone());
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<Product>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.products.values().cloned().collect())
    }

    async fn query_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .await
            .products
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn price_history(
        &self,
        product_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PricePoint>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut points = state
            .price_points
            .iter()
            .filter(|p| p.product_id == product_id)
            .filter(|p| from.map_or(true, |f| p.recorded_at >= f))
            .filter(|p| to.map_or(true, |t| p.recorded_at <= t))
            .cloned()
            .collect::<Vec<_>>();
        points.sort_by_key(|p| p.recorded_at);
        Ok(points)
    }

    async fn set_pet_type(&self, product_id: Uuid, pet_type: PetType) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.products.get_mut(&product_id) {
            Some(product) => {
                product.pet_type = pet_type;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_product(&self, identity: &ProductIdentity) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(id) = state.identities.remove(identity) else {
            return Ok(false);
        };
        state.products.remove(&id);
        state.price_points.retain(|p| p.product_id != id);
        state
            .edges
            .retain(|e| e.product_id != id && e.similar_product_id != id);
        Ok(true)
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn replace_all(&self, edges: &[SimilarProductEdge]) -> Result<usize, StoreError> {
        self.check()?;
        if !self.edges_available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory edge table marked unavailable".into()));
        }
        let mut state = self.state.lock().await;
        state.edges = edges.to_vec();
        Ok(state.edges.len())
    }

    async fn edges_for(&self, product_id: Uuid, order: EdgeOrder) -> Result<Vec<SimilarProductEdge>, StoreError> {
        self.check()?;
        let mut edges = self
            .state
            .lock()
            .await
            .edges
            .iter()
            .filter(|e| e.product_id == product_id)
            .cloned()
            .collect::<Vec<_>>();
        sort_edges(&mut edges, order);
        Ok(edges)
    }
}
