//! Postgres-backed catalog and relationship store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use petcat_core::{PetType, PricePoint, Product, ProductIdentity, SimilarProductEdge, StorePrice, Variant};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogStore, EdgeOrder, ProductFilter, RelationshipStore, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

const PRODUCT_COLUMNS: &str = "id, source, source_id, name, brand, category, pet_type, image_url, variants, created_at, updated_at";

/// One pool per run; call [`PgStore::close`] when the run ends.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("running migrations: {e}")))?;
        info!("catalog migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_prices(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<StorePrice>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, store, price, currency, url, last_updated, in_stock
              FROM product_prices
             WHERE product_id = ANY($1)
             ORDER BY product_id, store
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<Uuid, Vec<StorePrice>> = HashMap::new();
        for row in rows {
            let product_id: Uuid = row.try_get("product_id")?;
            out.entry(product_id).or_default().push(StorePrice {
                store: row.try_get("store")?,
                price: row.try_get("price")?,
                currency: row.try_get("currency")?,
                url: row.try_get("url")?,
                last_updated: row.try_get("last_updated")?,
                in_stock: row.try_get("in_stock")?,
            });
        }
        Ok(out)
    }

    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<Product>, StoreError> {
        let mut products = rows
            .iter()
            .map(product_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let ids = products.iter().map(|p| p.id).collect::<Vec<_>>();
        let mut prices = self.load_prices(&ids).await?;
        for product in &mut products {
            product.prices = prices.remove(&product.id).unwrap_or_default();
        }
        Ok(products)
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let pet_type: String = row.try_get("pet_type")?;
    let pet_type = pet_type.parse::<PetType>().unwrap_or_else(|err| {
        warn!(error = %err, "unrecognized pet_type in catalog; treating as other");
        PetType::Other
    });
    let Json(variants): Json<Vec<Variant>> = row.try_get("variants")?;
    Ok(Product {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        name: row.try_get("name")?,
        brand: row.try_get("brand")?,
        category: row.try_get("category")?,
        pet_type,
        image_url: row.try_get("image_url")?,
        prices: Vec::new(),
        variants,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_product(&self, identity: &ProductIdentity) -> Result<Option<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE source = $1 AND source_id = $2"
        ))
        .bind(&identity.source)
        .bind(&identity.source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.hydrate(rows).await?.into_iter().next())
    }

    async fn commit_upsert(&self, product: &Product, observation: &PricePoint) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO products
                (id, source, source_id, name, brand, category, pet_type, image_url, variants, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source, source_id) DO UPDATE SET
                name = EXCLUDED.name,
                brand = EXCLUDED.brand,
                category = EXCLUDED.category,
                pet_type = EXCLUDED.pet_type,
                image_url = EXCLUDED.image_url,
                variants = EXCLUDED.variants,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(product.id)
        .bind(&product.source)
        .bind(&product.source_id)
        .bind(&product.name)
        .bind(&product.brand)
        .bind(&product.category)
        .bind(product.pet_type.as_str())
        .bind(&product.image_url)
        .bind(Json(&product.variants))
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM product_prices WHERE product_id = $1")
            .bind(product.id)
            .execute(&mut *tx)
            .await?;

        for price in &product.prices {
            sqlx::query(
                r#"
                INSERT INTO product_prices (product_id, store, price, currency, url, last_updated, in_stock)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(product.id)
            .bind(&price.store)
            .bind(price.price)
            .bind(&price.currency)
            .bind(&price.url)
            .bind(price.last_updated)
            .bind(price.in_stock)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO price_points (product_id, store, amount, currency, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(observation.product_id)
        .bind(&observation.store)
        .bind(observation.amount)
        .bind(&observation.currency)
        .bind(observation.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY source, source_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn query_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PRODUCT_COLUMNS}
              FROM products
             WHERE ($1::text IS NULL OR pet_type = $1)
               AND ($2::text IS NULL OR lower(category) = lower($2))
               AND ($3::text IS NULL OR lower(brand) = lower($3))
             ORDER BY source, source_id
            "#
        ))
        .bind(filter.pet_type.map(|p| p.as_str()))
        .bind(&filter.category)
        .bind(&filter.brand)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn price_history(
        &self,
        product_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PricePoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, store, amount, currency, recorded_at
              FROM price_points
             WHERE product_id = $1
               AND ($2::timestamptz IS NULL OR recorded_at >= $2)
               AND ($3::timestamptz IS NULL OR recorded_at <= $3)
             ORDER BY recorded_at, id
            "#,
        )
        .bind(product_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PricePoint, StoreError> {
                Ok(PricePoint {
                    product_id: row.try_get("product_id")?,
                    store: row.try_get("store")?,
                    amount: row.try_get("amount")?,
                    currency: row.try_get("currency")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn set_pet_type(&self, product_id: Uuid, pet_type: PetType) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE products SET pet_type = $2 WHERE id = $1")
            .bind(product_id)
            .bind(pet_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_product(&self, identity: &ProductIdentity) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE source = $1 AND source_id = $2")
            .bind(&identity.source)
            .bind(&identity.source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RelationshipStore for PgStore {
    async fn replace_all(&self, edges: &[SimilarProductEdge]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM similar_products")
            .execute(&mut *tx)
            .await?;
        for edge in edges {
            sqlx::query(
                r#"
                INSERT INTO similar_products
                    (product_id, similar_product_id, similarity, price_difference, price_ratio, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(edge.product_id)
            .bind(edge.similar_product_id)
            .bind(edge.similarity)
            .bind(edge.price_difference)
            .bind(edge.price_ratio)
            .bind(edge.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(edges.len())
    }

    async fn edges_for(&self, product_id: Uuid, order: EdgeOrder) -> Result<Vec<SimilarProductEdge>, StoreError> {
        let order_by = match order {
            EdgeOrder::Similarity => "similarity DESC, similar_product_id",
            EdgeOrder::Savings => "price_difference DESC, similar_product_id",
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT product_id, similar_product_id, similarity, price_difference, price_ratio, updated_at
              FROM similar_products
             WHERE product_id = $1
             ORDER BY {order_by}
            "#
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SimilarProductEdge, StoreError> {
                Ok(SimilarProductEdge {
                    product_id: row.try_get("product_id")?,
                    similar_product_id: row.try_get("similar_product_id")?,
                    similarity: row.try_get("similarity")?,
                    price_difference: row.try_get("price_difference")?,
                    price_ratio: row.try_get("price_ratio")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}
