//! Outbound fetch, raw payload archive and catalog persistence for petcat.

pub mod artifacts;
pub mod catalog;
pub mod fetch;
pub mod pg;

pub use artifacts::{ArchivedPayload, PayloadArchive};
pub use catalog::{
    sort_edges, CatalogStore, EdgeOrder, MemoryStore, ProductFilter, RelationshipStore, StoreError,
};
pub use fetch::{
    EgressRoute, FetchError, FetchedResponse, Fetcher, FetcherConfig, RequestThrottle, RetryPolicy,
    Retryable,
};
pub use pg::PgStore;

pub const CRATE_NAME: &str = "petcat-storage";
