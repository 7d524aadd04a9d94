//! Document storage + HTTP fetch utilities for the forestry backend.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use forestal_core::{CollectionSpec, DocKey, Document};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod http;
mod memory;
mod postgres;
mod query;

pub use http::{
    classify_reqwest_error, classify_status, truncate_chars, BackoffPolicy, FetchError,
    FetchedJson, HttpClientConfig, HttpFetcher, JsonRequest, RetryDisposition,
};
pub use memory::MemoryDocumentStore;
pub use postgres::PgDocumentStore;
pub use query::{Condition, Filter, FindQuery, Sort, SortDirection};

pub const CRATE_NAME: &str = "forestal-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("duplicate key {key} in {collection}")]
    DuplicateKey { collection: String, key: String },
    #[error("stored document {key} in {collection} is not a JSON object")]
    Corrupt { collection: String, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Collection-oriented document store. Every stored document carries its key
/// under `_id`; writes are atomic per document only.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &DocKey) -> Result<Option<Document>, StoreError>;

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Document count per distinct value of `field`; documents lacking it group under `null`.
    async fn count_by(&self, collection: &str, field: &str) -> Result<Vec<(JsonValue, u64)>, StoreError>;

    /// Subset of `keys` already present in the collection.
    async fn existing_keys(
        &self,
        collection: &str,
        keys: &[DocKey],
    ) -> Result<HashSet<DocKey>, StoreError>;

    /// Set the given fields, creating the document if absent. Fields missing
    /// from `fields` are left untouched on an existing document.
    async fn upsert_merge(
        &self,
        collection: &str,
        key: &DocKey,
        fields: Document,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Create a new document; fails with [`StoreError::DuplicateKey`] if the key exists.
    async fn insert(&self, collection: &str, key: &DocKey, doc: Document) -> Result<(), StoreError>;

    /// Merge fields into an existing document. Returns `false` when no document matched.
    async fn update_merge(
        &self,
        collection: &str,
        key: &DocKey,
        fields: Document,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, collection: &str, key: &DocKey) -> Result<bool, StoreError>;

    /// Largest integer `_id` in the collection.
    async fn max_int_key(&self, collection: &str) -> Result<Option<i64>, StoreError>;

    /// Take the named lock unless another owner holds an unexpired copy.
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), StoreError>;
}

/// Stamp the document with its key so `_id` always mirrors the storage key.
pub(crate) fn with_key(mut doc: Document, key: &DocKey) -> Document {
    doc.insert(forestal_core::ID_FIELD.to_string(), key.to_json());
    doc
}
