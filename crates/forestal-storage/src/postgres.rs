use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use forestal_core::{CollectionSpec, DocKey, Document};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::{
    with_key, Condition, DocumentStore, Filter, FindQuery, SortDirection, StoreError,
    UpsertOutcome,
};

/// JSONB-backed store: one `documents` table partitioned by `collection`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        tracing::info!("connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn decode_doc(collection: &str, row: &PgRow) -> Result<Document, StoreError> {
        let Json(value): Json<JsonValue> = row.try_get("doc")?;
        match value {
            JsonValue::Object(doc) => Ok(doc),
            _ => Err(StoreError::Corrupt {
                collection: collection.to_string(),
                key: row.try_get::<String, _>("doc_key").unwrap_or_default(),
            }),
        }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, collection: &str, filter: &Filter) {
    builder.push(" WHERE collection = ");
    builder.push_bind(collection.to_string());
    for condition in &filter.conditions {
        match condition {
            Condition::Eq { field, value } => {
                builder.push(" AND doc -> ");
                builder.push_bind(field.clone());
                builder.push(" = ");
                builder.push_bind(Json(value.clone()));
            }
            Condition::Range { field, gte, lte } => {
                builder.push(" AND jsonb_typeof(doc -> ");
                builder.push_bind(field.clone());
                builder.push(") = 'string'");
                if let Some(lo) = gte {
                    builder.push(" AND doc ->> ");
                    builder.push_bind(field.clone());
                    builder.push(" >= ");
                    builder.push_bind(lo.clone());
                }
                if let Some(hi) = lte {
                    builder.push(" AND doc ->> ");
                    builder.push_bind(field.clone());
                    builder.push(" <= ");
                    builder.push_bind(hi.clone());
                }
            }
            Condition::Exists { field } => {
                builder.push(" AND COALESCE(jsonb_typeof(doc -> ");
                builder.push_bind(field.clone());
                builder.push("), 'null') <> 'null'");
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<(), StoreError> {
        // Collections are rows of the shared table; indexes come from migrations.
        tracing::debug!(collection = spec.name, "collection ready");
        Ok(())
    }

    async fn get(&self, collection: &str, key: &DocKey) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc_key, doc
              FROM documents
             WHERE collection = $1
               AND doc_key = $2
            "#,
        )
        .bind(collection)
        .bind(key.storage_key())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::decode_doc(collection, &r)).transpose()
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT doc_key, doc FROM documents");
        push_filter(&mut builder, collection, &query.filter);
        match &query.sort {
            Some(sort) => {
                builder.push(" ORDER BY doc -> ");
                builder.push_bind(sort.field.clone());
                builder.push(match sort.direction {
                    SortDirection::Asc => " ASC NULLS LAST",
                    SortDirection::Desc => " DESC NULLS LAST",
                });
                builder.push(", doc_key ASC");
            }
            None => {
                builder.push(" ORDER BY doc_key ASC");
            }
        }
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if query.skip > 0 {
            builder.push(" OFFSET ");
            builder.push_bind(i64::try_from(query.skip).unwrap_or(i64::MAX));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Self::decode_doc(collection, r))
            .collect()
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM documents");
        push_filter(&mut builder, collection, filter);
        let row = builder.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn count_by(&self, collection: &str, field: &str) -> Result<Vec<(JsonValue, u64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(doc -> $2, 'null'::jsonb) AS value, COUNT(*) AS total
              FROM documents
             WHERE collection = $1
             GROUP BY 1
            "#,
        )
        .bind(collection)
        .bind(field)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(JsonValue, u64), StoreError> {
                let Json(value): Json<JsonValue> = row.try_get("value")?;
                let total: i64 = row.try_get("total")?;
                Ok((value, u64::try_from(total).unwrap_or(0)))
            })
            .collect()
    }

    async fn existing_keys(
        &self,
        collection: &str,
        keys: &[DocKey],
    ) -> Result<HashSet<DocKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let by_storage_key: HashMap<String, &DocKey> =
            keys.iter().map(|k| (k.storage_key(), k)).collect();
        let lookup: Vec<String> = by_storage_key.keys().cloned().collect();
        let rows = sqlx::query(
            r#"
            SELECT doc_key
              FROM documents
             WHERE collection = $1
               AND doc_key = ANY($2)
            "#,
        )
        .bind(collection)
        .bind(&lookup)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let stored: String = row.try_get("doc_key")?;
            if let Some(key) = by_storage_key.get(&stored) {
                out.insert((*key).clone());
            }
        }
        Ok(out)
    }

    async fn upsert_merge(
        &self,
        collection: &str,
        key: &DocKey,
        fields: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        let doc = with_key(fields, key);
        let row = sqlx::query(
            r#"
            INSERT INTO documents (collection, doc_key, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, doc_key) DO UPDATE
               SET doc = documents.doc || EXCLUDED.doc,
                   updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(collection)
        .bind(key.storage_key())
        .bind(Json(JsonValue::Object(doc)))
        .fetch_one(&self.pool)
        .await?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn insert(&self, collection: &str, key: &DocKey, doc: Document) -> Result<(), StoreError> {
        let doc = with_key(doc, key);
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, doc_key, doc)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(collection)
        .bind(key.storage_key())
        .bind(Json(JsonValue::Object(doc)))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_merge(
        &self,
        collection: &str,
        key: &DocKey,
        fields: Document,
    ) -> Result<bool, StoreError> {
        let fields = with_key(fields, key);
        let result = sqlx::query(
            r#"
            UPDATE documents
               SET doc = doc || $3,
                   updated_at = NOW()
             WHERE collection = $1
               AND doc_key = $2
            "#,
        )
        .bind(collection)
        .bind(key.storage_key())
        .bind(Json(JsonValue::Object(fields)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, collection: &str, key: &DocKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND doc_key = $2")
            .bind(collection)
            .bind(key.storage_key())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn max_int_key(&self, collection: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX((doc ->> '_id')::BIGINT) AS max_key
              FROM documents
             WHERE collection = $1
               AND jsonb_typeof(doc -> '_id') = 'number'
            "#,
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("max_key")?)
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO run_locks (name, owner, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
               SET owner = EXCLUDED.owner,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE run_locks.expires_at < NOW()
            RETURNING name
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM run_locks WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
