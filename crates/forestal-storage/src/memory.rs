use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use forestal_core::{CollectionSpec, DocKey, Document};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};

use crate::{with_key, DocumentStore, Filter, FindQuery, StoreError, UpsertOutcome};

#[derive(Debug)]
struct HeldLock {
    owner: String,
    expires_at: Instant,
}

/// Process-local store used by tests and `FORESTAL_STORE=memory` runs.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, (DocKey, Document)>>>,
    locks: Mutex<HashMap<String, HeldLock>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<(), StoreError> {
        self.collections
            .write()
            .await
            .entry(spec.name.to_string())
            .or_default();
        Ok(())
    }

    async fn get(&self, collection: &str, key: &DocKey) -> Result<Option<Document>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .and_then(|c| c.get(&key.storage_key()))
            .map(|(_, doc)| doc.clone()))
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>, StoreError> {
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let mut rows = docs
            .values()
            .map(|(_, doc)| doc)
            .filter(|doc| query.filter.matches(doc))
            .cloned()
            .collect::<Vec<_>>();
        if let Some(sort) = &query.sort {
            rows.sort_by(|a, b| sort.compare(a, b));
        }
        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(skip).take(limit).collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|docs| docs.values().filter(|(_, d)| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    async fn count_by(&self, collection: &str, field: &str) -> Result<Vec<(JsonValue, u64)>, StoreError> {
        let guard = self.collections.read().await;
        let mut groups: Vec<(JsonValue, u64)> = Vec::new();
        for (_, doc) in guard.get(collection).into_iter().flat_map(|docs| docs.values()) {
            let value = doc.get(field).cloned().unwrap_or(JsonValue::Null);
            match groups.iter_mut().find(|(v, _)| *v == value) {
                Some((_, n)) => *n += 1,
                None => groups.push((value, 1)),
            }
        }
        Ok(groups)
    }

    async fn existing_keys(
        &self,
        collection: &str,
        keys: &[DocKey],
    ) -> Result<HashSet<DocKey>, StoreError> {
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(HashSet::new());
        };
        Ok(keys
            .iter()
            .filter(|k| docs.contains_key(&k.storage_key()))
            .cloned()
            .collect())
    }

    async fn upsert_merge(
        &self,
        collection: &str,
        key: &DocKey,
        fields: Document,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        match docs.get_mut(&key.storage_key()) {
            Some((_, existing)) => {
                existing.extend(fields);
                existing.insert(forestal_core::ID_FIELD.to_string(), key.to_json());
                Ok(UpsertOutcome::Updated)
            }
            None => {
                docs.insert(key.storage_key(), (key.clone(), with_key(fields, key)));
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn insert(&self, collection: &str, key: &DocKey, doc: Document) -> Result<(), StoreError> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.contains_key(&key.storage_key()) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        docs.insert(key.storage_key(), (key.clone(), with_key(doc, key)));
        Ok(())
    }

    async fn update_merge(
        &self,
        collection: &str,
        key: &DocKey,
        fields: Document,
    ) -> Result<bool, StoreError> {
        let mut guard = self.collections.write().await;
        let Some((_, existing)) = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(&key.storage_key()))
        else {
            return Ok(false);
        };
        existing.extend(fields);
        existing.insert(forestal_core::ID_FIELD.to_string(), key.to_json());
        Ok(true)
    }

    async fn delete(&self, collection: &str, key: &DocKey) -> Result<bool, StoreError> {
        let mut guard = self.collections.write().await;
        Ok(guard
            .get_mut(collection)
            .and_then(|docs| docs.remove(&key.storage_key()))
            .is_some())
    }

    async fn max_int_key(&self, collection: &str) -> Result<Option<i64>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .and_then(|docs| docs.values().filter_map(|(k, _)| k.as_int()).max()))
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        if let Some(held) = locks.get(name) {
            if held.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            name.to_string(),
            HeldLock {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().await;
        if locks.get(name).is_some_and(|held| held.owner == owner) {
            locks.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sort;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[tokio::test]
    async fn merge_upsert_keeps_fields_absent_from_input() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::Int(10);
        let first = store
            .upsert_merge("ordenes", &key, doc(json!({"fecha": "2024-01-01", "estado": 2})))
            .await
            .expect("first");
        let second = store
            .upsert_merge("ordenes", &key, doc(json!({"fecha": "2024-01-05"})))
            .await
            .expect("second");

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);
        let stored = store.get("ordenes", &key).await.expect("get").expect("present");
        assert_eq!(stored["fecha"], json!("2024-01-05"));
        assert_eq!(stored["estado"], json!(2));
        assert_eq!(stored["_id"], json!(10));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_keys() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::Text("a".into());
        store.insert("c", &key, Document::new()).await.expect("insert");
        let err = store.insert("c", &key, Document::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn find_applies_filter_sort_and_paging() {
        let store = MemoryDocumentStore::new();
        for (id, fecha, zona) in [(1, "2024-01-01", 1), (2, "2024-01-03", 1), (3, "2024-01-02", 2)] {
            store
                .upsert_merge("o", &DocKey::Int(id), doc(json!({"fecha": fecha, "cod_zona": zona})))
                .await
                .expect("seed");
        }
        let query = FindQuery::filtered(Filter::new().eq("cod_zona", 1))
            .sorted(Sort::desc("fecha"))
            .page(0, 1);
        let rows = store.find("o", &query).await.expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_id"], json!(2));
        assert_eq!(store.count("o", &Filter::new()).await.expect("count"), 3);
        assert_eq!(store.max_int_key("o").await.expect("max"), Some(3));

        let mut zones = store.count_by("o", "cod_zona").await.expect("count_by");
        zones.sort_by_key(|(_, n)| std::cmp::Reverse(*n));
        assert_eq!(zones, vec![(json!(1), 2), (json!(2), 1)]);

        let known = store
            .existing_keys("o", &[DocKey::Int(1), DocKey::Int(9)])
            .await
            .expect("keys");
        assert!(known.contains(&DocKey::Int(1)));
        assert!(!known.contains(&DocKey::Int(9)));
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_documents() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::Int(5);
        assert!(!store.update_merge("o", &key, Document::new()).await.expect("update"));
        assert!(!store.delete("o", &key).await.expect("delete"));
        store.insert("o", &key, doc(json!({"a": 1}))).await.expect("insert");
        assert!(store.update_merge("o", &key, doc(json!({"b": 2}))).await.expect("update"));
        let stored = store.get("o", &key).await.expect("get").expect("present");
        assert_eq!(stored["a"], json!(1));
        assert_eq!(stored["b"], json!(2));
        assert!(store.delete("o", &key).await.expect("delete"));
    }

    #[tokio::test]
    async fn locks_are_exclusive_until_released_or_expired() {
        let store = MemoryDocumentStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lock("etl", "run-a", ttl).await.expect("a"));
        assert!(!store.try_acquire_lock("etl", "run-b", ttl).await.expect("b"));
        store.release_lock("etl", "run-b").await.expect("foreign release");
        assert!(!store.try_acquire_lock("etl", "run-b", ttl).await.expect("b again"));
        store.release_lock("etl", "run-a").await.expect("release");
        assert!(store.try_acquire_lock("etl", "run-b", ttl).await.expect("b after release"));

        assert!(store
            .try_acquire_lock("short", "x", Duration::from_millis(0))
            .await
            .expect("short"));
        assert!(store.try_acquire_lock("short", "y", ttl).await.expect("expired"));
    }
}
