//! Upstream GIS source contract, response normalization and boundary preparation
//! of loosely shaped upstream records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use forestal_core::{CollectionSpec, DocKey, Document, KeyError, ADMIN_COLLECTIONS, ID_FIELD};
use forestal_storage::{truncate_chars, FetchError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

mod gis;

pub use gis::{GisClient, GisConfig};

pub const CRATE_NAME: &str = "forestal-adapters";

/// Envelope fields tried, in order, when a response is not a bare array.
pub const ENVELOPE_FIELDS: [&str; 3] = ["data", "ordenes", "results"];

/// Field carrying the record date used for watermarks and run statistics.
pub const DATE_FIELD: &str = "fecha";

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Raw work-order payload for records changed since `since` (`YYYY-MM-DD`).
    async fn fetch_work_orders(&self, since: &str) -> Result<JsonValue, FetchError>;

    /// Raw administrative payload keyed by category name.
    async fn fetch_admin_data(&self) -> Result<JsonValue, FetchError>;
}

/// Flatten an upstream response into a list of records.
///
/// Never fails: an unrecognised shape yields an empty list.
pub fn normalize_records(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => {
            for field in ENVELOPE_FIELDS {
                if matches!(map.get(field), Some(JsonValue::Array(_))) {
                    if let Some(JsonValue::Array(items)) = map.remove(field) {
                        return items;
                    }
                }
            }
            warn!(
                keys = ?map.keys().take(10).collect::<Vec<_>>(),
                "response object carries no record array"
            );
            Vec::new()
        }
        other => {
            warn!(
                shape = %truncate_chars(&other.to_string(), 200),
                "response is not a record list"
            );
            Vec::new()
        }
    }
}

/// Administrative payload split into the known reference-data families.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminPayload {
    families: BTreeMap<&'static str, Vec<JsonValue>>,
}

impl AdminPayload {
    /// Categories not in the catalogue are ignored; non-array category values count as empty.
    pub fn from_json(value: JsonValue) -> Self {
        let JsonValue::Object(mut map) = value else {
            return Self::default();
        };
        let mut families = BTreeMap::new();
        for spec in ADMIN_COLLECTIONS {
            match map.remove(spec.name) {
                Some(JsonValue::Array(items)) => {
                    families.insert(spec.name, items);
                }
                Some(other) => {
                    warn!(family = spec.name, kind = json_kind(&other), "admin category is not an array");
                }
                None => {}
            }
        }
        Self { families }
    }

    pub fn records(&self, family: &str) -> &[JsonValue] {
        self.families.get(family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.families.values().all(Vec::is_empty)
    }

    pub fn total_records(&self) -> usize {
        self.families.values().map(Vec::len).sum()
    }
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

#[derive(Debug, Error, PartialEq)]
pub enum PrepareError {
    #[error("record is a {kind}, expected an object: {snippet}")]
    NotAnObject { kind: &'static str, snippet: String },
    #[error("record has no `{field}` identifier: {snippet}")]
    MissingKey { field: &'static str, snippet: String },
    #[error("record `{field}` identifier is invalid: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: KeyError,
    },
}

/// Upstream record validated at the boundary: typed key plus the fields to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub key: DocKey,
    pub fields: Document,
    pub fecha: Option<String>,
}

/// Extract the collection key from `record` and strip it from the stored fields.
///
/// Remapped families fall back to `_id` when the natural key is absent.
pub fn prepare_record(spec: &CollectionSpec, record: JsonValue) -> Result<PreparedRecord, PrepareError> {
    let JsonValue::Object(mut fields) = record else {
        return Err(PrepareError::NotAnObject {
            kind: json_kind(&record),
            snippet: truncate_chars(&record.to_string(), 200),
        });
    };

    let natural = fields.remove(spec.natural_key);
    let (field, raw) = match natural {
        Some(value) if !value.is_null() => (spec.natural_key, value),
        _ if spec.remaps_key() => (ID_FIELD, fields.remove(ID_FIELD).unwrap_or(JsonValue::Null)),
        _ => (spec.natural_key, JsonValue::Null),
    };

    let key = match spec.key_kind.key_from_json(&raw) {
        Ok(key) => key,
        Err(KeyError::Missing) => {
            return Err(PrepareError::MissingKey {
                field: spec.natural_key,
                snippet: truncate_chars(&JsonValue::Object(fields).to_string(), 200),
            })
        }
        Err(source) => return Err(PrepareError::InvalidKey { field, source }),
    };
    fields.remove(ID_FIELD);

    let fecha = fields
        .get(DATE_FIELD)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);

    Ok(PreparedRecord { key, fields, fecha })
}
