use std::collections::{BTreeMap, HashSet};

use forestal_adapters::{prepare_record, AdminPayload};
use forestal_core::{CollectionSpec, DocKey, ADMIN_COLLECTIONS};
use forestal_storage::{DocumentStore, StoreError, UpsertOutcome};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

/// Per-batch counters. Dates are diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    #[serde(rename = "procesadas")]
    pub processed: u64,
    #[serde(rename = "nuevas")]
    pub inserted: u64,
    #[serde(rename = "actualizadas")]
    pub updated: u64,
    #[serde(rename = "errores")]
    pub errors: u64,
    #[serde(rename = "fechaMinima", skip_serializing_if = "Option::is_none")]
    pub earliest_fecha: Option<String>,
    #[serde(rename = "fechaMaxima", skip_serializing_if = "Option::is_none")]
    pub latest_fecha: Option<String>,
}

impl UpsertStats {
    fn observe_fecha(&mut self, fecha: &str) {
        if self.earliest_fecha.as_deref().map_or(true, |cur| fecha < cur) {
            self.earliest_fecha = Some(fecha.to_string());
        }
        if self.latest_fecha.as_deref().map_or(true, |cur| fecha > cur) {
            self.latest_fecha = Some(fecha.to_string());
        }
    }
}

/// Merge-upsert `records` into the collection one at a time.
///
/// Records that fail preparation or whose write fails are counted in
/// `errors` and skipped. Only a failure to prepare the collection itself
/// aborts the batch.
pub async fn upsert_batch(
    store: &dyn DocumentStore,
    spec: &CollectionSpec,
    records: Vec<JsonValue>,
) -> Result<UpsertStats, StoreError> {
    let mut stats = UpsertStats::default();
    if records.is_empty() {
        info!(collection = spec.name, "no records to upsert");
        return Ok(stats);
    }
    store.ensure_collection(spec).await?;

    let mut prepared = Vec::with_capacity(records.len());
    for record in records {
        match prepare_record(spec, record) {
            Ok(p) => prepared.push(p),
            Err(err) => {
                warn!(collection = spec.name, error = %err, "skipping record");
                stats.errors += 1;
            }
        }
    }

    let keys: Vec<DocKey> = prepared.iter().map(|p| p.key.clone()).collect();
    let mut known: Option<HashSet<DocKey>> = match store.existing_keys(spec.name, &keys).await {
        Ok(set) => Some(set),
        Err(err) => {
            warn!(collection = spec.name, error = %err, "could not preload existing keys");
            None
        }
    };

    for record in prepared {
        let outcome = match store.upsert_merge(spec.name, &record.key, record.fields).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(collection = spec.name, key = %record.key, error = %err, "upsert failed");
                stats.errors += 1;
                continue;
            }
        };
        let is_new = match known.as_mut() {
            Some(set) => set.insert(record.key.clone()),
            None => outcome == UpsertOutcome::Inserted,
        };
        if is_new {
            stats.inserted += 1;
        } else {
            stats.updated += 1;
        }
        stats.processed += 1;
        if let Some(fecha) = &record.fecha {
            stats.observe_fecha(fecha);
        }
    }

    info!(
        collection = spec.name,
        processed = stats.processed,
        inserted = stats.inserted,
        updated = stats.updated,
        errors = stats.errors,
        earliest = stats.earliest_fecha.as_deref().unwrap_or("n/a"),
        latest = stats.latest_fecha.as_deref().unwrap_or("n/a"),
        "batch upserted"
    );
    Ok(stats)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdminSyncReport {
    /// True when the upstream returned nothing usable and no family was touched.
    #[serde(rename = "omitido")]
    pub skipped: bool,
    #[serde(rename = "colecciones")]
    pub families: BTreeMap<String, UpsertStats>,
    #[serde(rename = "fallidas", skip_serializing_if = "BTreeMap::is_empty")]
    pub failed: BTreeMap<String, String>,
}

/// Upsert every administrative family present in the payload. A failing
/// family is recorded and the remaining families still run.
pub async fn sync_admin_families(store: &dyn DocumentStore, payload: &AdminPayload) -> AdminSyncReport {
    if payload.is_empty() {
        info!("no administrative data, skipping reference families");
        return AdminSyncReport {
            skipped: true,
            ..AdminSyncReport::default()
        };
    }

    let mut report = AdminSyncReport::default();
    for spec in &ADMIN_COLLECTIONS {
        let records = payload.records(spec.name).to_vec();
        if records.is_empty() {
            continue;
        }
        match upsert_batch(store, spec, records).await {
            Ok(stats) => {
                report.families.insert(spec.name.to_string(), stats);
            }
            Err(err) => {
                warn!(family = spec.name, error = %err, "administrative family failed");
                report.failed.insert(spec.name.to_string(), err.to_string());
            }
        }
    }
    report
}
