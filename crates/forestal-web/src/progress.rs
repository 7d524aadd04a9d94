//! Progress records ("avances") and the work-order status they drive.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use forestal_core::{
    derive_status, DocKey, Document, KeyKind, ProgressRecord, WorkOrder, WorkOrderStatus, ID_FIELD,
    PROGRESS_RECORDS, WORK_ORDERS,
};
use forestal_storage::{DocumentStore, Filter, FindQuery, Sort, StoreError};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::{message, object_body, ApiError, AppState};

const WORK_ORDER_FIELD: &str = "ordenTrabajoId";

/// Recompute the status of one work order from the worked area of its
/// progress records and store it. Returns `None` when the work order does
/// not exist.
pub async fn refresh_work_order_status(
    store: &dyn DocumentStore,
    work_order_id: i64,
) -> Result<Option<WorkOrderStatus>, StoreError> {
    let key = DocKey::Int(work_order_id);
    let Some(doc) = store.get(WORK_ORDERS.name, &key).await? else {
        warn!(work_order_id, "work order not found, status not updated");
        return Ok(None);
    };
    let order = WorkOrder::from_document(doc)?;

    let records = store
        .find(
            PROGRESS_RECORDS.name,
            &FindQuery::filtered(Filter::new().eq(WORK_ORDER_FIELD, work_order_id)),
        )
        .await?;
    let worked: f64 = records
        .iter()
        .filter_map(|r| r.get("superficie").and_then(JsonValue::as_f64))
        .sum();
    let status = derive_status(worked, order.superficie);

    let mut fields = Document::new();
    fields.insert("estado".into(), JsonValue::from(status.code()));
    store.update_merge(WORK_ORDERS.name, &key, fields).await?;
    info!(
        work_order_id,
        worked,
        target = ?order.superficie,
        estado = status.code(),
        "work order status refreshed"
    );
    Ok(Some(status))
}

/// The progress write already succeeded; a failed refresh is only logged.
async fn refresh_after_write(store: &dyn DocumentStore, work_order_id: i64) {
    if let Err(err) = refresh_work_order_status(store, work_order_id).await {
        warn!(work_order_id, error = %err, "could not refresh work order status");
    }
}

fn work_order_of(doc: &Document) -> Option<i64> {
    doc.get(WORK_ORDER_FIELD)
        .and_then(|v| KeyKind::Integer.key_from_json(v).ok())
        .and_then(|k| k.as_int())
}

fn parse_record(doc: Document) -> Result<ProgressRecord, ApiError> {
    let record = ProgressRecord::from_document(doc)
        .map_err(|err| ApiError::Validation(format!("avance inválido: {err}")))?;
    record.validate()?;
    Ok(record)
}

fn to_document(record: &ProgressRecord) -> Result<Document, ApiError> {
    match serde_json::to_value(record) {
        Ok(JsonValue::Object(doc)) => Ok(doc),
        Ok(_) => Err(ApiError::Internal(anyhow::anyhow!("progress record is not an object"))),
        Err(err) => Err(StoreError::Serialization(err).into()),
    }
}

fn not_found() -> ApiError {
    ApiError::NotFound("Avance no encontrado".into())
}

fn record_key(id: &str) -> Result<DocKey, ApiError> {
    Ok(PROGRESS_RECORDS.key_kind.parse_key(id)?)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListParams {
    #[serde(rename = "ordenTrabajoId")]
    orden_trabajo_id: Option<String>,
}

pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let mut filter = Filter::new();
    if let Some(raw) = params.orden_trabajo_id.as_deref().filter(|s| !s.trim().is_empty()) {
        let key = KeyKind::Integer.parse_key(raw)?;
        if let Some(id) = key.as_int() {
            filter = filter.eq(WORK_ORDER_FIELD, id);
        }
    }
    let query = FindQuery::filtered(filter).sorted(Sort::desc("fechaRegistro"));
    Ok(Json(state.store.find(PROGRESS_RECORDS.name, &query).await?))
}

pub(crate) async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    let key = record_key(&id)?;
    state
        .store
        .get(PROGRESS_RECORDS.name, &key)
        .await?
        .map(Json)
        .ok_or_else(not_found)
}

pub(crate) async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<JsonValue>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let mut record = parse_record(object_body(body)?)?;
    let key = DocKey::new_text();
    let now = Utc::now();
    record.id = Some(key.to_string());
    record.fecha_registro = Some(now);
    record.ultima_actualizacion = Some(now);

    let store = state.store.as_ref();
    store.ensure_collection(&PROGRESS_RECORDS).await?;
    store.insert(PROGRESS_RECORDS.name, &key, to_document(&record)?).await?;
    refresh_after_write(store, record.orden_trabajo_id).await;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "mensaje": "Avance registrado",
            "id": key.to_json(),
            "avance": record,
        })),
    ))
}

pub(crate) async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let key = record_key(&id)?;
    let store = state.store.as_ref();
    let mut merged = store
        .get(PROGRESS_RECORDS.name, &key)
        .await?
        .ok_or_else(not_found)?;
    let previous_order = work_order_of(&merged);
    let stored_fields: Vec<String> = merged.keys().cloned().collect();

    for (field, value) in object_body(body)? {
        if field == ID_FIELD || field == "fechaRegistro" {
            continue;
        }
        merged.insert(field, value);
    }
    let mut record = parse_record(merged)?;
    record.id = Some(key.to_string());
    record.ultima_actualizacion = Some(Utc::now());

    // The merge keeps absent keys, so cleared fields are written as null.
    let mut fields = to_document(&record)?;
    for field in stored_fields {
        fields.entry(field).or_insert(JsonValue::Null);
    }
    if !store.update_merge(PROGRESS_RECORDS.name, &key, fields).await?
    {
        return Err(not_found());
    }

    refresh_after_write(store, record.orden_trabajo_id).await;
    if let Some(old) = previous_order.filter(|old| *old != record.orden_trabajo_id) {
        refresh_after_write(store, old).await;
    }

    Ok(Json(json!({ "mensaje": "Avance actualizado", "avance": record })))
}

pub(crate) async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let key = record_key(&id)?;
    let store = state.store.as_ref();
    let existing = store
        .get(PROGRESS_RECORDS.name, &key)
        .await?
        .ok_or_else(not_found)?;
    if !store.delete(PROGRESS_RECORDS.name, &key).await? {
        return Err(not_found());
    }
    if let Some(order) = work_order_of(&existing) {
        refresh_after_write(store, order).await;
    }
    Ok(message("Avance eliminado"))
}
