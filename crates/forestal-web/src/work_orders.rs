use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use forestal_core::{
    admin_collection, DocKey, Document, KeyKind, WorkOrderStatus, ID_FIELD, WORK_ORDERS,
};
use forestal_storage::{Filter, FindQuery, Sort};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::{message, object_body, ApiError, AppState};

const DEFAULT_PAGE_SIZE: u64 = 20;
const ZONES: &str = "zonas";

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListParams {
    estado: Option<String>,
    cod_zona: Option<String>,
    cod_campo: Option<String>,
    cod_empres: Option<String>,
    supervisor_id: Option<String>,
    #[serde(rename = "fechaDesde")]
    fecha_desde: Option<String>,
    #[serde(rename = "fechaHasta")]
    fecha_hasta: Option<String>,
    pagina: Option<String>,
    limite: Option<String>,
}

fn int_param(name: &str, raw: Option<&str>) -> Result<Option<i64>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ApiError::Validation(format!("{name} debe ser un número entero"))),
    }
}

fn positive_param(name: &str, raw: Option<&str>, default: u64) -> Result<u64, ApiError> {
    match int_param(name, raw)? {
        None => Ok(default),
        Some(v) if v >= 1 => Ok(v as u64),
        Some(_) => Err(ApiError::Validation(format!("{name} debe ser mayor que cero"))),
    }
}

impl ListParams {
    fn filter(&self) -> Result<Filter, ApiError> {
        let mut filter = Filter::new();
        for (field, raw) in [
            ("estado", &self.estado),
            ("cod_zona", &self.cod_zona),
            ("cod_campo", &self.cod_campo),
            ("cod_empres", &self.cod_empres),
            ("supervisor_id", &self.supervisor_id),
        ] {
            if let Some(value) = int_param(field, raw.as_deref())? {
                filter = filter.eq(field, value);
            }
        }
        Ok(filter.range("fecha", self.fecha_desde.clone(), self.fecha_hasta.clone()))
    }
}

fn work_order_key(id: &str) -> Result<DocKey, ApiError> {
    Ok(WORK_ORDERS.key_kind.parse_key(id)?)
}

fn not_found() -> ApiError {
    ApiError::NotFound("Orden de trabajo no encontrada".into())
}

pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let filter = params.filter()?;
    let pagina = positive_param("pagina", params.pagina.as_deref(), 1)?;
    let limite = positive_param("limite", params.limite.as_deref(), DEFAULT_PAGE_SIZE)?;

    let total = state.store.count(WORK_ORDERS.name, &filter).await?;
    let query = FindQuery::filtered(filter)
        .sorted(Sort::desc("fecha"))
        .page((pagina - 1) * limite, limite);
    let ordenes = state.store.find(WORK_ORDERS.name, &query).await?;

    Ok(Json(json!({
        "ordenes": ordenes,
        "paginacion": {
            "total": total,
            "pagina": pagina,
            "limite": limite,
            "paginas": total.div_ceil(limite),
        }
    })))
}

pub(crate) async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    let key = work_order_key(&id)?;
    state
        .store
        .get(WORK_ORDERS.name, &key)
        .await?
        .map(Json)
        .ok_or_else(not_found)
}

pub(crate) async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<JsonValue>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let mut fields = object_body(body)?;
    let key = match fields.remove(ID_FIELD) {
        Some(raw) if !raw.is_null() => KeyKind::Integer.key_from_json(&raw)?,
        _ => {
            let next = state.store.max_int_key(WORK_ORDERS.name).await?.unwrap_or(0) + 1;
            DocKey::Int(next)
        }
    };
    state.store.insert(WORK_ORDERS.name, &key, fields).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "mensaje": "Orden de trabajo creada", "id": key.to_json() })),
    ))
}

pub(crate) async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let key = work_order_key(&id)?;
    let mut fields = object_body(body)?;
    fields.remove(ID_FIELD);
    if !state.store.update_merge(WORK_ORDERS.name, &key, fields).await? {
        return Err(not_found());
    }
    Ok(message("Orden de trabajo actualizada"))
}

pub(crate) async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let key = work_order_key(&id)?;
    if !state.store.delete(WORK_ORDERS.name, &key).await? {
        return Err(not_found());
    }
    Ok(message("Orden de trabajo eliminada"))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusBody {
    estado: Option<JsonValue>,
}

pub(crate) async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<JsonValue>, ApiError> {
    let key = work_order_key(&id)?;
    let raw = body
        .estado
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::Validation("El campo estado es requerido".into()))?;
    let status = KeyKind::Integer
        .key_from_json(&raw)
        .ok()
        .and_then(|k| k.as_int())
        .and_then(|code| WorkOrderStatus::try_from(code).ok())
        .ok_or_else(|| ApiError::Validation("estado debe ser 1, 2 o 3".into()))?;

    let mut fields = Document::new();
    fields.insert("estado".into(), JsonValue::from(status.code()));
    if !state.store.update_merge(WORK_ORDERS.name, &key, fields).await? {
        return Err(not_found());
    }
    Ok(Json(json!({
        "mensaje": "Estado de la orden actualizado",
        "estado": status.code(),
    })))
}

pub(crate) async fn report_by_zone(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JsonValue>>, ApiError> {
    let mut groups = state.store.count_by(WORK_ORDERS.name, "cod_zona").await?;
    groups.sort_by(|a, b| b.1.cmp(&a.1));

    let zone_kind = admin_collection(ZONES).map_or(KeyKind::Integer, |spec| spec.key_kind);
    let mut rows = Vec::with_capacity(groups.len());
    for (zone, contador) in groups {
        let name = match zone_kind.key_from_json(&zone) {
            Ok(key) => state.store.get(ZONES, &key).await?.and_then(|doc| {
                doc.get("zona")
                    .or_else(|| doc.get("nombre"))
                    .filter(|v| !v.is_null())
                    .cloned()
            }),
            Err(_) => None,
        };
        rows.push(json!({
            "_id": zone,
            "zona": name.unwrap_or(JsonValue::Null),
            "contador": contador,
        }));
    }
    Ok(Json(rows))
}

pub(crate) async fn report_by_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JsonValue>>, ApiError> {
    let mut groups = state.store.count_by(WORK_ORDERS.name, "estado").await?;
    groups.sort_by_key(|(estado, _)| estado.as_i64().unwrap_or(i64::MAX));
    Ok(Json(
        groups
            .into_iter()
            .map(|(estado, contador)| json!({ "_id": estado, "contador": contador }))
            .collect(),
    ))
}
