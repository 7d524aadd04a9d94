//! Pass-through CRUD for the administrative families and crews.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use forestal_adapters::{prepare_record, PrepareError};
use forestal_core::{admin_collection, CollectionSpec, DocKey, Document, KeyKind, CREWS, ID_FIELD};
use forestal_storage::{FindQuery, Sort};
use serde_json::{json, Value as JsonValue};

use crate::{message, object_body, ApiError, AppState};

fn resolve(name: &str) -> Result<CollectionSpec, ApiError> {
    if name == CREWS.name {
        return Ok(CREWS);
    }
    admin_collection(name).ok_or_else(|| ApiError::NotFound(format!("colección {name} no existe")))
}

fn not_found(spec: &CollectionSpec) -> ApiError {
    ApiError::NotFound(format!("Elemento de {} no encontrado", spec.name))
}

fn stamp_crew(spec: &CollectionSpec, doc: &mut Document, created: bool) {
    if spec.name != CREWS.name {
        return;
    }
    let now = JsonValue::from(Utc::now().to_rfc3339());
    if created {
        doc.entry("activa").or_insert(JsonValue::Bool(true));
        doc.insert("fechaCreacion".into(), now.clone());
    }
    doc.insert("ultimaActualizacion".into(), now);
}

pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let spec = resolve(&collection)?;
    let query = FindQuery::all().sorted(Sort::asc(ID_FIELD));
    Ok(Json(state.store.find(spec.name, &query).await?))
}

pub(crate) async fn get_one(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Document>, ApiError> {
    let spec = resolve(&collection)?;
    let key = spec.key_kind.parse_key(&id)?;
    state
        .store
        .get(spec.name, &key)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&spec))
}

pub(crate) async fn create(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Json(body): Json<JsonValue>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let spec = resolve(&collection)?;
    let body = JsonValue::Object(object_body(body)?);

    let (key, mut fields) = match prepare_record(&spec, body.clone()) {
        Ok(prepared) => (prepared.key, prepared.fields),
        Err(PrepareError::MissingKey { .. }) => {
            let mut fields = object_body(body)?;
            fields.remove(ID_FIELD);
            fields.remove(spec.natural_key);
            let key = match spec.key_kind {
                KeyKind::Text => DocKey::new_text(),
                KeyKind::Integer | KeyKind::IntegerOrText => {
                    let next = state.store.max_int_key(spec.name).await?.unwrap_or(0) + 1;
                    DocKey::Int(next)
                }
            };
            (key, fields)
        }
        Err(err) => return Err(ApiError::Validation(err.to_string())),
    };
    stamp_crew(&spec, &mut fields, true);

    state.store.insert(spec.name, &key, fields).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "mensaje": format!("Elemento de {} creado", spec.name),
            "id": key.to_json(),
        })),
    ))
}

pub(crate) async fn update(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let spec = resolve(&collection)?;
    let key = spec.key_kind.parse_key(&id)?;
    let mut fields = object_body(body)?;
    fields.remove(ID_FIELD);
    stamp_crew(&spec, &mut fields, false);

    if !state.store.update_merge(spec.name, &key, fields).await? {
        return Err(not_found(&spec));
    }
    Ok(message(format!("Elemento de {} actualizado", spec.name)))
}

pub(crate) async fn remove(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<JsonValue>, ApiError> {
    let spec = resolve(&collection)?;
    let key = spec.key_kind.parse_key(&id)?;
    if !state.store.delete(spec.name, &key).await? {
        return Err(not_found(&spec));
    }
    Ok(message(format!("Elemento de {} eliminado", spec.name)))
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn admin_crud_round_trip() {
        let state = test_state();
        let (status, created) =
            send(&state, "POST", "/api/zonas", Some(json!({"_id": 7, "zona": "Norte"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], json!(7));

        let (status, _) =
            send(&state, "PUT", "/api/zonas/7", Some(json!({"zona": "Noreste"}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, doc) = send(&state, "GET", "/api/zonas/7", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["zona"], json!("Noreste"));

        let (_, all) = send(&state, "GET", "/api/zonas", None).await;
        assert_eq!(all.as_array().map(Vec::len), Some(1));

        let (status, _) = send(&state, "DELETE", "/api/zonas/7", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&state, "GET", "/api/zonas/7", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("Elemento de zonas no encontrado"));
    }

    #[tokio::test]
    async fn natural_keys_are_remapped_on_create() {
        let state = test_state();
        let (status, created) =
            send(&state, "POST", "/api/campos", Some(json!({"idcampo": "31", "nombre": "La Loma"})))
                .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], json!(31));
        let (_, doc) = send(&state, "GET", "/api/campos/31", None).await;
        assert!(doc.get("idcampo").is_none());
    }

    #[tokio::test]
    async fn integer_collections_assign_next_id_and_reject_duplicates() {
        let state = test_state();
        send(&state, "POST", "/api/especies", Some(json!({"_id": 4}))).await;
        let (_, created) = send(&state, "POST", "/api/especies", Some(json!({"nombre": "Pino"}))).await;
        assert_eq!(created["id"], json!(5));

        let (status, _) = send(&state, "POST", "/api/especies", Some(json!({"_id": 4}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn crews_get_generated_text_ids_and_timestamps() {
        let state = test_state();
        let (status, created) =
            send(&state, "POST", "/api/cuadrillas", Some(json!({"nombre": "Cuadrilla Norte"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().expect("text id").to_string();

        let (_, doc) = send(&state, "GET", &format!("/api/cuadrillas/{id}"), None).await;
        assert_eq!(doc["activa"], json!(true));
        assert!(doc["fechaCreacion"].is_string());
    }

    #[tokio::test]
    async fn admin_records_keep_text_identifiers() {
        let state = test_state();
        let hex = "507f1f77bcf86cd799439011";
        let (status, created) =
            send(&state, "POST", "/api/usuarios", Some(json!({"_id": hex, "nombre": "Ana"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], json!(hex));

        let (status, doc) = send(&state, "GET", &format!("/api/usuarios/{hex}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["nombre"], json!("Ana"));

        send(&state, "POST", "/api/usuarios", Some(json!({"_id": 3}))).await;
        let (_, next) = send(&state, "POST", "/api/usuarios", Some(json!({"nombre": "Luis"}))).await;
        assert_eq!(next["id"], json!(4));
    }

    #[tokio::test]
    async fn unknown_collections_and_bad_ids() {
        let state = test_state();
        let (status, _) = send(&state, "GET", "/api/viveros", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, "GET", "/api/zonas/ZN-404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, "PUT", "/api/zonas/99", Some(json!({"zona": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
