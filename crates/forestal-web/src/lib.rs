//! Axum JSON API for the forestry backend: CRUD collections, progress
//! records, reports and the ETL trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{any, get, patch},
    Json, Router,
};
use forestal_core::Document;
use forestal_storage::DocumentStore;
use forestal_sync::{EtlPipeline, SyncConfig};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::info;

mod collections;
mod cron;
mod error;
mod progress;
mod work_orders;

pub use error::ApiError;
pub use progress::refresh_work_order_status;

pub const CRATE_NAME: &str = "forestal-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub pipeline: Arc<EtlPipeline>,
    pub cron_secret: Option<String>,
    /// Include error chains in ETL failure bodies.
    pub development: bool,
}

impl AppState {
    pub fn new(pipeline: Arc<EtlPipeline>) -> Self {
        Self {
            store: Arc::clone(pipeline.store()),
            pipeline,
            cron_secret: None,
            development: false,
        }
    }

    pub fn from_config(config: &SyncConfig, pipeline: Arc<EtlPipeline>) -> Self {
        Self {
            cron_secret: config.cron_secret.clone(),
            development: config.development,
            ..Self::new(pipeline)
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route(
            "/api/ordenesTrabajoAPI",
            get(work_orders::list).post(work_orders::create),
        )
        .route(
            "/api/ordenesTrabajoAPI/{id}",
            get(work_orders::get_one)
                .put(work_orders::update)
                .delete(work_orders::remove),
        )
        .route("/api/ordenesTrabajoAPI/{id}/estado", patch(work_orders::set_status))
        .route("/api/avances", get(progress::list).post(progress::create))
        .route(
            "/api/avances/{id}",
            get(progress::get_one).put(progress::update).delete(progress::remove),
        )
        .route("/api/reportes/ordenesPorZona", get(work_orders::report_by_zone))
        .route("/api/reportes/ordenesPorEstado", get(work_orders::report_by_status))
        .route("/api/cron/etl", any(cron::etl_trigger))
        .route(
            "/api/{collection}",
            get(collections::list).post(collections::create),
        )
        .route(
            "/api/{collection}/{id}",
            get(collections::get_one)
                .put(collections::update)
                .delete(collections::remove),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = bind_addr, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving api")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "mensaje": "API de Gestión Forestal funcionando" }))
}

pub(crate) fn message(text: impl Into<String>) -> Json<JsonValue> {
    Json(json!({ "mensaje": text.into() }))
}

/// Request bodies for document routes must be JSON objects.
pub(crate) fn object_body(body: JsonValue) -> Result<Document, ApiError> {
    match body {
        JsonValue::Object(doc) => Ok(doc),
        _ => Err(ApiError::Validation("el cuerpo debe ser un objeto JSON".into())),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use forestal_adapters::UpstreamSource;
    use forestal_storage::{FetchError, MemoryDocumentStore};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub struct StaticUpstream(pub JsonValue);

    #[async_trait]
    impl UpstreamSource for StaticUpstream {
        async fn fetch_work_orders(&self, _since: &str) -> Result<JsonValue, FetchError> {
            Ok(self.0.clone())
        }

        async fn fetch_admin_data(&self) -> Result<JsonValue, FetchError> {
            Ok(json!({}))
        }
    }

    pub fn state_with(upstream: JsonValue) -> AppState {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let pipeline = EtlPipeline::new(store, Arc::new(StaticUpstream(upstream)), "2020-01-01");
        AppState::new(Arc::new(pipeline))
    }

    pub fn test_state() -> AppState {
        state_with(json!([]))
    }

    pub async fn send(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app(state.clone()).oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}
