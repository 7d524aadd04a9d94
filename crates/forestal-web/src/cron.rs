use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forestal_sync::{error_kind, RunOptions, RunOutcome};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TriggerParams {
    from: Option<String>,
    force: Option<String>,
}

impl TriggerParams {
    fn options(self) -> RunOptions {
        RunOptions {
            from: self.from.filter(|f| !f.trim().is_empty()),
            force: matches!(self.force.as_deref(), Some("true" | "1")),
        }
    }
}

fn authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret)
}

/// Entry point for the external scheduler.
pub(crate) async fn etl_trigger(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    Query(params): Query<TriggerParams>,
) -> Response {
    if method != Method::GET {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({ "error": "Método no permitido" })),
        )
            .into_response();
    }
    if !authorized(state.cron_secret.as_deref(), &headers) {
        warn!("etl trigger rejected, bad cron secret");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "No autorizado" }))).into_response();
    }

    match state.pipeline.run_once(&params.options()).await {
        Ok(RunOutcome::Completed(summary)) => (StatusCode::OK, Json(*summary)).into_response(),
        Ok(RunOutcome::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Proceso ETL en curso",
                "mensaje": "Otra ejecución del proceso ETL mantiene el bloqueo",
            })),
        )
            .into_response(),
        Err(err) => {
            let mensaje = format!("{err:#}");
            error!(error = %mensaje, "etl trigger failed");
            let mut body = json!({
                "error": "Proceso ETL falló",
                "mensaje": mensaje,
                "tipo": error_kind(&err),
            });
            if state.development {
                body["detalles"] = json!(err.chain().map(ToString::to_string).collect::<Vec<_>>());
            }
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use forestal_adapters::UpstreamSource;
    use forestal_storage::{DocumentStore, FetchError, MemoryDocumentStore};
    use forestal_sync::{EtlPipeline, ETL_LOCK};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use std::time::Duration;
    use tower::ServiceExt;

    struct CredentialsExpired;

    #[async_trait]
    impl UpstreamSource for CredentialsExpired {
        async fn fetch_work_orders(&self, _since: &str) -> Result<JsonValue, FetchError> {
            Err(FetchError::Credentials {
                status: 401,
                url: "http://gis.test/api/ordenes/listar".into(),
            })
        }

        async fn fetch_admin_data(&self) -> Result<JsonValue, FetchError> {
            Ok(json!({}))
        }
    }

    fn failing_state(development: bool) -> AppState {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let pipeline = EtlPipeline::new(store, Arc::new(CredentialsExpired), "2020-01-01");
        AppState {
            development,
            ..AppState::new(Arc::new(pipeline))
        }
    }

    async fn get_with_auth(state: &AppState, uri: &str, auth: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap();
        let resp = crate::app(state.clone()).oneshot(request).await.unwrap();
        let status = resp.status();
        let _ = resp.into_body().collect().await.unwrap();
        status
    }

    #[tokio::test]
    async fn successful_run_returns_summary() {
        let state = state_with(json!({"data": [
            {"_id": 1, "fecha": "2024-01-01"},
            {"_id": 2, "fecha": "2024-01-02"}
        ]}));
        let (status, body) = send(&state, "GET", "/api/cron/etl?from=2023-12-01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["ordenes"]["nuevas"], json!(2));
        assert_eq!(body["estadisticas"]["totalOrdenesEnBD"], json!(2));
        assert_eq!(body["estadisticas"]["ultimaOrdenFecha"], json!("2024-01-02"));
        assert_eq!(body["desde"]["since"], json!("2023-12-01"));
    }

    #[tokio::test]
    async fn non_get_methods_are_rejected() {
        let (status, body) = send(&test_state(), "POST", "/api/cron/etl", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"], json!("Método no permitido"));
    }

    #[tokio::test]
    async fn cron_secret_is_enforced_when_configured() {
        let state = AppState {
            cron_secret: Some("s3cret".into()),
            ..test_state()
        };
        let (status, body) = send(&state, "GET", "/api/cron/etl", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], json!("No autorizado"));
        assert_eq!(get_with_auth(&state, "/api/cron/etl", "Bearer wrong").await, StatusCode::UNAUTHORIZED);
        assert_eq!(get_with_auth(&state, "/api/cron/etl", "Bearer s3cret").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn held_lock_reports_conflict() {
        let state = test_state();
        assert!(state
            .store
            .try_acquire_lock(ETL_LOCK, "other-run", Duration::from_secs(60))
            .await
            .expect("lock"));
        let (status, _) = send(&state, "GET", "/api/cron/etl", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn failures_carry_kind_and_details_only_in_development() {
        let (status, body) = send(&failing_state(false), "GET", "/api/cron/etl", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], json!("Proceso ETL falló"));
        assert_eq!(body["tipo"], json!("credentials"));
        let mensaje = body["mensaje"].as_str().expect("mensaje");
        assert!(mensaje.contains("401"), "{mensaje}");
        assert!(mensaje.starts_with("fetching work orders"), "{mensaje}");
        assert!(body.get("detalles").is_none());

        let (_, body) = send(&failing_state(true), "GET", "/api/cron/etl", None).await;
        assert!(body["detalles"].as_array().is_some_and(|d| d.len() >= 2));
    }

    #[test]
    fn force_accepts_true_and_one() {
        for (raw, expected) in [("true", true), ("1", true), ("yes", false)] {
            let params = TriggerParams {
                from: None,
                force: Some(raw.into()),
            };
            assert_eq!(params.options().force, expected);
        }
    }
}
