//! Status HTTP surface: fetcher control and the persisted fetch log.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::fetcher::FetchCoordinator;

/// Shared state for the status routes.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<FetchCoordinator>,
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /api/tenants/{tenant}/fetcher
async fn fetcher_status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    Json(state.coordinator.status(&tenant).await)
}

/// POST /api/tenants/{tenant}/fetcher/start
async fn start_fetcher(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    Json(state.coordinator.start(&tenant).await)
}

/// POST /api/tenants/{tenant}/fetcher/stop
async fn stop_fetcher(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    Json(state.coordinator.stop(&tenant).await)
}

/// POST /api/tenants/{tenant}/fetcher/run
///
/// Starts a detached cycle and answers immediately. A cycle already in
/// flight turns this one into a `cycle_skip` log entry.
async fn run_fetcher(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    state.coordinator.trigger(&tenant);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "tenant": tenant, "status": "accepted" })),
    )
}

/// GET /api/tenants/{tenant}/logs
async fn fetch_logs(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.logs(&tenant).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            warn!(tenant = %tenant, error = %e, "Failed to load fetch log");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Build the status router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tenants/{tenant}/fetcher", get(fetcher_status))
        .route("/api/tenants/{tenant}/fetcher/start", post(start_fetcher))
        .route("/api/tenants/{tenant}/fetcher/stop", post(stop_fetcher))
        .route("/api/tenants/{tenant}/fetcher/run", post(run_fetcher))
        .route("/api/tenants/{tenant}/logs", get(fetch_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::llm::UnconfiguredBackend;
    use crate::logs::LogEntry;
    use crate::mail::ProviderRegistry;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<FetchCoordinator>) {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _rx) = FetchCoordinator::new(
            store.clone(),
            store,
            Arc::new(UnconfiguredBackend),
            ProviderRegistry::new(),
            &OrchestratorConfig::default(),
        );
        let router = router(AppState {
            coordinator: Arc::clone(&coordinator),
        });
        (router, coordinator)
    }

    async fn call(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (router, _) = app();
        let (status, body) = call(router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_idle_tenant() {
        let (router, _) = app();
        let (status, body) = call(router, "GET", "/api/tenants/t1/fetcher").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], false);
        assert_eq!(body["running"], false);
        assert_eq!(body["accounts"], Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn start_and_stop_toggle_active() {
        let (router, _) = app();
        let (_, body) = call(router.clone(), "POST", "/api/tenants/t1/fetcher/start").await;
        assert_eq!(body["active"], true);
        let (_, body) = call(router, "POST", "/api/tenants/t1/fetcher/stop").await;
        assert_eq!(body["active"], false);
        assert!(body["next_cycle_at"].is_null());
    }

    #[tokio::test]
    async fn run_is_accepted() {
        let (router, _) = app();
        let (status, body) = call(router, "POST", "/api/tenants/t1/fetcher/run").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["tenant"], "t1");
    }

    #[tokio::test]
    async fn logs_are_returned() {
        let (router, coordinator) = app();
        let session = coordinator.registry().get_or_create("t1").await;
        session
            .log()
            .append(LogEntry::info("cycle_skip", "busy"))
            .await
            .unwrap();

        let (status, body) = call(router, "GET", "/api/tenants/t1/logs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["event"], "cycle_skip");
        assert_eq!(body[0]["level"], "info");
    }
}
