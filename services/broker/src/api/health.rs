//! Health check endpoints.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    /// Current timestamp (ISO 8601).
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerStatus>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct BrokerStatus {
    pub resources: usize,
    pub reserved_ids: usize,
    pub live_connections: usize,
    /// Ids held back after a failed delete. Their machines may still exist.
    pub withheld_ids: Vec<u32>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, broker: Option<BrokerStatus>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: status.to_string(),
        service: "vmlease-broker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        broker,
    })
}

/// Liveness: the process is up. Checks nothing else.
async fn healthz() -> impl IntoResponse {
    response("ok", None)
}

async fn livez() -> impl IntoResponse {
    response("ok", None)
}

/// Readiness, with lifecycle counters. Withheld ids make the broker
/// "degraded" but it keeps serving.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let manager = state.manager();
    let withheld_ids: Vec<u32> = manager.withheld().into_iter().map(u32::from).collect();
    let status = if withheld_ids.is_empty() { "ok" } else { "degraded" };

    response(
        status,
        Some(BrokerStatus {
            resources: manager.records().len(),
            reserved_ids: manager.reserved_count(),
            live_connections: state.registry().live_count(),
            withheld_ids,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use vmlease_id::{ResourceId, UserId};

    use crate::backend::MockBackend;
    use crate::catalog::Catalog;
    use crate::connection::ConnectionRegistry;
    use crate::manager::{ResourceManager, DEFAULT_DOMAIN};
    use crate::persistence::Snapshot;

    async fn get_json(app: Router, uri: &str) -> HealthResponse {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let backend = Arc::new(MockBackend::new());
        let state = AppState::new(
            ResourceManager::new(backend, DEFAULT_DOMAIN),
            ConnectionRegistry::new(),
            Catalog::empty(),
        );
        let health = get_json(routes().with_state(state), "/healthz").await;
        assert_eq!(health.status, "ok");
        assert!(health.broker.is_none());
    }

    #[tokio::test]
    async fn test_readyz_reports_withheld_ids() {
        let backend = Arc::new(MockBackend::with_latency(std::time::Duration::ZERO));
        backend.set_fail_deletes(true);
        let manager = ResourceManager::new(backend, DEFAULT_DOMAIN);
        let orphans: Snapshot = [(UserId::parse("alice").unwrap(), ResourceId::new(5))]
            .into_iter()
            .collect();
        manager.adopt_orphans(&orphans);
        manager.release_orphans(orphans).await;

        let registry = ConnectionRegistry::new();
        registry.admit(&UserId::parse("bob").unwrap()).unwrap();
        let state = AppState::new(manager, registry, Catalog::empty());

        let ready = get_json(routes().with_state(state), "/readyz").await;
        assert_eq!(ready.status, "degraded");
        let broker = ready.broker.unwrap();
        assert_eq!(broker.withheld_ids, vec![5]);
        assert_eq!(broker.reserved_ids, 1);
        assert_eq!(broker.live_connections, 1);
        assert_eq!(broker.resources, 0);
    }
}
