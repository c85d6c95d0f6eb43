use crate::metrics::Metrics;
use crate::state::State as AgentState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<AgentState>>,
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<AgentState>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .with_state(HttpAppState { metrics, state })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(guard.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{AddressFamily, MetricSnapshot};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_state() -> Arc<RwLock<AgentState>> {
        Arc::new(RwLock::new(AgentState::new("127.0.0.1:35601", 0)))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let metrics = Metrics::new().expect("metrics");
        let app = build_router(metrics, app_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_lists_report_counters() {
        let metrics = Metrics::new().expect("metrics");
        let app = build_router(metrics.clone(), app_state());
        metrics.record_report(&MetricSnapshot::default(), &[], 64);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("agent_reports_sent_total 1"));
        assert!(text.contains("agent_connected"));
    }

    #[tokio::test]
    async fn api_state_returns_last_snapshot() {
        let metrics = Metrics::new().expect("metrics");
        let state = app_state();
        {
            let mut guard = state.write().await;
            guard.mark_connected(AddressFamily::Ipv4);
            guard.mark_reported(
                MetricSnapshot {
                    cpu: 12.5,
                    ..MetricSnapshot::default()
                },
                42,
            );
        }
        let app = build_router(metrics, state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["link"], "connected");
        assert_eq!(value["ip_family"], "ipv4");
        assert_eq!(value["last_report_unix"], 42);
        assert_eq!(value["last_snapshot"]["cpu"], 12.5);
    }
}
