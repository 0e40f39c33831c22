//! HTTP routes of the adapter.
//!
//! - GET /ping
//! - POST /v1/chat/completions
//! - POST /v1/completions
//! - POST /invocations
//! - ANY /v1/{*path} (passed through to the engine)
//! - GET /metrics
//!
//! Every inference route is gated on process readiness and engine health.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bootstrap::ReadinessFlag;
use crate::engine::supervisor::{EngineHandle, EngineState};
use crate::server::dialect::{Dialect, TranslationContext};
use crate::server::error::AdapterError;
use crate::server::metrics::AdapterMetrics;
use crate::server::proxy::{set_request_id, EngineClient, X_REQUEST_ID};

/// Application state shared across handlers.
pub struct AppState {
    pub engine: EngineHandle,
    pub readiness: ReadinessFlag,
    pub client: EngineClient,
    pub metrics: AdapterMetrics,
}

/// Build the axum router with all adapter routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/{*path}", any(passthrough))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ─── Readiness ─────────────────────────────────────────────────────────────

fn ensure_ready(state: &AppState) -> Result<(), AdapterError> {
    if !state.readiness.is_set() {
        return Err(AdapterError::unavailable("model is still being prepared"));
    }
    match state.engine.state() {
        EngineState::Healthy => Ok(()),
        other => Err(AdapterError::unavailable(format!("engine is {other}"))),
    }
}

async fn ping(State(state): State<Arc<AppState>>) -> Response {
    match ensure_ready(&state) {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => e.into_response(),
    }
}

// ─── Inference ─────────────────────────────────────────────────────────────

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    inference(&state, Dialect::Chat, "chat_completions", headers, body).await
}

async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    inference(&state, Dialect::Completion, "completions", headers, body).await
}

async fn invocations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    inference(&state, Dialect::Invocation, "invocations", headers, body).await
}

async fn inference(
    state: &AppState,
    dialect: Dialect,
    route: &'static str,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);

    let result = async {
        ensure_ready(state)?;
        let ctx = TranslationContext::new(dialect, body, request_id.clone())?;

        info!(
            request_id = ctx.request_id,
            dialect = ctx.dialect.as_str(),
            kind = ctx.request.kind(),
            stream = ctx.request.is_stream(),
            "Inference request"
        );

        let forwarded = state
            .client
            .forward(
                state.engine.base_url(),
                Method::POST,
                ctx.request.engine_path(),
                &headers,
                ctx.body,
                &ctx.request_id,
            )
            .await?;
        state.metrics.observe_first_byte(route, forwarded.first_byte);
        Ok::<_, AdapterError>(forwarded.response)
    }
    .await;

    finish(state, route, &request_id, result)
}

async fn passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const ROUTE: &str = "passthrough";
    let request_id = request_id(&headers);
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let result = async {
        ensure_ready(&state)?;
        let forwarded = state
            .client
            .forward(
                state.engine.base_url(),
                method,
                path,
                &headers,
                body,
                &request_id,
            )
            .await?;
        state.metrics.observe_first_byte(ROUTE, forwarded.first_byte);
        Ok::<_, AdapterError>(forwarded.response)
    }
    .await;

    finish(&state, ROUTE, &request_id, result)
}

/// Count the outcome and make sure the correlation id is on the response.
fn finish(
    state: &AppState,
    route: &str,
    request_id: &str,
    result: Result<Response, AdapterError>,
) -> Response {
    match result {
        Ok(response) => {
            state
                .metrics
                .record_request(route, response.status().as_str());
            response
        }
        Err(e) => {
            warn!(request_id, route, code = e.code(), "Request failed: {e}");
            state.metrics.record_request(route, e.code());
            let mut response = e.into_response();
            set_request_id(&mut response, request_id);
            response
        }
    }
}

// ─── Metrics ───────────────────────────────────────────────────────────────

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{EngineConfig, ServerConfig};
    use crate::engine::process::{EngineExit, EngineProcess};
    use crate::engine::supervisor::EngineSupervisor;
    use crate::model::artifact::PreparedArtifact;

    struct NeverStarted;

    #[async_trait::async_trait]
    impl EngineProcess for NeverStarted {
        async fn start(&mut self, _artifact: &PreparedArtifact) -> std::io::Result<()> {
            Ok(())
        }
        fn pid(&self) -> Option<u32> {
            None
        }
        async fn is_healthy(&self) -> bool {
            false
        }
        fn try_exit(&mut self) -> std::io::Result<Option<EngineExit>> {
            Ok(None)
        }
        async fn wait_exit(&mut self) -> std::io::Result<EngineExit> {
            std::future::pending().await
        }
        async fn stop(&mut self) -> std::io::Result<EngineExit> {
            Ok(EngineExit { code: None })
        }
    }

    fn app() -> Router {
        let supervisor = EngineSupervisor::new(Box::new(NeverStarted), EngineConfig::default());
        let state = Arc::new(AppState {
            engine: supervisor.handle(),
            readiness: ReadinessFlag::new(),
            client: EngineClient::new(&ServerConfig::default()).unwrap(),
            metrics: AdapterMetrics::new().unwrap(),
        });
        build_router(state)
    }

    #[test]
    fn test_request_id_reuses_inbound_header() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, "abc-123".parse().unwrap());
        assert_eq!(request_id(&headers), "abc-123");

        let generated = request_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[tokio::test]
    async fn test_ping_before_ready() {
        let resp = app()
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_inference_gated_before_ready() {
        let resp = app()
            .oneshot(
                Request::post("/invocations")
                    .header(X_REQUEST_ID, "boot-1")
                    .body(Body::from(r#"{"prompt":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[X_REQUEST_ID], "boot-1");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = app();
        app.clone()
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("adapter_requests_total"));
        assert!(text.contains("engine_unavailable"));
    }
}
