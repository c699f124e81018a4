pub mod breaker;
pub mod config;
pub mod conn_health;
pub mod errors;
pub mod keypool;
pub mod latency;
pub mod pacing;
pub mod proxy;
pub mod queue;
pub mod router;
pub mod state;
pub mod stats;
pub mod trace;

use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation ID middleware
// ═══════════════════════════════════════════════════════════════════════

/// Honors an incoming `x-request-id`, mints a UUID v4 otherwise, and echoes
/// it on the response so clients can correlate retries and traces.
async fn request_id_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        req.headers_mut().insert("x-request-id", header_value);
    }
    tracing::debug!(request_id = %request_id, "request correlation ID assigned");

    let mut response = next.run(req).await;

    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .entry("x-request-id")
            .or_insert(header_value);
    }

    response
}

// ═══════════════════════════════════════════════════════════════════════
//  Health, metrics & status
// ═══════════════════════════════════════════════════════════════════════

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let providers: Vec<serde_json::Value> = state
        .config
        .providers
        .iter()
        .map(|p| {
            let keys = state
                .keys
                .all_key_snapshots()
                .into_iter()
                .filter(|k| k.provider == p.name)
                .count();
            json!({ "name": p.name, "keys": keys })
        })
        .collect();

    Json(json!({
        "status": if state.is_ready() { "ok" } else { "starting" },
        "version": env!("CARGO_PKG_VERSION"),
        "app": "keymux",
        "uptime_seconds": uptime,
        "providers": providers,
    }))
}

/// Lightweight readiness probe: 503 until startup completes.
async fn readyz(State(state): State<AppState>) -> axum::response::Response {
    let ready = state.is_ready();
    let body = json!({ "ready": ready, "uptime_seconds": state.start_time.elapsed().as_secs() });
    if ready {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    state.stats.render_prometheus()
}

/// Read-only operational snapshot: key pool, model pool, queue, cooldowns.
async fn proxy_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = state
        .router
        .as_ref()
        .map(|r| r.model_snapshots())
        .unwrap_or_default();
    Json(json!({
        "global_in_flight": state.global_in_flight.load(Ordering::Acquire),
        "max_total_concurrency": state.config.max_total_concurrency,
        "queue_depth": state.queue.len(),
        "upstream_in_flight": state.pacing.in_flight(),
        "pool_cooldown_remaining_ms": state.keys.pool_cooldown_remaining(None).as_millis() as u64,
        "pool_429_count": state.keys.pool_429_count(),
        "keys": state.keys.all_key_snapshots(),
        "models": models,
        "routing_stats": state.stats.router.snapshot(),
        "token_usage": state.stats.token_usage()
            .into_iter()
            .map(|(model, (input, output))| json!({
                "model": model,
                "input_tokens": input,
                "output_tokens": output,
            }))
            .collect::<Vec<_>>(),
    }))
}

/// Fetch one request trace by id from the LRU store.
async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.traces.get(&id) {
        Some(trace) => Json(serde_json::to_value(&trace).unwrap_or_default()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "trace not found", "requestId": id })),
        )
            .into_response(),
    }
}

/// Build the application router with the given shared state. Extracted from
/// `main()` so integration tests can construct the app without binding a
/// network port.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // LLM routes — the proxy core.
        .route("/v1/messages", post(proxy::handle_llm_request))
        .route("/v1/messages/count_tokens", post(proxy::handle_llm_request))
        // Operational surface (read-only).
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/proxy/status", get(proxy_status))
        .route("/proxy/trace/{id}", get(get_trace))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            axum::http::HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
