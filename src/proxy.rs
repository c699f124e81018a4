// keymux — request handler
//
// The per-request state machine: admission under backpressure, the retry
// loop, routing compute/commit, credential acquisition with queue fallback,
// per-attempt dispatch with adaptive timeouts, 429 handling, and streaming
// pass-through with tail capture for usage extraction.
//
// Resource safety is Drop-based: the global in-flight slot, the credential,
// the committed router slot and the pacing permit are all held by guards
// that unwind on every exit path, including client disconnect (the handler
// future and the response stream are simply dropped, taking the guards with
// them).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use tokio::sync::OwnedSemaphorePermit;
use tokio_stream::StreamExt;

use crate::config::{AuthScheme, ProviderConfig, Tier};
use crate::errors::{ErrorType, classify_reqwest, strategy_for};
use crate::router::{OverflowCause, RequestProfile, RoutingContext, RoutingDecision};
use crate::state::AppState;
use crate::stats::ProxyEvent;
use crate::trace::{RequestTrace, SpanKind};

const MAX_CLIENT_BODY_BYTES: usize = 60 * 1024 * 1024;
const TAIL_CAPTURE_BYTES: usize = 64 * 1024;
const MODEL_PACING_CAP_MS: u64 = 1_000;
const MODEL_AT_CAPACITY_DELAY_MS: (u64, u64) = (500, 1_000);

// ── Header hygiene ──────────────────────────────────────────────────────────

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Never forwarded upstream, on top of hop-by-hop and `x-proxy-*`.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "x-admin-token",
    "cookie",
    "host",
    "content-length",
];

/// Provider extraHeaders may not override these.
const RESERVED_UPSTREAM_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "x-api-key",
    "authorization",
    "x-request-id",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Copy client headers minus the stripped set, then inject provider auth,
/// keep-alive, the request id and the provider's filtered extra headers.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    provider: &ProviderConfig,
    secret: &str,
    request_id: &str,
) -> HeaderMap {
    // Anything the client named in its own Connection header is hop-by-hop
    // for this hop too.
    let connection_listed: Vec<String> = client_headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut headers = HeaderMap::new();
    for (name, value) in client_headers {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower)
            || STRIPPED_HEADERS.contains(&lower.as_str())
            || lower.starts_with("x-proxy-")
            || connection_listed.contains(&lower)
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    match provider.auth_scheme {
        AuthScheme::XApiKey => {
            if let Ok(value) = HeaderValue::from_str(secret) {
                headers.insert("x-api-key", value);
            }
        }
        AuthScheme::Bearer => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {secret}")) {
                headers.insert("authorization", value);
            }
        }
    }
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }

    for (name, value) in &provider.extra_headers {
        let lower = name.to_ascii_lowercase();
        if RESERVED_UPSTREAM_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

// ── Guards ──────────────────────────────────────────────────────────────────

/// Holds the global in-flight slot for the whole request, streaming
/// included.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

/// Everything one attempt may hold: the credential, the committed router
/// slot, and the pacing permit. Dropping it releases all three and wakes the
/// next queue waiter.
struct AttemptResources {
    state: AppState,
    key_index: Option<usize>,
    decision: Option<RoutingDecision>,
    permit: Option<OwnedSemaphorePermit>,
}

impl AttemptResources {
    fn new(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            key_index: None,
            decision: None,
            permit: None,
        }
    }
}

impl Drop for AttemptResources {
    fn drop(&mut self) {
        if let Some(decision) = self.decision.take() {
            if let Some(router) = &self.state.router {
                router.release_decision(&decision);
            }
        }
        if let Some(index) = self.key_index.take() {
            self.state.keys.release(index);
            self.state.queue.wake_next();
        }
        // The pacing permit releases itself on drop.
        self.permit.take();
    }
}

// ── Proxy-generated responses ───────────────────────────────────────────────

fn proxy_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
    retry_after_secs: Option<u64>,
    extra_headers: &[(&str, String)],
) -> Response {
    let mut body = json!({
        "error": message,
        "errorType": error_type,
        "requestId": request_id,
    });
    if let Some(secs) = retry_after_secs {
        body["retryAfter"] = json!(secs);
    }

    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    if let Some(secs) = retry_after_secs {
        builder = builder.header("retry-after", secs.to_string());
    }
    for (name, value) in extra_headers {
        builder = builder.header(*name, value);
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            Response::new(Body::from(r#"{"error":"internal"}"#))
        })
}

/// The structured 400 for a genuinely oversized request body.
fn context_overflow_response(request_id: &str, estimated: u64, limit: u64) -> Response {
    let body = json!({
        "type": "error",
        "error": {
            "type": "invalid_request_error",
            "message": format!(
                "Request of ~{estimated} tokens exceeds the largest available model context \
                 ({limit} tokens). Reduce message history, shrink the system prompt, or lower \
                 max_tokens."
            ),
        },
        "requestId": request_id,
    });
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("content-type", "application/json")
        .header("x-proxy-error", "context_overflow")
        .header("x-proxy-overflow-cause", "genuine")
        .body(Body::from(body.to_string()))
        .expect("static response builds")
}

// ── Attempt outcome ─────────────────────────────────────────────────────────

struct AttemptFailure {
    error_type: ErrorType,
    message: String,
    should_exclude_key: bool,
    /// Dynamic override of the static strategy (the LLM-route 429 path).
    dynamic_retry: Option<bool>,
    retry_after_ms: Option<u64>,
    evidence: Option<Value>,
}

enum AttemptOutcome {
    /// Upstream answered with a pass-through status; body not yet consumed.
    Success {
        upstream: reqwest::Response,
        latency_ms: u64,
        permit: OwnedSemaphorePermit,
    },
    /// Terminal upstream response already fully buffered (auth exhausted,
    /// non-retryable 429).
    Passthrough(Response),
    Failure(AttemptFailure),
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// POST /v1/messages (and friends): the LLM route.
pub async fn handle_llm_request(
    State(state): State<AppState>,
    req: axum::http::Request<Body>,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Backpressure gate, before anything is allocated for this request.
    let cap = state.config.max_total_concurrency;
    let admitted = state
        .global_in_flight
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < cap).then_some(current + 1)
        })
        .is_ok();
    if !admitted {
        state
            .stats
            .backpressure_rejections
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(request_id = %request_id, "backpressure: global in-flight cap reached");
        return proxy_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "backpressure",
            "proxy is at capacity, retry shortly",
            &request_id,
            Some(1),
            &[],
        );
    }
    let in_flight_guard = InFlightGuard {
        counter: state.global_in_flight.clone(),
    };
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    state.events.emit(ProxyEvent::RequestStarted {
        request_id: request_id.clone(),
    });

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let client_headers = parts.headers;
    let body_bytes = match axum::body::to_bytes(body, MAX_CLIENT_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return proxy_response(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                "failed to read request body",
                &request_id,
                None,
                &[],
            );
        }
    };

    let deadline = state.config.overall_deadline();
    let handler = run_retry_loop(
        &state,
        &request_id,
        &path,
        client_headers,
        body_bytes,
        in_flight_guard,
    );
    match tokio::time::timeout(deadline, handler).await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(request_id = %request_id, "request exceeded the overall deadline");
            state
                .stats
                .client_request_failure
                .fetch_add(1, Ordering::Relaxed);
            proxy_response(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "request timed out after exhausting the retry budget",
                &request_id,
                Some(10),
                &[],
            )
        }
    }
}

// ── The retry loop ──────────────────────────────────────────────────────────

#[allow(clippy::too_many_lines)]
async fn run_retry_loop(
    state: &AppState,
    request_id: &str,
    path: &str,
    client_headers: HeaderMap,
    body_bytes: Bytes,
    in_flight_guard: InFlightGuard,
) -> Response {
    let config = &state.config;
    let mut trace = RequestTrace::new(request_id);

    let Ok(mut body_value) = serde_json::from_slice::<Value>(&body_bytes) else {
        state
            .stats
            .client_request_failure
            .fetch_add(1, Ordering::Relaxed);
        return proxy_response(
            StatusCode::BAD_REQUEST,
            "invalid_body",
            "request body is not valid JSON",
            request_id,
            None,
            &[],
        );
    };
    let profile = RequestProfile::from_body(&body_value);
    let tier_override = client_headers
        .get("x-proxy-tier")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_tier);

    let mut excluded_keys: Vec<usize> = Vec::new();
    let mut attempted_models: HashSet<String> = HashSet::new();
    let mut error_specific_retries: HashMap<ErrorType, u32> = HashMap::new();
    let mut last_error: Option<(ErrorType, String)> = None;
    let mut use_fresh_connection = false;
    let mut llm429_retries: u32 = 0;
    let mut retry_loop_start = Instant::now();
    let mut model_switch_count: u32 = 0;
    let mut prev_mapped_model: Option<String> = None;
    let mut give_up_reason: Option<String> = None;
    let mut next_retry_delay_ms: Option<u64> = None;

    let router_active = state.active_router().is_some();
    let failover = state
        .router
        .as_ref()
        .map(|r| r.config().failover.clone());

    for attempt in 0..=config.max_retries {
        // 1. Backoff.
        if attempt > 0 {
            let delay_ms = match next_retry_delay_ms.take() {
                Some(override_ms) => override_ms.min(config.retry.max_delay_ms),
                None => {
                    let strategy_multiplier = last_error
                        .as_ref()
                        .map(|(t, _)| strategy_for(*t).backoff_multiplier)
                        .unwrap_or(1.0);
                    backoff_delay_ms(&config.retry, attempt, strategy_multiplier)
                }
            };
            if let Some((error_type, _)) = &last_error {
                state.events.emit(ProxyEvent::RetryScheduled {
                    request_id: request_id.to_string(),
                    attempt,
                    error_type: error_type.as_str().to_string(),
                    delay_ms,
                });
            }
            trace.span(SpanKind::Retry, Some(format!("backoff {delay_ms}ms")));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        // 2. Pool cooldown gate (per-model when a model is already known).
        let pool_cooldown = state
            .keys
            .pool_cooldown_remaining(prev_mapped_model.as_deref());
        if pool_cooldown > Duration::ZERO {
            let cooldown_ms = pool_cooldown.as_millis() as u64;
            if attempt == 0
                && !router_active
                && cooldown_ms > config.pool_cooldown.sleep_threshold_ms
            {
                let jitter = rand::random_range(0..=config.pool_cooldown.retry_jitter_ms);
                let retry_after_secs = (cooldown_ms + jitter).div_ceil(1000);
                let scope = if state.keys.account_level_429() {
                    "account"
                } else {
                    "pool"
                };
                state
                    .stats
                    .client_request_failure
                    .fetch_add(1, Ordering::Relaxed);
                trace.finish("pool_cooldown", 429);
                state.traces.insert(trace);
                return proxy_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "upstream pool is rate limited, retry later",
                    request_id,
                    Some(retry_after_secs),
                    &[
                        ("x-rate-limit-scope", scope.to_string()),
                        ("x-proxy-rate-limit", "pool".to_string()),
                        ("x-proxy-retry-after-ms", cooldown_ms.to_string()),
                    ],
                );
            }
            let sleep_ms = cooldown_ms.min(config.pool_cooldown.max_cooldown_ms);
            tracing::info!(request_id = %request_id, sleep_ms, "pool cooldown: sleeping");
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }

        // 3. Admission hold: attempt 0 only, router active, feature on, and
        // every model of the target tier cooling.
        if attempt == 0 && config.admission_hold.enabled {
            if let Some(router) = state.active_router() {
                let ctx = RoutingContext {
                    request_id,
                    profile: &profile,
                    attempted_models: &attempted_models,
                    tier_override,
                };
                let tier = router.explain(&ctx, false).tier;
                let tier_in_scope = config.admission_hold.tiers.is_empty()
                    || config.admission_hold.tiers.contains(&tier);
                if tier_in_scope {
                    if let Some(hold_response) =
                        admission_hold(state, request_id, tier, &mut trace, &mut retry_loop_start)
                            .await
                    {
                        state
                            .stats
                            .client_request_failure
                            .fetch_add(1, Ordering::Relaxed);
                        trace.finish("admission_hold_timeout", 429);
                        state.traces.insert(trace);
                        return hold_response;
                    }
                }
            }
        }

        // 4. Proactive model pacing.
        if prev_mapped_model.is_some() {
            if let Some(failover) = &failover {
                let pacing_ms = failover.model_pacing_delay_ms.min(MODEL_PACING_CAP_MS);
                if pacing_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(pacing_ms)).await;
                }
            }
        }

        // 5. Routing compute.
        let mut resources = AttemptResources::new(state);
        let mut mapped_model: Option<String> = None;
        let mut provider_name = config
            .providers
            .first()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "anthropic".to_string());

        if let Some(router) = state.active_router() {
            let ctx = RoutingContext {
                request_id,
                profile: &profile,
                attempted_models: &attempted_models,
                tier_override,
            };
            if let Some(decision) = router.select_model(&ctx) {
                if let Some(overflow) = &decision.overflow {
                    match overflow.cause {
                        OverflowCause::TransientUnavailable
                            if router.config().transient_overflow_retry.enabled =>
                        {
                            // Retryable: the model that could fit is only
                            // temporarily unavailable. Overflow decisions
                            // stay uncommitted, so the cause is counted
                            // here, where it is acted on.
                            state
                                .stats
                                .router
                                .context_overflow_transient
                                .fetch_add(1, Ordering::Relaxed);
                            state.events.emit(ProxyEvent::ContextOverflow {
                                request_id: request_id.to_string(),
                                cause: overflow.cause.as_str().to_string(),
                                estimated_tokens: overflow.estimated_tokens,
                            });
                            last_error = Some((
                                ErrorType::ContextOverflowTransient,
                                decision.reason.clone(),
                            ));
                            let retries = error_specific_retries
                                .entry(ErrorType::ContextOverflowTransient)
                                .or_insert(0);
                            *retries += 1;
                            if *retries
                                > strategy_for(ErrorType::ContextOverflowTransient).max_retries
                            {
                                break;
                            }
                            continue;
                        }
                        _ => {
                            state
                                .stats
                                .router
                                .context_overflow_genuine
                                .fetch_add(1, Ordering::Relaxed);
                            state.events.emit(ProxyEvent::ContextOverflow {
                                request_id: request_id.to_string(),
                                cause: "genuine".to_string(),
                                estimated_tokens: overflow.estimated_tokens,
                            });
                            state
                                .stats
                                .client_request_failure
                                .fetch_add(1, Ordering::Relaxed);
                            trace.finish("context_overflow", 400);
                            state.traces.insert(trace);
                            return context_overflow_response(
                                request_id,
                                overflow.estimated_tokens,
                                overflow.model_context_length,
                            );
                        }
                    }
                }
                let Some(selected) = decision.model.clone() else {
                    // No candidate: commit the terminal routing decision so
                    // its fallback reason and shadow-downgrade fact are
                    // counted (no model, so no slot moves), then give up.
                    let mut decision = decision;
                    router.commit_decision(&mut decision);
                    give_up_reason = Some("tier_exhausted".to_string());
                    break;
                };
                if prev_mapped_model.as_deref() != Some(selected.id.as_str()) {
                    if prev_mapped_model.is_some() {
                        model_switch_count += 1;
                    }
                    if let Some(failover) = &failover {
                        if model_switch_count > failover.max_model_switches_per_request {
                            give_up_reason = Some("max_model_switches".to_string());
                            break;
                        }
                    }
                }
                mapped_model = Some(selected.id.clone());
                provider_name = selected.provider.clone();
                body_value["model"] = json!(selected.id);
                resources.decision = Some(decision);
            }
            // Shadow mode returned None: fall through with the client's own
            // model untouched.
        }
        if mapped_model.is_none() {
            mapped_model = profile.model.clone();
        }

        // 6. Model-at-capacity gate, before the slot commit.
        if let (Some(router), Some(model)) = (state.active_router(), mapped_model.as_deref()) {
            if resources.decision.is_some() && router.model_at_capacity(model) {
                attempted_models.insert(model.to_string());
                last_error = Some((
                    ErrorType::ModelAtCapacity,
                    format!("model {model} at max concurrency"),
                ));
                next_retry_delay_ms = Some(rand::random_range(
                    MODEL_AT_CAPACITY_DELAY_MS.0..=MODEL_AT_CAPACITY_DELAY_MS.1,
                ));
                let retries = error_specific_retries
                    .entry(ErrorType::ModelAtCapacity)
                    .or_insert(0);
                *retries += 1;
                if *retries > strategy_for(ErrorType::ModelAtCapacity).max_retries {
                    break;
                }
                continue;
            }
        }

        // 7. Acquire a credential, with the queue as the attempt-0 fallback.
        let key_index = match state.keys.acquire(&provider_name, &excluded_keys) {
            Some(index) => index,
            None if attempt == 0 => {
                match state.queue.enqueue(request_id) {
                    Err(_) => {
                        state
                            .stats
                            .queue_full_rejections
                            .fetch_add(1, Ordering::Relaxed);
                        state
                            .stats
                            .client_request_failure
                            .fetch_add(1, Ordering::Relaxed);
                        trace.finish("queue_full", 503);
                        state.traces.insert(trace);
                        return proxy_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "queue_full",
                            "no credential available and the waiter queue is full",
                            request_id,
                            Some(5),
                            &[("x-queue-full", "true".to_string())],
                        );
                    }
                    Ok(waiter) => {
                        let queue_timeout = Duration::from_millis(config.queue_timeout_ms);
                        match tokio::time::timeout(queue_timeout, waiter).await {
                            Ok(_) => match state.keys.acquire(&provider_name, &excluded_keys) {
                                Some(index) => index,
                                None => {
                                    state
                                        .stats
                                        .client_request_failure
                                        .fetch_add(1, Ordering::Relaxed);
                                    trace.finish("keys_exhausted", 503);
                                    state.traces.insert(trace);
                                    return proxy_response(
                                        StatusCode::SERVICE_UNAVAILABLE,
                                        "keys_exhausted",
                                        "woken from queue but every credential is busy",
                                        request_id,
                                        Some(2),
                                        &[],
                                    );
                                }
                            },
                            Err(_) => {
                                state.stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                                state
                                    .stats
                                    .client_request_failure
                                    .fetch_add(1, Ordering::Relaxed);
                                trace.finish("queue_timeout", 503);
                                state.traces.insert(trace);
                                return proxy_response(
                                    StatusCode::SERVICE_UNAVAILABLE,
                                    "queue_timeout",
                                    "timed out waiting for a credential",
                                    request_id,
                                    Some(2),
                                    &[("x-queue-full", "false".to_string())],
                                );
                            }
                        }
                    }
                }
            }
            None => {
                // Keep the upstream classification when one exists; an
                // empty pool on a later attempt is a consequence, not the
                // cause.
                if last_error.is_none() {
                    last_error = Some((
                        ErrorType::Other,
                        "no eligible credential for this attempt".to_string(),
                    ));
                }
                continue;
            }
        };
        resources.key_index = Some(key_index);
        let credential_id = state
            .keys
            .credential(key_index)
            .map(|c| c.id.clone())
            .unwrap_or_default();
        trace.begin_attempt(attempt, &credential_id, "pool selection");
        trace.span(SpanKind::KeyAcquired, None);
        if let Some(model) = &mapped_model {
            trace.set_model(model);
        }

        // 8. Commit the routing decision now that a credential is held.
        if let (Some(router), Some(decision)) =
            (state.router.as_ref(), resources.decision.as_mut())
        {
            router.commit_decision(decision);
        }
        if let Some(model) = &mapped_model {
            attempted_models.insert(model.clone());
        }
        prev_mapped_model = mapped_model.clone();

        state.events.emit(ProxyEvent::AttemptStarted {
            request_id: request_id.to_string(),
            attempt,
            credential_id: credential_id.clone(),
            model: mapped_model.clone(),
        });

        // 9. Dispatch.
        let attempt_body = if router_active {
            Bytes::from(body_value.to_string())
        } else {
            body_bytes.clone()
        };
        let outcome = dispatch_attempt(
            state,
            request_id,
            path,
            attempt,
            &client_headers,
            attempt_body,
            mapped_model.as_deref(),
            &provider_name,
            key_index,
            use_fresh_connection,
            router_active,
            &mut trace,
        )
        .await;
        use_fresh_connection = false;

        match outcome {
            AttemptOutcome::Success {
                upstream,
                // Latency was already recorded against the key at dispatch.
                latency_ms: _,
                permit,
            } => {
                resources.permit = Some(permit);
                if attempt > 0 {
                    state.stats.retry_success.fetch_add(1, Ordering::Relaxed);
                }
                state
                    .stats
                    .client_request_success
                    .fetch_add(1, Ordering::Relaxed);
                state.events.emit(ProxyEvent::RequestCompleted {
                    request_id: request_id.to_string(),
                    status: upstream.status().as_u16(),
                    attempts: attempt + 1,
                    duration_ms: trace.elapsed_ms(),
                });
                trace.span(SpanKind::Complete, Some(upstream.status().to_string()));
                trace.finish("success", upstream.status().as_u16());
                state.traces.insert(trace);
                return stream_response(state, upstream, mapped_model, resources, in_flight_guard);
            }
            AttemptOutcome::Passthrough(response) => {
                state
                    .stats
                    .client_request_failure
                    .fetch_add(1, Ordering::Relaxed);
                trace.finish("passthrough", response.status().as_u16());
                state.traces.insert(trace);
                return response;
            }
            AttemptOutcome::Failure(failure) => {
                drop(resources); // release key + slot before any backoff

                if failure.error_type == ErrorType::Aborted {
                    state
                        .stats
                        .client_request_failure
                        .fetch_add(1, Ordering::Relaxed);
                    trace.finish("aborted", 499);
                    state.traces.insert(trace);
                    return proxy_response(
                        StatusCode::BAD_GATEWAY,
                        "aborted",
                        "upstream request aborted",
                        request_id,
                        None,
                        &[],
                    );
                }

                let strategy = strategy_for(failure.error_type);
                last_error = Some((failure.error_type, failure.message.clone()));

                let should_retry = failure.dynamic_retry.unwrap_or(strategy.should_retry);
                if !should_retry {
                    break;
                }

                // Per-error-type retry budget. The dynamic 429 path manages
                // its own caps below instead.
                if failure.error_type != ErrorType::RateLimited {
                    let retries = error_specific_retries
                        .entry(failure.error_type)
                        .or_insert(0);
                    *retries += 1;
                    if *retries > strategy.max_retries {
                        break;
                    }
                }

                if failure.error_type == ErrorType::RateLimited {
                    // The response has not started: streaming only begins on
                    // the terminal attempt, so a retry here is always safe.
                    llm429_retries += 1;
                    if let Some(failover) = &failover {
                        if llm429_retries > failover.max_429_attempts_per_request {
                            give_up_reason = Some("max_429_attempts".to_string());
                            break;
                        }
                        if retry_loop_start.elapsed()
                            > Duration::from_millis(failover.max_429_retry_window_ms)
                        {
                            give_up_reason = Some("max_429_retry_window".to_string());
                            break;
                        }
                    } else if llm429_retries > config.max_retries {
                        break;
                    }
                    next_retry_delay_ms = failure.retry_after_ms;
                    if let Some(evidence) = &failure.evidence {
                        tracing::debug!(request_id = %request_id, %evidence, "429 evidence");
                    }
                }

                // The dynamic 429 path owns its exclusion verdict (a router
                // swaps models instead of blaming the key); every other
                // failure defers to the static table.
                let exclude_key = match failure.dynamic_retry {
                    Some(_) => failure.should_exclude_key,
                    None => failure.should_exclude_key || strategy.exclude_key,
                };
                if exclude_key && !excluded_keys.contains(&key_index) {
                    excluded_keys.push(key_index);
                }
                if strategy.use_fresh_connection {
                    use_fresh_connection = true;
                }
            }
        }
    }

    // Retries exhausted.
    state
        .stats
        .client_request_failure
        .fetch_add(1, Ordering::Relaxed);
    let response =
        final_error_response(request_id, give_up_reason, &last_error, attempted_models.len());
    trace.finish("exhausted", response.status().as_u16());
    state.traces.insert(trace);
    drop(in_flight_guard);
    response
}

fn parse_tier(raw: &str) -> Option<Tier> {
    match raw.to_ascii_lowercase().as_str() {
        "light" => Some(Tier::Light),
        "medium" => Some(Tier::Medium),
        "heavy" => Some(Tier::Heavy),
        _ => None,
    }
}

/// Exponential backoff with the strategy multiplier and symmetric jitter.
fn backoff_delay_ms(retry: &crate::config::RetryConfig, attempt: u32, multiplier: f64) -> u64 {
    let base = retry.base_delay_ms as f64
        * retry.backoff_multiplier.powi(attempt.saturating_sub(1) as i32)
        * multiplier;
    let jitter_span = base * retry.jitter_percent;
    let jittered = base + rand::random_range(-1.0..=1.0) * jitter_span;
    (jittered.round() as u64).min(retry.max_delay_ms)
}

/// Sleep while every model of the tier is cooling. Returns Some(response)
/// when the hold expires, None when the tier freed up (or no hold applies).
async fn admission_hold(
    state: &AppState,
    request_id: &str,
    tier: Tier,
    trace: &mut RequestTrace,
    retry_loop_start: &mut Instant,
) -> Option<Response> {
    let config = &state.config.admission_hold;
    let router = state.active_router()?;

    let min_cooldown = router.min_tier_cooldown(tier)?;
    if min_cooldown < Duration::from_millis(config.min_cooldown_to_hold_ms) {
        return None;
    }
    if state.holds_in_progress.load(Ordering::Acquire) >= config.max_concurrent_holds {
        return None;
    }

    state.holds_in_progress.fetch_add(1, Ordering::AcqRel);
    state.stats.admission_holds.fetch_add(1, Ordering::Relaxed);
    let hold_start = Instant::now();
    let max_hold = Duration::from_millis(config.max_hold_ms);
    tracing::info!(
        request_id = %request_id,
        tier = %tier,
        min_cooldown_ms = min_cooldown.as_millis() as u64,
        "admission hold: all tier models cooling"
    );

    let result = loop {
        let Some(remaining_cooldown) = router.min_tier_cooldown(tier) else {
            break None; // tier freed up
        };
        let elapsed = hold_start.elapsed();
        if elapsed >= max_hold {
            break Some(elapsed);
        }
        let jitter = Duration::from_millis(rand::random_range(0..=config.jitter_ms));
        let sleep_for = (remaining_cooldown + jitter).min(max_hold - elapsed);
        tokio::time::sleep(sleep_for).await;
    };
    state.holds_in_progress.fetch_sub(1, Ordering::AcqRel);

    let held = hold_start.elapsed();
    trace.admission_hold_ms = Some(held.as_millis() as u64);
    // The hold must not eat into the 429-window budget.
    *retry_loop_start += held;

    match result {
        None => {
            state
                .stats
                .admission_hold_success
                .fetch_add(1, Ordering::Relaxed);
            None
        }
        Some(duration) => {
            state
                .stats
                .admission_hold_timeout
                .fetch_add(1, Ordering::Relaxed);
            Some(proxy_response(
                StatusCode::TOO_MANY_REQUESTS,
                "admission_hold_timeout",
                "all models for this tier stayed rate limited for the whole hold",
                request_id,
                Some(5),
                &[
                    (
                        "x-proxy-rate-limit",
                        "admission_hold_timeout".to_string(),
                    ),
                    (
                        "x-proxy-hold-duration-ms",
                        duration.as_millis().to_string(),
                    ),
                    ("x-proxy-tier", tier.to_string()),
                ],
            ))
        }
    }
}

fn final_error_response(
    request_id: &str,
    give_up_reason: Option<String>,
    last_error: &Option<(ErrorType, String)>,
    attempted_models: usize,
) -> Response {
    if let Some(reason) = give_up_reason {
        return proxy_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "every candidate model is exhausted for this request",
            request_id,
            Some(5),
            &[
                ("x-proxy-rate-limit", "model_exhausted".to_string()),
                ("x-proxy-give-up-reason", reason),
                ("x-proxy-attempted-models", attempted_models.to_string()),
            ],
        );
    }

    match last_error {
        Some((ErrorType::ContextOverflowTransient, _)) => proxy_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "context_overflow_transient",
            "the only models large enough for this request are temporarily unavailable",
            request_id,
            Some(5),
            &[
                (
                    "x-proxy-error",
                    "context_overflow_transient".to_string(),
                ),
                (
                    "x-proxy-overflow-cause",
                    "transient_unavailable".to_string(),
                ),
            ],
        ),
        Some((ErrorType::ContextOverflow, _)) => context_overflow_response(request_id, 0, 0),
        Some((ErrorType::Timeout, _)) => proxy_response(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            "upstream timed out on every attempt",
            request_id,
            Some(10),
            &[],
        ),
        Some((error_type, message)) => proxy_response(
            StatusCode::BAD_GATEWAY,
            error_type.as_str(),
            message,
            request_id,
            Some(5),
            &[],
        ),
        None => proxy_response(
            StatusCode::BAD_GATEWAY,
            "other",
            "request failed without a classified error",
            request_id,
            Some(5),
            &[],
        ),
    }
}

// ── Per-attempt dispatch ────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn dispatch_attempt(
    state: &AppState,
    request_id: &str,
    path: &str,
    attempt: u32,
    client_headers: &HeaderMap,
    body: Bytes,
    mapped_model: Option<&str>,
    provider_name: &str,
    key_index: usize,
    use_fresh_connection: bool,
    router_active: bool,
    trace: &mut RequestTrace,
) -> AttemptOutcome {
    let Some(provider) = state.config.provider(provider_name) else {
        return AttemptOutcome::Failure(AttemptFailure {
            error_type: ErrorType::Other,
            message: format!("provider '{provider_name}' not configured"),
            should_exclude_key: false,
            dynamic_retry: None,
            retry_after_ms: None,
            evidence: None,
        });
    };

    let timeout = adaptive_timeout(state, mapped_model, key_index, attempt);
    trace.span(
        SpanKind::UpstreamStart,
        Some(format!("timeout {}ms", timeout.as_millis())),
    );

    // Pacing gate: caps concurrent upstream dials, with admission jitter.
    let permit = state.pacing.acquire().await;

    let secret = state
        .keys
        .credential(key_index)
        .map(|c| c.secret().to_string())
        .unwrap_or_default();
    let headers = build_upstream_headers(client_headers, provider, &secret, request_id);

    let url = format!("{}{}", provider.base_url.trim_end_matches('/'), path);
    let client = if use_fresh_connection {
        state.clients.fresh()
    } else {
        state.clients.pooled()
    };

    let started = Instant::now();
    let result = client
        .post(&url)
        .headers(headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            let error_type = classify_reqwest(&err);
            trace.span(SpanKind::Error, Some(error_type.as_str().to_string()));
            if error_type == ErrorType::Timeout {
                trace.span(SpanKind::Timeout, None);
            }
            state.keys.record_failure(key_index, error_type);
            if error_type.is_hangup() && state.conn_health.record_hangup() {
                state.clients.rebuild();
                state
                    .stats
                    .connection_pool_rebuilds
                    .fetch_add(1, Ordering::Relaxed);
            }
            tracing::warn!(
                request_id = %request_id,
                attempt,
                error = %error_type,
                "upstream dispatch failed: {err}"
            );
            return AttemptOutcome::Failure(AttemptFailure {
                error_type,
                message: err.to_string(),
                should_exclude_key: false,
                dynamic_retry: None,
                retry_after_ms: None,
                evidence: None,
            });
        }
    };

    let status = response.status();
    state.events.emit(ProxyEvent::UpstreamStatus {
        request_id: request_id.to_string(),
        attempt,
        status: status.as_u16(),
    });
    trace.span(SpanKind::FirstByte, Some(status.as_u16().to_string()));

    match status.as_u16() {
        401 | 403 => {
            state.keys.record_failure(key_index, ErrorType::AuthError);
            let buffered = buffer_passthrough(response).await;
            tracing::error!(
                request_id = %request_id,
                status = status.as_u16(),
                "upstream rejected this credential"
            );
            // Strategy allows one swap to a different key; the buffered
            // upstream response is what the client sees if retries run out.
            AttemptOutcome::Failure(AttemptFailure {
                error_type: ErrorType::AuthError,
                message: format!("upstream auth rejection ({status})"),
                should_exclude_key: true,
                dynamic_retry: None,
                retry_after_ms: None,
                evidence: Some(json!({"status": status.as_u16(), "body": buffered})),
            })
        }
        429 => handle_429(state, request_id, key_index, mapped_model, router_active, response).await,
        500..=599 => {
            state.stats.upstream_5xx.fetch_add(1, Ordering::Relaxed);
            state.keys.record_failure(key_index, ErrorType::ServerError);
            let body = buffer_passthrough(response).await;
            tracing::warn!(
                request_id = %request_id,
                status = status.as_u16(),
                "upstream server error"
            );
            AttemptOutcome::Failure(AttemptFailure {
                error_type: ErrorType::ServerError,
                message: format!("upstream {status}: {body}"),
                should_exclude_key: true,
                dynamic_retry: None,
                retry_after_ms: None,
                evidence: None,
            })
        }
        _ => {
            // 2xx and pass-through 4xx: success for the state machine.
            state.keys.record_success(key_index, latency_ms);
            state.conn_health.record_success();
            if let (Some(router), Some(model)) = (state.router.as_ref(), mapped_model) {
                router.record_model_latency(model, latency_ms);
            }
            AttemptOutcome::Success {
                upstream: response,
                latency_ms,
                permit,
            }
        }
    }
}

/// Base = max(key p95, model p95) · multiplier, clamped, then grown per
/// retry attempt. Below the sample floor the configured initial value rules.
fn adaptive_timeout(
    state: &AppState,
    mapped_model: Option<&str>,
    key_index: usize,
    attempt: u32,
) -> Duration {
    let config = &state.config.adaptive_timeout;
    if !config.enabled {
        return state.config.request_timeout();
    }

    let (key_p95, key_samples) = state
        .keys
        .credential(key_index)
        .map(|c| {
            let profile = c.latency.profile();
            (profile.p95_ms, profile.count)
        })
        .unwrap_or((0, 0));
    let (model_p95, model_samples) = match (state.router.as_ref(), mapped_model) {
        (Some(router), Some(model)) => router.model_latency_p95(model),
        _ => (0, 0),
    };

    let base_ms = if key_samples.max(model_samples) < config.min_samples {
        config.initial_ms
    } else {
        let p95 = key_p95.max(model_p95);
        ((p95 as f64 * config.latency_multiplier) as u64).clamp(config.min_ms, config.max_ms)
    };
    let grown = (base_ms as f64 * config.retry_multiplier.powi(attempt as i32)) as u64;
    Duration::from_millis(grown.clamp(config.min_ms, config.max_ms))
}

/// Read an upstream error body (bounded) for evidence/logging.
async fn buffer_passthrough(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let end = bytes.len().min(2048);
            String::from_utf8_lossy(&bytes[..end]).to_string()
        }
        Err(_) => String::new(),
    }
}

// ── 429 handling ────────────────────────────────────────────────────────────

async fn handle_429(
    state: &AppState,
    request_id: &str,
    key_index: usize,
    mapped_model: Option<&str>,
    router_active: bool,
    response: reqwest::Response,
) -> AttemptOutcome {
    state.stats.upstream_429.fetch_add(1, Ordering::Relaxed);

    let retry_after_header = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let retry_after_ms = retry_after_header
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1000);
    let upstream_host = response.url().host_str().unwrap_or("").to_string();

    let mut safe_headers = serde_json::Map::new();
    for (name, value) in response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "x-request-id" || lower.starts_with("x-ratelimit-") {
            if let Ok(value) = value.to_str() {
                safe_headers.insert(lower, json!(value));
            }
        }
    }

    // 1. Pool-level hit, global and per-model.
    let hit = state.keys.record_pool_rate_limit_hit(
        mapped_model,
        retry_after_ms,
        state.config.pool_cooldown.cap_ms,
    );

    // 2. Per-key penalty, dampened while the whole pool is being throttled.
    if hit.pool_429_count > 1 {
        let dampened = state.keys.dampened_key_cooldown_ms(hit.cooldown_ms);
        state.keys.record_rate_limit(key_index, Some(dampened));
    } else {
        state.keys.record_rate_limit(key_index, retry_after_ms);
    }

    // 3. Per-model cooldown with burst dampening.
    if let (Some(router), Some(model)) = (state.router.as_ref(), mapped_model) {
        router.record_model_429(model, hit.cooldown_ms, hit.pool_429_count);
    }

    let account_scope = state.keys.account_level_429();
    let evidence = json!({
        "source": "upstream",
        "status": 429,
        "upstreamHost": upstream_host,
        "retryAfterHeader": retry_after_header,
        "retryAfterMs": retry_after_ms,
        // reqwest does not expose connection reuse; recorded for shape
        // compatibility with the evidence consumers.
        "reusedSocket": false,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "scope": if account_scope { "account" } else { "pool" },
        "safeHeaders": Value::Object(safe_headers),
    });

    // 4. Retry path. Streaming only starts on the terminal attempt, so the
    // client response has never begun here. Account scope without a router
    // means no model bucket to escape into: pass the 429 through.
    let retry_eligible = (!hit.was_already_blocked || router_active)
        && (!account_scope || router_active);
    if retry_eligible {
        tracing::warn!(
            request_id = %request_id,
            cooldown_ms = hit.cooldown_ms,
            pool_429_count = hit.pool_429_count,
            "upstream 429, retrying"
        );
        return AttemptOutcome::Failure(AttemptFailure {
            error_type: ErrorType::RateLimited,
            message: "upstream rate limited".to_string(),
            should_exclude_key: !router_active,
            dynamic_retry: Some(true),
            retry_after_ms: Some(hit.cooldown_ms),
            evidence: Some(evidence),
        });
    }

    tracing::warn!(
        request_id = %request_id,
        scope = if account_scope { "account" } else { "pool" },
        "upstream 429 passed through"
    );
    let status = response.status();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if !is_hop_by_hop(&lower) && lower != "content-length" {
            headers.insert(name.clone(), value.clone());
        }
    }
    let body = response.bytes().await.unwrap_or_default();
    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        headers_mut.extend(headers);
        if account_scope {
            headers_mut.insert(
                "x-rate-limit-scope",
                HeaderValue::from_static("account"),
            );
        }
    }
    AttemptOutcome::Passthrough(
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty())),
    )
}

// ── Streaming pass-through ──────────────────────────────────────────────────

/// Pipe the upstream body to the client, keeping a bounded tail to extract
/// the usage-bearing terminal event. The guards ride inside the stream so
/// every slot releases when the body finishes or the client goes away.
fn stream_response(
    state: &AppState,
    upstream: reqwest::Response,
    mapped_model: Option<String>,
    resources: AttemptResources,
    in_flight_guard: InFlightGuard,
) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower) || lower == "content-length" {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    let stats = state.stats.clone();
    let fallback_model = mapped_model.unwrap_or_default();

    let mut byte_stream = upstream.bytes_stream();
    let body_stream = async_stream::stream! {
        let _resources = resources;
        let _in_flight = in_flight_guard;
        let mut tail: Vec<u8> = Vec::new();

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    append_tail(&mut tail, &bytes);
                    yield Ok::<_, std::io::Error>(bytes);
                }
                Err(err) => {
                    tracing::warn!("upstream body stream error: {err}");
                    break;
                }
            }
        }

        if let Some(usage) = parse_usage_tail(&tail, &fallback_model) {
            stats.record_token_usage(&usage.model, usage.input_tokens, usage.output_tokens);
        }
    };

    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        headers_mut.extend(headers);
    }
    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn append_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    if tail.len() > TAIL_CAPTURE_BYTES {
        let excess = tail.len() - TAIL_CAPTURE_BYTES;
        tail.drain(..excess);
    }
}

struct UsageRecord {
    model: String,
    input_tokens: u64,
    output_tokens: u64,
}

/// Extract token usage from the captured tail: SSE terminal events for
/// streamed responses, a plain JSON body otherwise.
fn parse_usage_tail(tail: &[u8], fallback_model: &str) -> Option<UsageRecord> {
    if tail.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(tail);

    let mut model = fallback_model.to_string();
    let mut input_tokens: Option<u64> = None;
    let mut output_tokens: Option<u64> = None;

    for line in text.lines() {
        let Some(data) = line.trim().strip_prefix("data: ") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    if let Some(m) = message.get("model").and_then(Value::as_str) {
                        model = m.to_string();
                    }
                    if let Some(tokens) = message
                        .pointer("/usage/input_tokens")
                        .and_then(Value::as_u64)
                    {
                        input_tokens = Some(tokens);
                    }
                }
            }
            Some("message_delta") => {
                if let Some(tokens) = event
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    output_tokens = Some(tokens);
                }
            }
            _ => {}
        }
    }

    if input_tokens.is_none() && output_tokens.is_none() {
        // Non-streaming body: the tail may hold the complete JSON response.
        if let Ok(body) = serde_json::from_str::<Value>(text.trim()) {
            if let Some(m) = body.get("model").and_then(Value::as_str) {
                model = m.to_string();
            }
            input_tokens = body.pointer("/usage/input_tokens").and_then(Value::as_u64);
            output_tokens = body.pointer("/usage/output_tokens").and_then(Value::as_u64);
        }
    }

    if input_tokens.is_none() && output_tokens.is_none() {
        return None;
    }
    Some(UsageRecord {
        model,
        input_tokens: input_tokens.unwrap_or(0),
        output_tokens: output_tokens.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderConfig {
        ProviderConfig::anthropic_default()
    }

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn upstream_headers_strip_everything_sensitive() {
        let client = header_map(&[
            ("cookie", "session=abc"),
            ("x-admin-token", "root"),
            ("transfer-encoding", "chunked"),
            ("proxy-authorization", "Basic xyz"),
            ("upgrade", "h2c"),
            ("te", "trailers"),
            ("connection", "keep-alive, x-custom-hop"),
            ("x-custom-hop", "1"),
            ("x-proxy-foo", "bar"),
            ("x-api-key", "old"),
            ("authorization", "Bearer client-token"),
            ("content-type", "application/json"),
            ("anthropic-version", "2023-06-01"),
        ]);

        let headers = build_upstream_headers(&client, &provider(), "sk-real", "req-1");

        for stripped in [
            "cookie",
            "x-admin-token",
            "transfer-encoding",
            "proxy-authorization",
            "upgrade",
            "te",
            "x-custom-hop",
            "x-proxy-foo",
        ] {
            assert!(!headers.contains_key(stripped), "{stripped} must not leak");
        }
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-real");
        assert!(headers.get("authorization").is_none(), "client auth replaced, not forwarded");
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(headers.get("connection").unwrap(), "keep-alive");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn bearer_provider_uses_authorization() {
        let mut p = provider();
        p.auth_scheme = AuthScheme::Bearer;
        let headers = build_upstream_headers(&HeaderMap::new(), &p, "tok", "req-2");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert!(headers.get("x-api-key").is_none());
    }

    #[test]
    fn extra_headers_filtered_against_reserved() {
        let mut p = provider();
        p.extra_headers
            .insert("x-api-key".to_string(), "evil-override".to_string());
        p.extra_headers
            .insert("anthropic-beta".to_string(), "context-1m".to_string());
        let headers = build_upstream_headers(&HeaderMap::new(), &p, "sk-real", "req-3");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-real");
        assert_eq!(headers.get("anthropic-beta").unwrap(), "context-1m");
    }

    #[test]
    fn tail_capture_keeps_the_last_64k() {
        let mut tail = Vec::new();
        append_tail(&mut tail, &[b'a'; 60_000]);
        append_tail(&mut tail, &[b'b'; 10_000]);
        assert_eq!(tail.len(), TAIL_CAPTURE_BYTES);
        assert_eq!(tail[tail.len() - 1], b'b');
        assert_eq!(tail[0], b'a');
    }

    #[test]
    fn usage_parsed_from_sse_tail() {
        let tail = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":120}}}\n",
            "\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
            "\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n",
            "\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        let usage = parse_usage_tail(tail.as_bytes(), "fallback").unwrap();
        assert_eq!(usage.model, "claude-sonnet-4-5");
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 42);
    }

    #[test]
    fn usage_parsed_from_json_body() {
        let body = r#"{"id":"msg_1","model":"claude-haiku-4-5","usage":{"input_tokens":10,"output_tokens":5}}"#;
        let usage = parse_usage_tail(body.as_bytes(), "fallback").unwrap();
        assert_eq!(usage.model, "claude-haiku-4-5");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn no_usage_in_tail_returns_none() {
        assert!(parse_usage_tail(b"", "m").is_none());
        assert!(parse_usage_tail(b"not json at all", "m").is_none());
    }

    #[test]
    fn backoff_respects_cap_and_multiplier() {
        let retry = crate::config::RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_percent: 0.0,
        };
        assert_eq!(backoff_delay_ms(&retry, 1, 1.0), 100);
        assert_eq!(backoff_delay_ms(&retry, 2, 1.0), 200);
        assert_eq!(backoff_delay_ms(&retry, 3, 1.0), 400);
        assert_eq!(backoff_delay_ms(&retry, 3, 2.0), 800);
        assert_eq!(backoff_delay_ms(&retry, 10, 2.0), 1_000, "capped");
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let retry = crate::config::RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 1.0,
            jitter_percent: 0.2,
        };
        for _ in 0..100 {
            let delay = backoff_delay_ms(&retry, 1, 1.0);
            assert!((800..=1_200).contains(&delay), "delay {delay} out of jitter bounds");
        }
    }

    #[test]
    fn tier_parse_accepts_known_names_only() {
        assert_eq!(parse_tier("heavy"), Some(Tier::Heavy));
        assert_eq!(parse_tier("LIGHT"), Some(Tier::Light));
        assert_eq!(parse_tier("coordinator"), None);
    }
}
