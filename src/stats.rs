// keymux — stats registry and event bus
//
// Plain atomic counters behind one Arc. The proxy core increments; sinks
// (the /metrics endpoint, tests) read. Event emission is fire-and-forget
// over a broadcast channel so a slow subscriber can never stall a request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::Tier;

// ── Routing decision source ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Rule,
    Classifier,
    Override,
    Pool,
    None,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Rule => "rule",
            DecisionSource::Classifier => "classifier",
            DecisionSource::Override => "override",
            DecisionSource::Pool => "pool",
            DecisionSource::None => "none",
        }
    }
}

// ── Counters ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RouterStats {
    pub total: AtomicU64,
    pub by_tier_light: AtomicU64,
    pub by_tier_medium: AtomicU64,
    pub by_tier_heavy: AtomicU64,
    pub by_source_rule: AtomicU64,
    pub by_source_classifier: AtomicU64,
    pub by_source_override: AtomicU64,
    pub by_source_pool: AtomicU64,
    pub by_source_none: AtomicU64,
    pub by_fallback_reason: Mutex<HashMap<&'static str, u64>>,
    pub trace_sampled: AtomicU64,
    /// Selections that fell back to the configured default model.
    pub default_model_fallbacks: AtomicU64,
    pub tier_downgrade_shadow: AtomicU64,
    pub shadow_decisions: AtomicU64,
    pub drift_events: AtomicU64,
    pub context_overflow_genuine: AtomicU64,
    pub context_overflow_transient: AtomicU64,
}

impl RouterStats {
    pub fn bump_tier(&self, tier: Tier) {
        match tier {
            Tier::Light => &self.by_tier_light,
            Tier::Medium => &self.by_tier_medium,
            Tier::Heavy => &self.by_tier_heavy,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_source(&self, source: DecisionSource) {
        match source {
            DecisionSource::Rule => &self.by_source_rule,
            DecisionSource::Classifier => &self.by_source_classifier,
            DecisionSource::Override => &self.by_source_override,
            DecisionSource::Pool => &self.by_source_pool,
            DecisionSource::None => &self.by_source_none,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_fallback_reason(&self, reason: &'static str) {
        let mut map = self.by_fallback_reason.lock().expect("fallback reason lock");
        *map.entry(reason).or_insert(0) += 1;
    }

    /// Flat snapshot used by the purity tests and the status endpoint.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut out = HashMap::new();
        out.insert("total".into(), self.total.load(Ordering::Relaxed));
        out.insert("by_tier_light".into(), self.by_tier_light.load(Ordering::Relaxed));
        out.insert("by_tier_medium".into(), self.by_tier_medium.load(Ordering::Relaxed));
        out.insert("by_tier_heavy".into(), self.by_tier_heavy.load(Ordering::Relaxed));
        out.insert("by_source_rule".into(), self.by_source_rule.load(Ordering::Relaxed));
        out.insert(
            "by_source_classifier".into(),
            self.by_source_classifier.load(Ordering::Relaxed),
        );
        out.insert(
            "by_source_override".into(),
            self.by_source_override.load(Ordering::Relaxed),
        );
        out.insert("by_source_pool".into(), self.by_source_pool.load(Ordering::Relaxed));
        out.insert("by_source_none".into(), self.by_source_none.load(Ordering::Relaxed));
        out.insert("trace_sampled".into(), self.trace_sampled.load(Ordering::Relaxed));
        out.insert(
            "default_model_fallbacks".into(),
            self.default_model_fallbacks.load(Ordering::Relaxed),
        );
        out.insert(
            "tier_downgrade_shadow".into(),
            self.tier_downgrade_shadow.load(Ordering::Relaxed),
        );
        out.insert(
            "shadow_decisions".into(),
            self.shadow_decisions.load(Ordering::Relaxed),
        );
        out.insert("drift_events".into(), self.drift_events.load(Ordering::Relaxed));
        out.insert(
            "context_overflow_genuine".into(),
            self.context_overflow_genuine.load(Ordering::Relaxed),
        );
        out.insert(
            "context_overflow_transient".into(),
            self.context_overflow_transient.load(Ordering::Relaxed),
        );
        for (reason, count) in self.by_fallback_reason.lock().expect("fallback reason lock").iter() {
            out.insert(format!("fallback_{reason}"), *count);
        }
        out
    }
}

#[derive(Default)]
pub struct ProxyStats {
    pub requests_total: AtomicU64,
    pub client_request_success: AtomicU64,
    pub client_request_failure: AtomicU64,
    pub retry_success: AtomicU64,
    pub upstream_429: AtomicU64,
    pub upstream_5xx: AtomicU64,
    pub backpressure_rejections: AtomicU64,
    pub queue_full_rejections: AtomicU64,
    pub queue_timeouts: AtomicU64,
    pub admission_holds: AtomicU64,
    pub admission_hold_success: AtomicU64,
    pub admission_hold_timeout: AtomicU64,
    pub connection_pool_rebuilds: AtomicU64,
    /// Shared with the router, which bumps the compute/commit counters.
    pub router: Arc<RouterStats>,
    /// model id -> (input tokens, output tokens), from terminal usage events.
    token_usage: Mutex<HashMap<String, (u64, u64)>>,
}

impl ProxyStats {
    pub fn record_token_usage(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let mut usage = self.token_usage.lock().expect("token usage lock");
        let entry = usage.entry(model.to_string()).or_insert((0, 0));
        entry.0 += input_tokens;
        entry.1 += output_tokens;
    }

    pub fn token_usage(&self) -> HashMap<String, (u64, u64)> {
        self.token_usage.lock().expect("token usage lock").clone()
    }

    /// Prometheus text exposition, same hand-rolled format as the metrics
    /// endpoint this was modeled on.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let mut gauge = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        gauge(
            "keymux_requests_total",
            "Client requests admitted",
            self.requests_total.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_request_success_total",
            "Client requests completed successfully",
            self.client_request_success.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_request_failure_total",
            "Client requests that exhausted all attempts",
            self.client_request_failure.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_retry_success_total",
            "Requests that succeeded after at least one retry",
            self.retry_success.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_upstream_429_total",
            "Upstream 429 responses observed",
            self.upstream_429.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_upstream_5xx_total",
            "Upstream 5xx responses observed",
            self.upstream_5xx.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_backpressure_rejections_total",
            "Requests rejected at the global in-flight cap",
            self.backpressure_rejections.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_queue_full_total",
            "Requests rejected because the waiter queue was full",
            self.queue_full_rejections.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_queue_timeout_total",
            "Waiters that timed out in the queue",
            self.queue_timeouts.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_admission_holds_total",
            "Requests held while all tier models were cooling",
            self.admission_holds.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_pool_rebuilds_total",
            "Connection pool rebuilds triggered by hangup storms",
            self.connection_pool_rebuilds.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_routing_decisions_total",
            "Committed routing decisions",
            self.router.total.load(Ordering::Relaxed),
        );
        gauge(
            "keymux_routing_drift_events_total",
            "Router/pool availability disagreements",
            self.router.drift_events.load(Ordering::Relaxed),
        );
        out
    }
}

// ── Event bus ───────────────────────────────────────────────────────────────

/// Request-stream events emitted by the core; sinks subscribe.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    RequestStarted {
        request_id: String,
    },
    AttemptStarted {
        request_id: String,
        attempt: u32,
        credential_id: String,
        model: Option<String>,
    },
    UpstreamStatus {
        request_id: String,
        attempt: u32,
        status: u16,
    },
    ContextOverflow {
        request_id: String,
        cause: String,
        estimated_tokens: u64,
    },
    RetryScheduled {
        request_id: String,
        attempt: u32,
        error_type: String,
        delay_ms: u64,
    },
    RequestCompleted {
        request_id: String,
        status: u16,
        attempts: u32,
        duration_ms: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Lossy by design: no subscribers (or lagging ones) never block a
    /// request.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_accumulates_per_model() {
        let stats = ProxyStats::default();
        stats.record_token_usage("claude-sonnet-4-5", 100, 20);
        stats.record_token_usage("claude-sonnet-4-5", 50, 10);
        stats.record_token_usage("claude-haiku-4-5", 7, 3);

        let usage = stats.token_usage();
        assert_eq!(usage["claude-sonnet-4-5"], (150, 30));
        assert_eq!(usage["claude-haiku-4-5"], (7, 3));
    }

    #[test]
    fn prometheus_rendering_includes_counters() {
        let stats = ProxyStats::default();
        stats.requests_total.fetch_add(2, Ordering::Relaxed);
        stats.upstream_429.fetch_add(1, Ordering::Relaxed);

        let text = stats.render_prometheus();
        assert!(text.contains("keymux_requests_total 2"));
        assert!(text.contains("keymux_upstream_429_total 1"));
        assert!(text.contains("# TYPE keymux_requests_total counter"));
    }

    #[tokio::test]
    async fn event_bus_is_lossy_without_subscribers() {
        let bus = EventBus::default();
        // No subscribers — emit must not error or block.
        bus.emit(ProxyEvent::RequestStarted {
            request_id: "req-1".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(ProxyEvent::RequestCompleted {
            request_id: "req-1".into(),
            status: 200,
            attempts: 1,
            duration_ms: 12,
        });
        match rx.recv().await.unwrap() {
            ProxyEvent::RequestCompleted { status, .. } => assert_eq!(status, 200),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn router_snapshot_covers_sources_and_tiers() {
        let stats = RouterStats::default();
        stats.bump_tier(Tier::Heavy);
        stats.bump_source(DecisionSource::Classifier);
        stats.bump_fallback_reason("all_models_cooling");

        let snap = stats.snapshot();
        assert_eq!(snap["by_tier_heavy"], 1);
        assert_eq!(snap["by_source_classifier"], 1);
        assert_eq!(snap["fallback_all_models_cooling"], 1);
    }
}
