// keymux — request traces
//
// One trace per client request: wall-clock bounds, one sub-record per
// attempt with spans, final outcome. The store is LRU-bounded; routing
// trace payloads are truncated to the configured byte budget while keeping
// the fields debugging cannot live without.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

// ── Span records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    KeyAcquired,
    UpstreamStart,
    FirstByte,
    Streaming,
    Complete,
    Retry,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub kind: SpanKind,
    /// Offset from request start.
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptTrace {
    pub attempt: u32,
    pub credential_id: String,
    /// Why this credential was chosen.
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub spans: Vec<SpanRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    pub request_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_hold_ms: Option<u64>,
    pub attempts: Vec<AttemptTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl RequestTrace {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            admission_hold_ms: None,
            attempts: Vec::new(),
            outcome: None,
            status: None,
            started: Some(Instant::now()),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn begin_attempt(&mut self, attempt: u32, credential_id: &str, reason: &str) {
        self.attempts.push(AttemptTrace {
            attempt,
            credential_id: credential_id.to_string(),
            reason: reason.to_string(),
            model: None,
            spans: Vec::new(),
        });
    }

    pub fn span(&mut self, kind: SpanKind, detail: Option<String>) {
        let at_ms = self.elapsed_ms();
        if let Some(current) = self.attempts.last_mut() {
            current.spans.push(SpanRecord { kind, at_ms, detail });
        }
    }

    pub fn set_model(&mut self, model: &str) {
        if let Some(current) = self.attempts.last_mut() {
            current.model = Some(model.to_string());
        }
    }

    pub fn finish(&mut self, outcome: &str, status: u16) {
        self.ended_at = Some(chrono::Utc::now());
        self.outcome = Some(outcome.to_string());
        self.status = Some(status);
    }
}

// ── LRU-bounded store ───────────────────────────────────────────────────────

pub struct TraceStore {
    inner: Mutex<TraceStoreInner>,
    capacity: usize,
}

struct TraceStoreInner {
    traces: HashMap<String, RequestTrace>,
    order: VecDeque<String>,
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TraceStoreInner {
                traces: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, trace: RequestTrace) {
        let mut inner = self.inner.lock().expect("trace store lock");
        let id = trace.request_id.clone();
        if inner.traces.insert(id.clone(), trace).is_none() {
            inner.order.push_back(id);
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.traces.remove(&evicted);
            }
        }
    }

    pub fn get(&self, request_id: &str) -> Option<RequestTrace> {
        self.inner
            .lock()
            .expect("trace store lock")
            .traces
            .get(request_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("trace store lock").traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Routing trace payload truncation ────────────────────────────────────────

const MAX_TRACE_MESSAGES: usize = 10;
const MAX_TRACE_CANDIDATES: usize = 5;
const CONTENT_TRUNCATE_CHARS: usize = 2_000;
const CONTENT_TRUNCATE_HARD_CHARS: usize = 200;

/// Shrink an oversize routing trace payload in place: messages capped at 10,
/// candidates at 5, message content truncated with an `…` suffix. Truncation
/// only shortens strings and trims arrays, never deletes keys, so
/// `requestId`, `timestamp`, `classification.tier`,
/// `classification.thresholdComparison`, `modelSelection.selected` and
/// `modelSelection.strategy` always survive. Runs a second, harder content
/// pass if the first one was not enough.
pub fn truncate_trace_payload(payload: &mut Value, max_bytes: usize) {
    if payload_size(payload) <= max_bytes {
        return;
    }

    limit_array(payload, "messages", MAX_TRACE_MESSAGES);
    if let Some(selection) = payload.get_mut("modelSelection") {
        limit_array(selection, "candidates", MAX_TRACE_CANDIDATES);
    }
    truncate_message_content(payload, CONTENT_TRUNCATE_CHARS);

    if payload_size(payload) > max_bytes {
        truncate_message_content(payload, CONTENT_TRUNCATE_HARD_CHARS);
    }
}

fn payload_size(payload: &Value) -> usize {
    serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0)
}

fn limit_array(container: &mut Value, key: &str, max: usize) {
    if let Some(arr) = container.get_mut(key).and_then(Value::as_array_mut) {
        if arr.len() > max {
            arr.truncate(max);
        }
    }
}

fn truncate_message_content(payload: &mut Value, max_chars: usize) {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    for message in messages {
        if let Some(Value::String(content)) = message.get_mut("content") {
            if content.chars().count() > max_chars {
                let truncated: String = content.chars().take(max_chars).collect();
                *content = format!("{truncated}…");
            }
        }
    }
}
