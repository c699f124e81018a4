// keymux — model router
//
// Classifies each request body into a tier, then selects a model from the
// tier's pool under the configured strategy. Decisions are two-phase:
// `compute_decision` reads router state but never touches in-flight counters
// or routing stats; `commit_decision` acquires the model slot and bumps the
// stats exactly once. `explain` rides the same compute path in dry-run mode
// so repeated calls are stat-neutral.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::config::{
    ModelCooldownConfig, ModelRoutingConfig, RouteRule, Strategy, Thresholds, Tier,
};
use crate::keypool::KeySnapshot;
use crate::latency::LatencyWindow;
use crate::stats::{DecisionSource, RouterStats};

/// Read-only view of the credential pool, used by the drift detector. The
/// router never holds the pool itself.
pub trait PoolView: Send + Sync {
    fn key_snapshots(&self) -> Vec<KeySnapshot>;
}

// ── Request profile ─────────────────────────────────────────────────────────

/// Everything the classifier needs, extracted once from the client body.
#[derive(Debug, Clone, Default)]
pub struct RequestProfile {
    pub model: Option<String>,
    pub max_tokens: u64,
    pub message_count: usize,
    pub system_length: usize,
    pub has_tools: bool,
    pub has_vision: bool,
    pub estimated_tokens: u64,
}

/// Rough chars/4 heuristic plus a fixed per-message overhead; good enough
/// for overflow detection, not for billing.
const CHARS_PER_TOKEN: u64 = 4;
const PER_MESSAGE_OVERHEAD_TOKENS: u64 = 24;

impl RequestProfile {
    pub fn from_body(body: &Value) -> Self {
        let model = body.get("model").and_then(Value::as_str).map(str::to_string);
        let max_tokens = body.get("max_tokens").and_then(Value::as_u64).unwrap_or(0);

        let system_length = match body.get("system") {
            Some(Value::String(s)) => s.len(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(str::len)
                .sum(),
            _ => 0,
        };

        let messages = body.get("messages").and_then(Value::as_array);
        let message_count = messages.map(Vec::len).unwrap_or(0);

        let mut content_chars = system_length as u64;
        let mut has_vision = false;
        if let Some(messages) = messages {
            for message in messages {
                match message.get("content") {
                    Some(Value::String(s)) => content_chars += s.len() as u64,
                    Some(Value::Array(blocks)) => {
                        for block in blocks {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                content_chars += text.len() as u64;
                            }
                            if block.get("type").and_then(Value::as_str) == Some("image") {
                                has_vision = true;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let has_tools = body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty());

        let estimated_tokens = content_chars / CHARS_PER_TOKEN
            + message_count as u64 * PER_MESSAGE_OVERHEAD_TOKENS
            + max_tokens;

        Self {
            model,
            max_tokens,
            message_count,
            system_length,
            has_tools,
            has_vision,
            estimated_tokens,
        }
    }
}

// ── Routing context & decision ──────────────────────────────────────────────

pub struct RoutingContext<'a> {
    pub request_id: &'a str,
    pub profile: &'a RequestProfile,
    pub attempted_models: &'a HashSet<String>,
    /// Client-forced tier (`x-proxy-tier`), decision source `override`.
    pub tier_override: Option<Tier>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedModel {
    pub id: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub model: String,
    pub position: usize,
    pub score: f64,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub available: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowCause {
    Genuine,
    TransientUnavailable,
}

impl OverflowCause {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowCause::Genuine => "genuine",
            OverflowCause::TransientUnavailable => "transient_unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverflowDiagnostic {
    pub estimated_tokens: u64,
    pub model_context_length: u64,
    pub overflow_by: u64,
    pub cause: OverflowCause,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<SelectedModel>,
    pub tier: Tier,
    pub strategy: Strategy,
    pub source: DecisionSource,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring: Option<Vec<CandidateScore>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overflow: Option<OverflowDiagnostic>,
    // Decision-shape facts recorded by compute; counted by commit so that
    // compute stays pure and each decision is counted at most once.
    #[serde(skip)]
    trace_sampled: bool,
    #[serde(skip)]
    downgrade_shadowed: bool,
    #[serde(skip)]
    used_default_model: bool,
    #[serde(skip)]
    committed: bool,
}

impl RoutingDecision {
    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

/// Compute runs either for real (counters that belong to the compute phase
/// may move) or as a dry run (`explain`, shadow scoring), which is fully
/// stat-neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionMode {
    Live,
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainReport {
    pub selected_model: Option<String>,
    pub tier: Tier,
    pub strategy: Strategy,
    pub source: DecisionSource,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring: Option<Vec<CandidateScore>>,
}

// ── Per-model live state ────────────────────────────────────────────────────

struct ModelState {
    id: String,
    provider: String,
    max_concurrency: usize,
    context_length: Option<u64>,
    cost_per_mtok: Option<f64>,
    in_flight: AtomicUsize,
    cooldown_until: Mutex<Option<Instant>>,
    hits: Mutex<VecDeque<Instant>>,
    latency: LatencyWindow,
}

impl ModelState {
    fn cooldown_remaining(&self) -> Duration {
        match *self.cooldown_until.lock().expect("model cooldown lock") {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    fn available_capacity(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.in_flight.load(Ordering::Acquire))
    }
}

/// Read view of one model's pool state, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub id: String,
    pub provider: String,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub cooldown_remaining_ms: u64,
    pub recent_429s: usize,
}

struct CompiledRule {
    glob: Option<glob::Pattern>,
    rule: RouteRule,
}

// ── The router ──────────────────────────────────────────────────────────────

pub struct ModelRouter {
    config: ModelRoutingConfig,
    rules: Vec<CompiledRule>,
    models: HashMap<String, ModelState>,
    /// Round-robin cursor per tier for the `pool` strategy; advanced only by
    /// commit so compute stays pure.
    pool_cursors: HashMap<Tier, AtomicUsize>,
    stats: Arc<RouterStats>,
    pool_view: Option<Arc<dyn PoolView>>,
    last_shadow_decision: Mutex<Option<RoutingDecision>>,
    default_provider: String,
}

impl ModelRouter {
    pub fn new(
        config: ModelRoutingConfig,
        stats: Arc<RouterStats>,
        default_provider: &str,
    ) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| CompiledRule {
                // Validated at load time; an invalid pattern here would have
                // aborted startup.
                glob: rule
                    .matcher
                    .model
                    .as_deref()
                    .and_then(|g| glob::Pattern::new(g).ok()),
                rule: rule.clone(),
            })
            .collect();

        let mut models = HashMap::new();
        let mut pool_cursors = HashMap::new();
        for (tier, tc) in &config.tiers {
            pool_cursors.insert(*tier, AtomicUsize::new(0));
            for mc in &tc.models {
                models
                    .entry(mc.id.clone())
                    .or_insert_with(|| ModelState {
                        id: mc.id.clone(),
                        provider: mc
                            .provider
                            .clone()
                            .unwrap_or_else(|| default_provider.to_string()),
                        max_concurrency: mc.max_concurrency,
                        context_length: mc.context_length,
                        cost_per_mtok: mc.cost_per_mtok,
                        in_flight: AtomicUsize::new(0),
                        cooldown_until: Mutex::new(None),
                        hits: Mutex::new(VecDeque::new()),
                        latency: LatencyWindow::default(),
                    });
            }
        }

        Self {
            config,
            rules,
            models,
            pool_cursors,
            stats,
            pool_view: None,
            last_shadow_decision: Mutex::new(None),
            default_provider: default_provider.to_string(),
        }
    }

    pub fn set_pool_view(&mut self, view: Arc<dyn PoolView>) {
        self.pool_view = Some(view);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_shadow(&self) -> bool {
        self.config.shadow_mode
    }

    pub fn config(&self) -> &ModelRoutingConfig {
        &self.config
    }

    // ── Classification ──────────────────────────────────────────────────

    fn classify(&self, ctx: &RoutingContext<'_>) -> (Tier, DecisionSource) {
        if let Some(tier) = ctx.tier_override {
            return (tier, DecisionSource::Override);
        }
        for compiled in &self.rules {
            if self.rule_matches(compiled, ctx.profile) {
                return (compiled.rule.tier, DecisionSource::Rule);
            }
        }
        (self.classify_by_thresholds(ctx.profile), DecisionSource::Classifier)
    }

    fn rule_matches(&self, compiled: &CompiledRule, profile: &RequestProfile) -> bool {
        let m = &compiled.rule.matcher;
        if let Some(glob) = &compiled.glob {
            match &profile.model {
                Some(model) if glob.matches(model) => {}
                _ => return false,
            }
        }
        if let Some(min) = m.max_tokens_gte {
            if profile.max_tokens < min {
                return false;
            }
        }
        if let Some(min) = m.message_count_gte {
            if profile.message_count < min {
                return false;
            }
        }
        if let Some(wanted) = m.has_tools {
            if profile.has_tools != wanted {
                return false;
            }
        }
        if let Some(wanted) = m.has_vision {
            if profile.has_vision != wanted {
                return false;
            }
        }
        true
    }

    fn classify_by_thresholds(&self, profile: &RequestProfile) -> Tier {
        let heavy = &self.config.classifier.heavy_thresholds;
        let light = &self.config.classifier.light_thresholds;
        if exceeds(profile, heavy) {
            Tier::Heavy
        } else if within(profile, light) {
            Tier::Light
        } else {
            Tier::Medium
        }
    }

    // ── Compute / commit ────────────────────────────────────────────────

    /// Pure read of router state: cooldowns, in-flight counts and scoring
    /// may be consulted, but neither slots nor routing stats move here —
    /// repeated calls on the same context leave every counter untouched.
    /// Decision-shape facts (sampling, fallbacks, shadow downgrades) are
    /// recorded on the returned decision and counted by `commit_decision`.
    pub fn compute_decision(&self, ctx: &RoutingContext<'_>) -> RoutingDecision {
        self.compute_inner(ctx, DecisionMode::Live)
    }

    fn compute_inner(&self, ctx: &RoutingContext<'_>, mode: DecisionMode) -> RoutingDecision {
        let (tier, source) = self.classify(ctx);
        let Some(tier_config) = self.config.tier(tier) else {
            return self.no_candidate(
                tier,
                Strategy::Quality,
                source,
                "tier not configured",
                Some("tier_not_configured"),
                false,
            );
        };
        let strategy = tier_config.strategy;

        // The dry-run path always carries the scoring table; the live path
        // draws the sampling dice. The draw itself is stat-free — the
        // counter moves at commit.
        let sampled = mode == DecisionMode::Live
            && rand::random::<f64>() < self.config.trace.sampling_rate;
        let include_scoring = mode == DecisionMode::DryRun || sampled;

        match self.select_from_tier(ctx, tier, strategy, include_scoring) {
            Selection::Selected { model, scoring, reason } => RoutingDecision {
                model: Some(model),
                tier,
                strategy,
                source,
                reason,
                fallback_reason: None,
                scoring,
                overflow: None,
                trace_sampled: sampled,
                downgrade_shadowed: false,
                used_default_model: false,
                committed: false,
            },
            Selection::Overflow(diagnostic) => RoutingDecision {
                model: None,
                tier,
                strategy,
                source,
                reason: format!(
                    "context overflow: ~{} tokens vs {} context",
                    diagnostic.estimated_tokens, diagnostic.model_context_length
                ),
                fallback_reason: None,
                scoring: None,
                overflow: Some(diagnostic),
                trace_sampled: sampled,
                downgrade_shadowed: false,
                used_default_model: false,
                committed: false,
            },
            Selection::Exhausted => {
                // Tier exhausted. Try the downgrade path, then the default
                // model, then give up.
                let mut downgrade_shadowed = false;
                if let Some(lower) = tier.downgrade() {
                    if self.config.tiers.contains_key(&lower) {
                        if self.config.failover.allow_tier_downgrade {
                            if let Selection::Selected { model, scoring, reason } = self
                                .select_from_tier(
                                    ctx,
                                    lower,
                                    self.config.tiers[&lower].strategy,
                                    include_scoring,
                                )
                            {
                                return RoutingDecision {
                                    model: Some(model),
                                    tier: lower,
                                    strategy: self.config.tiers[&lower].strategy,
                                    source,
                                    reason: format!("downgraded from {tier}: {reason}"),
                                    fallback_reason: Some("tier_downgrade"),
                                    scoring,
                                    overflow: None,
                                    trace_sampled: sampled,
                                    downgrade_shadowed: false,
                                    used_default_model: false,
                                    committed: false,
                                };
                            }
                        } else {
                            // A downgrade would have been possible; the
                            // decision carries that fact for shadow counting.
                            downgrade_shadowed = true;
                        }
                    }
                }

                if let Some(default_model) = self.config.default_model.clone() {
                    if !ctx.attempted_models.contains(&default_model) {
                        let provider = self
                            .models
                            .get(&default_model)
                            .map(|m| m.provider.clone())
                            .unwrap_or_else(|| self.default_provider.clone());
                        return RoutingDecision {
                            model: Some(SelectedModel { id: default_model, provider }),
                            tier,
                            strategy,
                            source,
                            reason: "tier exhausted, using default model".to_string(),
                            fallback_reason: Some("default_model"),
                            scoring: None,
                            overflow: None,
                            trace_sampled: sampled,
                            downgrade_shadowed,
                            used_default_model: true,
                            committed: false,
                        };
                    }
                }

                self.no_candidate(
                    tier,
                    strategy,
                    source,
                    "all tier models attempted, cooling or at capacity",
                    Some("tier_exhausted"),
                    downgrade_shadowed,
                )
            }
        }
    }

    /// Acquire the model slot and count the decision — all stat mutation
    /// for a decision happens here, including the decision-shape counters
    /// compute recorded as facts. Idempotent: a decision commits at most
    /// once no matter how often this is called.
    pub fn commit_decision(&self, decision: &mut RoutingDecision) {
        if decision.committed {
            return;
        }
        decision.committed = true;

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.stats.bump_tier(decision.tier);
        self.stats.bump_source(decision.source);
        if decision.trace_sampled {
            self.stats.trace_sampled.fetch_add(1, Ordering::Relaxed);
        }
        if decision.downgrade_shadowed {
            self.stats.tier_downgrade_shadow.fetch_add(1, Ordering::Relaxed);
        }
        if decision.used_default_model {
            self.stats
                .default_model_fallbacks
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(reason) = decision.fallback_reason {
            self.stats.bump_fallback_reason(reason);
        }

        if let Some(selected) = &decision.model {
            if let Some(state) = self.models.get(&selected.id) {
                state.in_flight.fetch_add(1, Ordering::AcqRel);
            }
            if decision.strategy == Strategy::Pool {
                if let Some(cursor) = self.pool_cursors.get(&decision.tier) {
                    cursor.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Release the slot a committed decision holds. No-op for uncommitted
    /// decisions and decisions without a model.
    pub fn release_decision(&self, decision: &RoutingDecision) {
        if !decision.committed {
            return;
        }
        if let Some(selected) = &decision.model {
            if let Some(state) = self.models.get(&selected.id) {
                let prev = state.in_flight.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "model release without matching commit");
            }
        }
    }

    /// Dry-run compute plus drift-free reporting; repeated calls leave every
    /// router stat untouched.
    pub fn explain(&self, ctx: &RoutingContext<'_>, include_trace: bool) -> ExplainReport {
        let decision = self.compute_inner(ctx, DecisionMode::DryRun);
        ExplainReport {
            selected_model: decision.model.as_ref().map(|m| m.id.clone()),
            tier: decision.tier,
            strategy: decision.strategy,
            source: decision.source,
            reason: decision.reason,
            scoring: if include_trace { decision.scoring } else { None },
        }
    }

    /// Full selection entry point. Shadow mode stores the decision and
    /// returns None; non-shadow runs the drift check before returning.
    pub fn select_model(&self, ctx: &RoutingContext<'_>) -> Option<RoutingDecision> {
        if self.config.shadow_mode {
            let decision = self.compute_inner(ctx, DecisionMode::DryRun);
            self.stats.shadow_decisions.fetch_add(1, Ordering::Relaxed);
            *self
                .last_shadow_decision
                .lock()
                .expect("shadow decision lock") = Some(decision);
            return None;
        }

        let decision = self.compute_decision(ctx);
        self.check_drift(&decision);
        Some(decision)
    }

    pub fn last_shadow_decision(&self) -> Option<RoutingDecision> {
        self.last_shadow_decision
            .lock()
            .expect("shadow decision lock")
            .clone()
    }

    /// Router thinks the model is available — does the credential pool agree
    /// that its provider has an available key? Disagreement is drift.
    fn check_drift(&self, decision: &RoutingDecision) {
        let Some(selected) = &decision.model else {
            return;
        };
        let Some(view) = &self.pool_view else {
            return;
        };
        let snapshots = view.key_snapshots();
        let provider_has_key = snapshots
            .iter()
            .any(|k| k.provider == selected.provider && k.available);
        if !provider_has_key {
            self.stats.drift_events.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                model = %selected.id,
                provider = %selected.provider,
                "router drift: model selected but pool reports no available key"
            );
        }
    }

    // ── Selection internals ─────────────────────────────────────────────

    fn no_candidate(
        &self,
        tier: Tier,
        strategy: Strategy,
        _source: DecisionSource,
        reason: &str,
        fallback_reason: Option<&'static str>,
        downgrade_shadowed: bool,
    ) -> RoutingDecision {
        RoutingDecision {
            model: None,
            tier,
            strategy,
            source: DecisionSource::None,
            reason: reason.to_string(),
            fallback_reason,
            scoring: None,
            overflow: None,
            trace_sampled: false,
            downgrade_shadowed,
            used_default_model: false,
            committed: false,
        }
    }

    fn select_from_tier(
        &self,
        ctx: &RoutingContext<'_>,
        tier: Tier,
        strategy: Strategy,
        include_scoring: bool,
    ) -> Selection {
        let Some(tier_config) = self.config.tier(tier) else {
            return Selection::Exhausted;
        };
        let ordered: Vec<&ModelState> = tier_config
            .models
            .iter()
            .filter_map(|mc| self.models.get(&mc.id))
            .collect();
        if ordered.is_empty() {
            return Selection::Exhausted;
        }

        // Context fit first: a body no tier model can hold is an overflow,
        // not an exhaustion.
        let estimated = ctx.profile.estimated_tokens;
        let fits: Vec<bool> = ordered
            .iter()
            .map(|m| m.context_length.is_none_or(|ctx_len| estimated <= ctx_len))
            .collect();
        if fits.iter().all(|fit| !fit) {
            let largest = ordered
                .iter()
                .filter_map(|m| m.context_length)
                .max()
                .unwrap_or(0);
            return Selection::Overflow(OverflowDiagnostic {
                estimated_tokens: estimated,
                model_context_length: largest,
                overflow_by: estimated.saturating_sub(largest),
                cause: OverflowCause::Genuine,
            });
        }

        let eligible = |m: &ModelState, fit: bool| {
            fit && !ctx.attempted_models.contains(&m.id)
                && m.cooldown_remaining() == Duration::ZERO
                && m.available_capacity() > 0
        };
        let any_eligible = ordered
            .iter()
            .zip(&fits)
            .any(|(m, fit)| eligible(m, *fit));

        if !any_eligible {
            // Fitting models exist but none are usable right now. If the
            // only blockers are transient (cooldown/capacity, not
            // "attempted"), report a transient overflow when the body also
            // exceeds every *currently usable* model.
            let transient_fit_blocked = ordered.iter().zip(&fits).any(|(m, fit)| {
                *fit && !ctx.attempted_models.contains(&m.id)
            });
            let usable_without_fit = ordered.iter().zip(&fits).any(|(m, fit)| {
                !*fit
                    && !ctx.attempted_models.contains(&m.id)
                    && m.cooldown_remaining() == Duration::ZERO
                    && m.available_capacity() > 0
            });
            if transient_fit_blocked && usable_without_fit {
                let largest_usable = ordered
                    .iter()
                    .zip(&fits)
                    .filter(|(_, fit)| !**fit)
                    .filter_map(|(m, _)| m.context_length)
                    .max()
                    .unwrap_or(0);
                return Selection::Overflow(OverflowDiagnostic {
                    estimated_tokens: estimated,
                    model_context_length: largest_usable,
                    overflow_by: estimated.saturating_sub(largest_usable),
                    cause: OverflowCause::TransientUnavailable,
                });
            }
            return Selection::Exhausted;
        }

        let chosen = match strategy {
            Strategy::Quality => ordered
                .iter()
                .zip(&fits)
                .position(|(m, fit)| eligible(m, *fit)),
            Strategy::Throughput => ordered
                .iter()
                .zip(&fits)
                .enumerate()
                .filter(|(_, (m, fit))| eligible(m, **fit))
                .max_by(|(_, (a, _)), (_, (b, _))| {
                    a.available_capacity()
                        .cmp(&b.available_capacity())
                        // Lower cost wins: reversed, missing cost loses.
                        .then_with(|| {
                            cost_rank(b.cost_per_mtok).partial_cmp(&cost_rank(a.cost_per_mtok))
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .then_with(|| a.max_concurrency.cmp(&b.max_concurrency))
                        // Lexicographically smaller id wins the final tie.
                        .then_with(|| b.id.cmp(&a.id))
                })
                .map(|(index, _)| index),
            Strategy::Balanced => {
                let len = ordered.len();
                ordered
                    .iter()
                    .zip(&fits)
                    .enumerate()
                    .filter(|(_, (m, fit))| eligible(m, **fit))
                    .map(|(index, (m, _))| (index, balanced_score(index, len, m)))
                    .max_by(|(ia, sa), (ib, sb)| {
                        sa.partial_cmp(sb)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            // Earlier position, then smaller id: deterministic.
                            .then_with(|| ib.cmp(ia))
                    })
                    .map(|(index, _)| index)
            }
            Strategy::Pool => {
                let cursor = self
                    .pool_cursors
                    .get(&tier)
                    .map(|c| c.load(Ordering::Relaxed))
                    .unwrap_or(0);
                let len = ordered.len();
                (0..len)
                    .map(|offset| (cursor + offset) % len)
                    .find(|&index| eligible(ordered[index], fits[index]))
            }
        };

        let Some(index) = chosen else {
            return Selection::Exhausted;
        };

        let scoring = include_scoring.then(|| {
            let len = ordered.len();
            ordered
                .iter()
                .zip(&fits)
                .enumerate()
                .map(|(position, (m, fit))| CandidateScore {
                    model: m.id.clone(),
                    position,
                    score: balanced_score(position, len, m),
                    in_flight: m.in_flight.load(Ordering::Acquire),
                    max_concurrency: m.max_concurrency,
                    available: eligible(m, *fit),
                    selected: position == index,
                })
                .collect()
        });

        let model = &ordered[index];
        Selection::Selected {
            model: SelectedModel {
                id: model.id.clone(),
                provider: model.provider.clone(),
            },
            scoring,
            reason: format!("{strategy} strategy picked position {index} in {tier}"),
        }
    }

    // ── Cooldowns & pacing ──────────────────────────────────────────────

    /// Record a 429 for the model and set its cooldown. During a transient
    /// burst the cooldown is the dampened form, whose floor still guarantees
    /// it outlasts the retry sleep; the first hit and persistent storms get
    /// the full delay.
    pub fn record_model_429(&self, model: &str, retry_delay_ms: u64, pool_429_count: u32) {
        let Some(state) = self.models.get(model) else {
            return;
        };
        let config = &self.config.cooldown;
        let now = Instant::now();
        {
            let mut hits = state.hits.lock().expect("model hits lock");
            hits.push_back(now);
            while let Some(front) = hits.front() {
                if now.duration_since(*front) > Duration::from_millis(config.burst_window_ms) {
                    hits.pop_front();
                } else {
                    break;
                }
            }
        }

        let persistent = pool_429_count >= config.persistent_threshold;
        let first_hit = pool_429_count <= 1;
        let cooldown_ms = if persistent || first_hit {
            retry_delay_ms
        } else {
            dampened_cooldown_ms(retry_delay_ms, config)
        };

        let until = now + Duration::from_millis(cooldown_ms);
        let mut cooldown = state.cooldown_until.lock().expect("model cooldown lock");
        if cooldown.is_none_or(|existing| until > existing) {
            *cooldown = Some(until);
        }
        tracing::info!(model, cooldown_ms, persistent, "router: model cooling down");
    }

    pub fn model_cooldown_remaining(&self, model: &str) -> Duration {
        self.models
            .get(model)
            .map(|m| m.cooldown_remaining())
            .unwrap_or(Duration::ZERO)
    }

    /// When *every* model in the tier is cooling, the smallest remaining
    /// cooldown; otherwise None. Drives the admission hold.
    pub fn min_tier_cooldown(&self, tier: Tier) -> Option<Duration> {
        let tier_config = self.config.tier(tier)?;
        let mut min: Option<Duration> = None;
        for mc in &tier_config.models {
            let state = self.models.get(&mc.id)?;
            let remaining = state.cooldown_remaining();
            if remaining == Duration::ZERO {
                return None;
            }
            min = Some(match min {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
        min
    }

    /// True once `attempted` covers every model of the tier.
    pub fn tier_fully_attempted(&self, tier: Tier, attempted: &HashSet<String>) -> bool {
        match self.config.tier(tier) {
            Some(tc) => tc.models.iter().all(|m| attempted.contains(&m.id)),
            None => true,
        }
    }

    pub fn model_in_flight(&self, model: &str) -> usize {
        self.models
            .get(model)
            .map(|m| m.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn model_at_capacity(&self, model: &str) -> bool {
        self.models
            .get(model)
            .map(|m| m.available_capacity() == 0)
            .unwrap_or(false)
    }

    pub fn record_model_latency(&self, model: &str, latency_ms: u64) {
        if let Some(state) = self.models.get(model) {
            state.latency.record(latency_ms);
        }
    }

    /// (p95, sample count) for the model's latency window, feeding the
    /// adaptive timeout alongside the key-side p95.
    pub fn model_latency_p95(&self, model: &str) -> (u64, usize) {
        self.models
            .get(model)
            .map(|m| {
                let profile = m.latency.profile();
                (profile.p95_ms, profile.count)
            })
            .unwrap_or((0, 0))
    }

    pub fn model_provider(&self, model: &str) -> Option<String> {
        self.models.get(model).map(|m| m.provider.clone())
    }

    pub fn model_context_length(&self, model: &str) -> Option<u64> {
        self.models.get(model).and_then(|m| m.context_length)
    }

    pub fn model_snapshots(&self) -> Vec<ModelSnapshot> {
        let mut out: Vec<ModelSnapshot> = self
            .models
            .values()
            .map(|m| ModelSnapshot {
                id: m.id.clone(),
                provider: m.provider.clone(),
                in_flight: m.in_flight.load(Ordering::Acquire),
                max_concurrency: m.max_concurrency,
                cooldown_remaining_ms: m.cooldown_remaining().as_millis() as u64,
                recent_429s: m.hits.lock().expect("model hits lock").len(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

enum Selection {
    Selected {
        model: SelectedModel,
        scoring: Option<Vec<CandidateScore>>,
        reason: String,
    },
    Overflow(OverflowDiagnostic),
    Exhausted,
}

/// 0.6·position + 0.4·capacity. A single-model tier scores position 1.0.
fn balanced_score(index: usize, len: usize, model: &ModelState) -> f64 {
    let position_score = if len <= 1 {
        1.0
    } else {
        1.0 - index as f64 / (len - 1) as f64
    };
    let capacity_score = if model.max_concurrency == 0 {
        0.0
    } else {
        model.available_capacity() as f64 / model.max_concurrency as f64
    };
    0.6 * position_score + 0.4 * capacity_score
}

/// Missing cost sorts as most expensive.
fn cost_rank(cost: Option<f64>) -> f64 {
    cost.unwrap_or(f64::INFINITY)
}

fn dampened_cooldown_ms(retry_delay_ms: u64, config: &ModelCooldownConfig) -> u64 {
    let scaled = (retry_delay_ms as f64 * config.burst_dampening_factor) as u64;
    retry_delay_ms.max(scaled.max(100))
}

fn exceeds(profile: &RequestProfile, heavy: &Thresholds) -> bool {
    profile.max_tokens >= heavy.max_tokens
        || profile.message_count >= heavy.message_count
        || profile.system_length >= heavy.system_length
        || (heavy.has_tools && profile.has_tools)
        || (heavy.has_vision && profile.has_vision)
}

fn within(profile: &RequestProfile, light: &Thresholds) -> bool {
    profile.max_tokens <= light.max_tokens
        && profile.message_count <= light.message_count
        && profile.system_length <= light.system_length
        && (light.has_tools || !profile.has_tools)
        && (light.has_vision || !profile.has_vision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, FailoverConfig, ModelConfig, RoutingTraceConfig, TierConfig};
    use serde_json::json;

    fn model(id: &str, max_concurrency: usize) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            max_concurrency,
            context_length: Some(200_000),
            cost_per_mtok: None,
            provider: None,
        }
    }

    fn routing(tiers: Vec<(Tier, Vec<ModelConfig>, Strategy)>) -> ModelRoutingConfig {
        let tiers = tiers
            .into_iter()
            .map(|(tier, models, strategy)| {
                (tier, TierConfig { label: None, models, strategy })
            })
            .collect();
        ModelRoutingConfig {
            enabled: true,
            tiers,
            classifier: ClassifierConfig::default(),
            trace: RoutingTraceConfig {
                sampling_rate: 0.0,
                max_payload_size: 100 * 1024,
            },
            ..ModelRoutingConfig::default()
        }
    }

    fn router(config: ModelRoutingConfig) -> ModelRouter {
        ModelRouter::new(config, Arc::new(RouterStats::default()), "anthropic")
    }

    fn ctx<'a>(
        profile: &'a RequestProfile,
        attempted: &'a HashSet<String>,
    ) -> RoutingContext<'a> {
        RoutingContext {
            request_id: "req-test",
            profile,
            attempted_models: attempted,
            tier_override: None,
        }
    }

    fn profile_for(body: Value) -> RequestProfile {
        RequestProfile::from_body(&body)
    }

    #[test]
    fn profile_extraction_covers_the_classifier_inputs() {
        let profile = profile_for(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 2048,
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image", "source": {"type": "base64"}}
                ]}
            ],
            "tools": [{"name": "bash"}]
        }));
        assert_eq!(profile.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(profile.max_tokens, 2048);
        assert_eq!(profile.message_count, 2);
        assert_eq!(profile.system_length, 8);
        assert!(profile.has_tools);
        assert!(profile.has_vision);
        assert!(profile.estimated_tokens > 2048);
    }

    #[test]
    fn threshold_classifier_assigns_three_tiers() {
        let r = router(routing(vec![
            (Tier::Light, vec![model("light-1", 4)], Strategy::Quality),
            (Tier::Medium, vec![model("medium-1", 4)], Strategy::Quality),
            (Tier::Heavy, vec![model("heavy-1", 4)], Strategy::Quality),
        ]));
        let attempted = HashSet::new();

        let light = profile_for(json!({"max_tokens": 100, "messages": [{"role": "user", "content": "hi"}]}));
        let d = r.compute_decision(&ctx(&light, &attempted));
        assert_eq!(d.tier, Tier::Light);
        assert_eq!(d.source, DecisionSource::Classifier);

        let medium = profile_for(json!({"max_tokens": 4096, "messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(r.compute_decision(&ctx(&medium, &attempted)).tier, Tier::Medium);

        let heavy = profile_for(json!({
            "max_tokens": 32000,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(r.compute_decision(&ctx(&heavy, &attempted)).tier, Tier::Heavy);
    }

    #[test]
    fn rules_win_over_the_classifier_first_match() {
        let mut config = routing(vec![
            (Tier::Light, vec![model("light-1", 4)], Strategy::Quality),
            (Tier::Heavy, vec![model("heavy-1", 4)], Strategy::Quality),
        ]);
        config.rules = vec![
            RouteRule {
                matcher: crate::config::RuleMatch {
                    has_tools: Some(true),
                    ..Default::default()
                },
                tier: Tier::Heavy,
            },
            RouteRule {
                matcher: crate::config::RuleMatch::default(), // catch-all
                tier: Tier::Light,
            },
        ];
        let r = router(config);
        let attempted = HashSet::new();

        let tools = profile_for(json!({"max_tokens": 10, "tools": [{"name": "t"}], "messages": []}));
        let d = r.compute_decision(&ctx(&tools, &attempted));
        assert_eq!(d.tier, Tier::Heavy);
        assert_eq!(d.source, DecisionSource::Rule);

        let plain = profile_for(json!({"max_tokens": 32000, "messages": []}));
        let d = r.compute_decision(&ctx(&plain, &attempted));
        assert_eq!(d.tier, Tier::Light, "catch-all rule beats the classifier");
    }

    #[test]
    fn model_glob_rules_match_requested_model() {
        let mut config = routing(vec![
            (Tier::Light, vec![model("light-1", 4)], Strategy::Quality),
            (Tier::Heavy, vec![model("heavy-1", 4)], Strategy::Quality),
        ]);
        config.rules = vec![
            RouteRule {
                matcher: crate::config::RuleMatch {
                    model: Some("claude-opus-*".into()),
                    ..Default::default()
                },
                tier: Tier::Heavy,
            },
            RouteRule {
                matcher: crate::config::RuleMatch::default(),
                tier: Tier::Light,
            },
        ];
        let r = router(config);
        let attempted = HashSet::new();

        let opus = profile_for(json!({"model": "claude-opus-4-6", "max_tokens": 10, "messages": []}));
        assert_eq!(r.compute_decision(&ctx(&opus, &attempted)).tier, Tier::Heavy);

        let haiku = profile_for(json!({"model": "claude-haiku-4-5", "max_tokens": 10, "messages": []}));
        assert_eq!(r.compute_decision(&ctx(&haiku, &attempted)).tier, Tier::Light);
    }

    #[test]
    fn quality_strategy_picks_first_available() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("first", 4), model("second", 4)],
            Strategy::Quality,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();
        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.unwrap().id, "first");

        let attempted: HashSet<String> = ["first".to_string()].into();
        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.unwrap().id, "second");
    }

    #[test]
    fn throughput_strategy_prefers_free_capacity_with_deterministic_ties() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("alpha", 2), model("beta", 4)],
            Strategy::Throughput,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();

        let mut d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.as_ref().unwrap().id, "beta", "4 free beats 2 free");
        r.commit_decision(&mut d);

        // beta: 3 free, alpha: 2 free — beta still ahead.
        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.unwrap().id, "beta");
    }

    #[test]
    fn throughput_tie_breaks_on_cost_then_id() {
        let mut cheap = model("zeta-cheap", 4);
        cheap.cost_per_mtok = Some(1.0);
        let mut pricey = model("alpha-pricey", 4);
        pricey.cost_per_mtok = Some(10.0);
        let r = router(routing(vec![(
            Tier::Medium,
            vec![pricey, cheap],
            Strategy::Throughput,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();
        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.unwrap().id, "zeta-cheap", "equal capacity, cheaper wins");
    }

    #[test]
    fn balanced_strategy_weights_position_and_capacity() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("preferred", 4), model("backup", 4)],
            Strategy::Balanced,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();

        // Both idle: position dominates (1.0 vs 0.4+0.4).
        let mut d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.as_ref().unwrap().id, "preferred");

        // Saturate preferred: capacity term flips the balance.
        for _ in 0..4 {
            r.commit_decision(&mut d);
            d = r.compute_decision(&ctx(&profile, &attempted));
        }
        assert_eq!(d.model.unwrap().id, "backup");
    }

    #[test]
    fn pool_strategy_round_robins_on_commit_only() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("a", 4), model("b", 4), model("c", 4)],
            Strategy::Pool,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();

        // Uncommitted computes all see the same cursor.
        let d1 = r.compute_decision(&ctx(&profile, &attempted));
        let d2 = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d1.model.as_ref().unwrap().id, d2.model.as_ref().unwrap().id);

        let mut d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.as_ref().unwrap().id, "a");
        r.commit_decision(&mut d);
        let mut d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.as_ref().unwrap().id, "b");
        r.commit_decision(&mut d);
        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.as_ref().unwrap().id, "c");
    }

    #[test]
    fn pool_strategy_skips_cooling_models() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("a", 4), model("b", 4)],
            Strategy::Pool,
        )]));
        r.record_model_429("a", 60_000, 1);
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();
        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.model.unwrap().id, "b");
    }

    #[test]
    fn compute_is_pure_across_repeated_calls() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("m1", 4), model("m2", 4)],
            Strategy::Balanced,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();

        let before = r.stats.snapshot();
        let in_flight_before = r.model_in_flight("m1");
        for _ in 0..5 {
            let _ = r.compute_decision(&ctx(&profile, &attempted));
        }
        assert_eq!(r.stats.snapshot(), before, "compute must not move stats");
        assert_eq!(r.model_in_flight("m1"), in_flight_before);
    }

    #[test]
    fn compute_is_pure_on_fallback_and_sampled_paths() {
        // Force every formerly stat-bearing compute path at once: the tier's
        // only model is cooling (exhaustion), a lower tier exists but
        // downgrading is off (shadow), a default model catches the fallback,
        // and sampling fires on every draw.
        let mut config = routing(vec![
            (Tier::Heavy, vec![model("heavy-1", 4)], Strategy::Quality),
            (Tier::Medium, vec![model("medium-1", 4)], Strategy::Quality),
        ]);
        config.default_model = Some("fallback-model".to_string());
        config.trace.sampling_rate = 1.0;
        let r = router(config);
        r.record_model_429("heavy-1", 60_000, 1);

        let profile = profile_for(json!({"max_tokens": 32000, "messages": []}));
        let attempted = HashSet::new();

        let before = r.stats.snapshot();
        let mut decision = r.compute_decision(&ctx(&profile, &attempted));
        for _ in 0..4 {
            let repeat = r.compute_decision(&ctx(&profile, &attempted));
            assert_eq!(
                repeat.model.as_ref().map(|m| m.id.clone()),
                decision.model.as_ref().map(|m| m.id.clone()),
            );
        }
        assert_eq!(
            r.stats.snapshot(),
            before,
            "fallback, shadow-downgrade and sampling must not move stats in compute"
        );

        // The facts land as counters exactly once, at commit.
        assert_eq!(decision.model.as_ref().unwrap().id, "fallback-model");
        assert_eq!(decision.fallback_reason, Some("default_model"));
        r.commit_decision(&mut decision);
        r.commit_decision(&mut decision);
        let after = r.stats.snapshot();
        assert_eq!(after["total"], 1);
        assert_eq!(after["trace_sampled"], 1);
        assert_eq!(after["default_model_fallbacks"], 1);
        assert_eq!(after["tier_downgrade_shadow"], 1);
        assert_eq!(after["fallback_default_model"], 1);
    }

    #[test]
    fn commit_is_idempotent_per_decision() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("m1", 4)],
            Strategy::Quality,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();
        let mut d = r.compute_decision(&ctx(&profile, &attempted));

        r.commit_decision(&mut d);
        r.commit_decision(&mut d);
        r.commit_decision(&mut d);

        assert_eq!(r.stats.total.load(Ordering::Relaxed), 1);
        assert_eq!(r.model_in_flight("m1"), 1);

        r.release_decision(&d);
        assert_eq!(r.model_in_flight("m1"), 0);
    }

    #[test]
    fn release_of_uncommitted_decision_is_a_no_op() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("m1", 4)],
            Strategy::Quality,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();
        let d = r.compute_decision(&ctx(&profile, &attempted));
        r.release_decision(&d);
        assert_eq!(r.model_in_flight("m1"), 0);
    }

    #[test]
    fn explain_is_stat_neutral_and_stable() {
        let r = router(routing(vec![(
            Tier::Medium,
            vec![model("m1", 4), model("m2", 4)],
            Strategy::Balanced,
        )]));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();
        let context = ctx(&profile, &attempted);

        let before = r.stats.snapshot();
        let first = r.explain(&context, true);
        let second = r.explain(&context, true);
        assert_eq!(r.stats.snapshot(), before);
        assert_eq!(first.selected_model, second.selected_model);
        assert_eq!(first.reason, second.reason);
        assert!(first.scoring.is_some(), "includeTrace returns the scoring table");
    }

    #[test]
    fn genuine_overflow_when_no_model_fits() {
        let mut small = model("small", 4);
        small.context_length = Some(128_000);
        let r = router(routing(vec![(Tier::Heavy, vec![small], Strategy::Quality)]));
        let profile = RequestProfile {
            max_tokens: 32_000,
            estimated_tokens: 300_000,
            ..RequestProfile::default()
        };
        let attempted = HashSet::new();
        let mut context = ctx(&profile, &attempted);
        context.tier_override = Some(Tier::Heavy);

        let before = r.stats.snapshot();
        let d = r.compute_decision(&context);
        assert!(d.model.is_none());
        let overflow = d.overflow.unwrap();
        assert_eq!(overflow.cause, OverflowCause::Genuine);
        assert_eq!(overflow.model_context_length, 128_000);
        assert_eq!(overflow.overflow_by, 300_000 - 128_000);
        // Overflow is a diagnostic on the decision; compute counts nothing.
        assert_eq!(r.stats.snapshot(), before);
    }

    #[test]
    fn transient_overflow_when_only_the_big_model_is_cooling() {
        let mut big = model("big", 4);
        big.context_length = Some(400_000);
        let mut small = model("small", 4);
        small.context_length = Some(128_000);
        let r = router(routing(vec![(
            Tier::Heavy,
            vec![big, small],
            Strategy::Quality,
        )]));
        r.record_model_429("big", 60_000, 1);

        let profile = RequestProfile {
            estimated_tokens: 300_000,
            ..RequestProfile::default()
        };
        let attempted = HashSet::new();
        let mut context = ctx(&profile, &attempted);
        context.tier_override = Some(Tier::Heavy);

        let d = r.compute_decision(&context);
        let overflow = d.overflow.unwrap();
        assert_eq!(overflow.cause, OverflowCause::TransientUnavailable);
    }

    #[test]
    fn shadow_mode_returns_none_and_counts_only_shadow_decisions() {
        let mut config = routing(vec![(
            Tier::Medium,
            vec![model("m1", 4)],
            Strategy::Quality,
        )]);
        config.shadow_mode = true;
        let r = router(config);
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();

        let result = r.select_model(&ctx(&profile, &attempted));
        assert!(result.is_none());
        assert_eq!(r.stats.shadow_decisions.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats.total.load(Ordering::Relaxed), 0);
        assert_eq!(r.model_in_flight("m1"), 0);

        let stored = r.last_shadow_decision().unwrap();
        assert_eq!(stored.model.unwrap().id, "m1");
        assert!(stored.scoring.is_some(), "shadow stores the scoring table");
    }

    #[test]
    fn drift_recorded_when_pool_disagrees() {
        struct EmptyPool;
        impl PoolView for EmptyPool {
            fn key_snapshots(&self) -> Vec<KeySnapshot> {
                Vec::new()
            }
        }

        let mut r = router(routing(vec![(
            Tier::Medium,
            vec![model("m1", 4)],
            Strategy::Quality,
        )]));
        r.set_pool_view(Arc::new(EmptyPool));
        let profile = profile_for(json!({"max_tokens": 4096, "messages": []}));
        let attempted = HashSet::new();

        let d = r.select_model(&ctx(&profile, &attempted)).unwrap();
        assert!(d.model.is_some(), "router view says available");
        assert_eq!(r.stats.drift_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dampened_cooldown_outlasts_the_retry_sleep() {
        let config = ModelCooldownConfig::default();
        assert!(dampened_cooldown_ms(2_000, &config) >= 2_000);
        assert_eq!(dampened_cooldown_ms(50, &config), 100, "floor of 100ms");
    }

    #[test]
    fn min_tier_cooldown_requires_every_model_cooling() {
        let r = router(routing(vec![(
            Tier::Heavy,
            vec![model("a", 4), model("b", 4)],
            Strategy::Quality,
        )]));
        assert!(r.min_tier_cooldown(Tier::Heavy).is_none());

        r.record_model_429("a", 5_000, 1);
        assert!(r.min_tier_cooldown(Tier::Heavy).is_none(), "b is still free");

        r.record_model_429("b", 2_000, 1);
        let min = r.min_tier_cooldown(Tier::Heavy).unwrap();
        assert!(min <= Duration::from_millis(2_000));
        assert!(min > Duration::from_millis(1_000));
    }

    #[test]
    fn tier_downgrade_shadow_counts_at_commit_not_compute() {
        let r = router(routing(vec![
            (Tier::Heavy, vec![model("heavy-1", 4)], Strategy::Quality),
            (Tier::Medium, vec![model("medium-1", 4)], Strategy::Quality),
        ]));
        r.record_model_429("heavy-1", 60_000, 1);
        let profile = profile_for(json!({"max_tokens": 32000, "messages": []}));
        let attempted = HashSet::new();

        let before = r.stats.snapshot();
        let mut d = r.compute_decision(&ctx(&profile, &attempted));
        assert!(d.model.is_none(), "downgrade disabled, no candidate");
        assert_eq!(r.stats.snapshot(), before, "compute records the fact, not the count");

        r.commit_decision(&mut d);
        assert_eq!(r.stats.tier_downgrade_shadow.load(Ordering::Relaxed), 1);
        assert_eq!(
            r.stats.by_fallback_reason.lock().unwrap().get("tier_exhausted"),
            Some(&1)
        );
    }

    #[test]
    fn tier_downgrade_applies_when_allowed() {
        let mut config = routing(vec![
            (Tier::Heavy, vec![model("heavy-1", 4)], Strategy::Quality),
            (Tier::Medium, vec![model("medium-1", 4)], Strategy::Quality),
        ]);
        config.failover = FailoverConfig {
            allow_tier_downgrade: true,
            ..FailoverConfig::default()
        };
        let r = router(config);
        r.record_model_429("heavy-1", 60_000, 1);
        let profile = profile_for(json!({"max_tokens": 32000, "messages": []}));
        let attempted = HashSet::new();

        let d = r.compute_decision(&ctx(&profile, &attempted));
        assert_eq!(d.tier, Tier::Medium);
        assert_eq!(d.model.unwrap().id, "medium-1");
        assert!(d.reason.contains("downgraded"));
    }
}
