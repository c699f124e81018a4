// keymux — typed configuration surface
//
// All tunables consumed by the proxy core. Loaded once at startup from an
// optional JSON file (KEYMUX_CONFIG) plus environment variables; numeric
// clamps and model-routing validation happen here, at load time, so the
// rest of the code can trust every value.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Limits applied at load time ─────────────────────────────────────────────

const MAX_RETRIES_CAP: u32 = 10;
const TRACE_PAYLOAD_MIN: usize = 10 * 1024;
const TRACE_PAYLOAD_MAX: usize = 1024 * 1024;
const TRACE_PAYLOAD_DEFAULT: usize = 100 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("modelRouting.tiers.{tier}: models[] must not be empty")]
    EmptyModels { tier: Tier },

    #[error("modelRouting.tiers.{tier}: label must be a string")]
    BadLabel { tier: Tier },

    #[error("modelRouting.tiers.{tier}: unknown strategy '{strategy}'")]
    BadStrategy { tier: Tier, strategy: String },

    #[error("modelRouting.rules require a catch-all match or a defaultModel")]
    NoCatchAll,

    #[error("modelRouting.rules[{index}].match.model: invalid glob '{glob}'")]
    BadGlob { index: usize, glob: String },

    #[error("no credentials configured (set credentials[] or KEYMUX_API_KEYS)")]
    NoCredentials,

    #[error("credential '{id}' references unknown provider '{provider}'")]
    UnknownProvider { id: String, provider: String },
}

// ── Tiers ───────────────────────────────────────────────────────────────────

/// Coarse request classification driving the candidate model set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Light,
    Medium,
    Heavy,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Light, Tier::Medium, Tier::Heavy];

    /// Next tier down, for failover downgrade. `light` has nowhere to go.
    pub fn downgrade(self) -> Option<Tier> {
        match self {
            Tier::Heavy => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Light),
            Tier::Light => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Light => "light",
            Tier::Medium => "medium",
            Tier::Heavy => "heavy",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-tier model selection strategy ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Scan in declared order, first available wins.
    Quality,
    /// Most available capacity; ties broken by cost, max-concurrency, id.
    Throughput,
    /// 0.6·position + 0.4·capacity score.
    Balanced,
    /// Round-robin with cooldown-aware skip.
    Pool,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Quality => "quality",
            Strategy::Throughput => "throughput",
            Strategy::Balanced => "balanced",
            Strategy::Pool => "pool",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Root config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Retry attempts per client request, clamped to 0..=10.
    pub max_retries: u32,
    /// Base per-request timeout in ms (before retry/backoff slack).
    pub request_timeout_ms: u64,
    /// Global in-flight cap; requests above it get an immediate 503.
    pub max_total_concurrency: usize,
    /// Concurrent outbound upstream requests (pacing gate permits).
    pub max_concurrent_upstream: usize,
    pub queue_size: usize,
    pub queue_timeout_ms: u64,
    /// Pick keys by composite health score instead of round-robin.
    pub weighted_selection: bool,
    pub retry: RetryConfig,
    pub adaptive_timeout: AdaptiveTimeoutConfig,
    pub connection_health: ConnectionHealthConfig,
    pub pool_cooldown: PoolCooldownConfig,
    pub admission_hold: AdmissionHoldConfig,
    pub model_routing: Option<ModelRoutingConfig>,
    pub providers: Vec<ProviderConfig>,
    pub credentials: Vec<CredentialConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout_ms: 120_000,
            max_total_concurrency: 256,
            max_concurrent_upstream: 32,
            queue_size: 64,
            queue_timeout_ms: 10_000,
            weighted_selection: false,
            retry: RetryConfig::default(),
            adaptive_timeout: AdaptiveTimeoutConfig::default(),
            connection_health: ConnectionHealthConfig::default(),
            pool_cooldown: PoolCooldownConfig::default(),
            admission_hold: AdmissionHoldConfig::default(),
            model_routing: None,
            providers: vec![ProviderConfig::anthropic_default()],
            credentials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 15_000,
            backoff_multiplier: 2.0,
            jitter_percent: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveTimeoutConfig {
    pub enabled: bool,
    pub initial_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    /// Below this many latency samples the window is ignored.
    pub min_samples: usize,
    pub latency_multiplier: f64,
    pub retry_multiplier: f64,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_ms: 60_000,
            min_ms: 10_000,
            max_ms: 300_000,
            min_samples: 5,
            latency_multiplier: 3.0,
            retry_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionHealthConfig {
    pub max_consecutive_hangups: u32,
    pub agent_recreation_cooldown_ms: u64,
}

impl Default for ConnectionHealthConfig {
    fn default() -> Self {
        Self {
            max_consecutive_hangups: 5,
            agent_recreation_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolCooldownConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Above this remaining cooldown, attempt 0 answers 429 locally instead
    /// of sleeping.
    pub sleep_threshold_ms: u64,
    pub retry_jitter_ms: u64,
    /// Bound on any single in-handler cooldown sleep.
    pub max_cooldown_ms: u64,
}

impl Default for PoolCooldownConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            sleep_threshold_ms: 5_000,
            retry_jitter_ms: 250,
            max_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionHoldConfig {
    pub enabled: bool,
    /// Tiers the hold applies to; empty = all tiers.
    pub tiers: Vec<Tier>,
    pub min_cooldown_to_hold_ms: u64,
    pub max_hold_ms: u64,
    pub jitter_ms: u64,
    pub max_concurrent_holds: usize,
}

impl Default for AdmissionHoldConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tiers: Vec::new(),
            min_cooldown_to_hold_ms: 500,
            max_hold_ms: 10_000,
            jitter_ms: 100,
            max_concurrent_holds: 16,
        }
    }
}

// ── Providers & credentials ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// `x-api-key: <key>`
    XApiKey,
    /// `authorization: Bearer <key>`
    Bearer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub auth_scheme: AuthScheme,
    /// Extra headers injected on upstream requests. Reserved headers are
    /// filtered out at dispatch time, not here.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn anthropic_default() -> Self {
        let mut extra_headers = HashMap::new();
        extra_headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        Self {
            name: "anthropic".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            auth_scheme: AuthScheme::XApiKey,
            extra_headers,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    /// Stable identifier used in logs and snapshots; never the secret.
    pub id: String,
    /// The opaque secret sent upstream.
    pub key: String,
    #[serde(default = "default_provider_name")]
    pub provider: String,
    #[serde(default = "default_key_concurrency")]
    pub max_concurrency: usize,
    /// Optional rate-limit bucket, tokens per minute.
    pub tokens_per_minute: Option<u32>,
}

fn default_provider_name() -> String {
    "anthropic".to_string()
}

fn default_key_concurrency() -> usize {
    8
}

// ── Model routing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRoutingConfig {
    pub version: Option<String>,
    pub enabled: bool,
    /// Decisions are computed and recorded but never applied.
    pub shadow_mode: bool,
    pub default_model: Option<String>,
    pub rules: Vec<RouteRule>,
    pub classifier: ClassifierConfig,
    pub tiers: HashMap<Tier, TierConfig>,
    pub cooldown: ModelCooldownConfig,
    pub failover: FailoverConfig,
    pub transient_overflow_retry: TransientOverflowConfig,
    pub trace: RoutingTraceConfig,

    // v1 fields, consumed by migration.
    pub target_model: Option<String>,
    pub fallback_models: Vec<String>,
}

impl Default for ModelRoutingConfig {
    fn default() -> Self {
        Self {
            version: None,
            enabled: false,
            shadow_mode: false,
            default_model: None,
            rules: Vec::new(),
            classifier: ClassifierConfig::default(),
            tiers: HashMap::new(),
            cooldown: ModelCooldownConfig::default(),
            failover: FailoverConfig::default(),
            transient_overflow_retry: TransientOverflowConfig::default(),
            trace: RoutingTraceConfig::default(),
            target_model: None,
            fallback_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub tier: Tier,
}

/// All present constraints must hold for the rule to fire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleMatch {
    /// Glob over the client-requested model id.
    pub model: Option<String>,
    pub max_tokens_gte: Option<u64>,
    pub message_count_gte: Option<usize>,
    pub has_tools: Option<bool>,
    pub has_vision: Option<bool>,
}

impl RuleMatch {
    /// A match with no constraints fires on everything.
    pub fn is_catch_all(&self) -> bool {
        self.model.is_none()
            && self.max_tokens_gte.is_none()
            && self.message_count_gte.is_none()
            && self.has_tools.is_none()
            && self.has_vision.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
    pub heavy_thresholds: Thresholds,
    pub light_thresholds: Thresholds,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            heavy_thresholds: Thresholds {
                max_tokens: 16_384,
                message_count: 40,
                system_length: 20_000,
                has_tools: true,
                has_vision: true,
            },
            light_thresholds: Thresholds {
                max_tokens: 1_024,
                message_count: 4,
                system_length: 1_000,
                has_tools: false,
                has_vision: false,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub max_tokens: u64,
    pub message_count: usize,
    pub system_length: usize,
    pub has_tools: bool,
    pub has_vision: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub label: Option<String>,
    pub models: Vec<ModelConfig>,
    #[serde(default = "default_strategy", deserialize_with = "parse_strategy")]
    pub strategy: Strategy,
}

fn default_strategy() -> Strategy {
    Strategy::Balanced
}

/// Accepts the documented strategies plus legacy `failover`, which migrates
/// to `balanced`. Unknown strings are surfaced as a validation error later,
/// so deserialization keeps the raw string around.
fn parse_strategy<'de, D>(de: D) -> Result<Strategy, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    match raw.as_str() {
        "quality" => Ok(Strategy::Quality),
        "throughput" => Ok(Strategy::Throughput),
        "balanced" => Ok(Strategy::Balanced),
        "pool" => Ok(Strategy::Pool),
        "failover" => Ok(Strategy::Balanced),
        other => Err(serde::de::Error::custom(format!(
            "unknown strategy '{other}' (expected quality, throughput, balanced, pool or failover)"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "default_model_concurrency")]
    pub max_concurrency: usize,
    /// Context window in tokens; used by overflow detection.
    pub context_length: Option<u64>,
    /// Cost per million output tokens, for throughput tie-breaks.
    pub cost_per_mtok: Option<f64>,
    /// Provider override; tier models default to the pool's provider.
    pub provider: Option<String>,
}

fn default_model_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelCooldownConfig {
    /// 429s closer together than this form a burst.
    pub burst_window_ms: u64,
    pub burst_dampening_factor: f64,
    /// pool429Count at or above this is treated as persistent.
    pub persistent_threshold: u32,
}

impl Default for ModelCooldownConfig {
    fn default() -> Self {
        Self {
            burst_window_ms: 10_000,
            burst_dampening_factor: 0.3,
            persistent_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    pub allow_tier_downgrade: bool,
    pub max_model_switches_per_request: u32,
    pub max_429_attempts_per_request: u32,
    pub max_429_retry_window_ms: u64,
    /// Advisory pre-dispatch pacing once a model is known, capped at 1 s.
    pub model_pacing_delay_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            allow_tier_downgrade: false,
            max_model_switches_per_request: 3,
            max_429_attempts_per_request: 4,
            max_429_retry_window_ms: 60_000,
            model_pacing_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransientOverflowConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingTraceConfig {
    pub sampling_rate: f64,
    pub max_payload_size: usize,
}

impl Default for RoutingTraceConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 0.05,
            max_payload_size: TRACE_PAYLOAD_DEFAULT,
        }
    }
}

// ── Loading, migration, validation ──────────────────────────────────────────

impl ProxyConfig {
    /// Load from the KEYMUX_CONFIG file when set, else defaults; then apply
    /// env credential fallback, migration, clamps and validation. Warnings
    /// are logged, hard errors abort startup.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("KEYMUX_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str(&raw)
                    .map_err(|source| ConfigError::Parse { path, source })?
            }
            Err(_) => ProxyConfig::default(),
        };

        // Env fallback: KEYMUX_API_KEYS="id1:secret1,id2:secret2" or bare
        // secrets. Matches the single-key env convention, generalized.
        if cfg.credentials.is_empty() {
            if let Ok(raw) = std::env::var("KEYMUX_API_KEYS") {
                for (i, entry) in raw.split(',').filter(|s| !s.trim().is_empty()).enumerate() {
                    let entry = entry.trim();
                    let (id, key) = match entry.split_once(':') {
                        Some((id, key)) => (id.to_string(), key.to_string()),
                        None => (format!("key-{:02}", i + 1), entry.to_string()),
                    };
                    cfg.credentials.push(CredentialConfig {
                        id,
                        key,
                        provider: default_provider_name(),
                        max_concurrency: default_key_concurrency(),
                        tokens_per_minute: None,
                    });
                }
            }
        }

        cfg.finalize()?;
        Ok(cfg)
    }

    /// Migration + clamps + validation, separated from I/O so tests can
    /// exercise it on in-memory configs.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        self.max_retries = self.max_retries.min(MAX_RETRIES_CAP);

        if self.credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        for cred in &self.credentials {
            if !self.providers.iter().any(|p| p.name == cred.provider) {
                return Err(ConfigError::UnknownProvider {
                    id: cred.id.clone(),
                    provider: cred.provider.clone(),
                });
            }
        }

        if let Some(routing) = self.model_routing.as_mut() {
            routing.migrate_v1();
            routing.trace.max_payload_size = routing
                .trace
                .max_payload_size
                .clamp(TRACE_PAYLOAD_MIN, TRACE_PAYLOAD_MAX);
            routing.trace.sampling_rate = routing.trace.sampling_rate.clamp(0.0, 1.0);
            for warning in routing.validate()? {
                tracing::warn!("config: {warning}");
            }
        }

        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    /// Overall per-request deadline: base timeout plus worst-case backoff
    /// plus fixed slack.
    pub fn overall_deadline(&self) -> std::time::Duration {
        let backoff_budget = self.max_retries as u64 * self.retry.max_delay_ms;
        std::time::Duration::from_millis(self.request_timeout_ms + backoff_budget + 5_000)
    }
}

impl ModelRoutingConfig {
    /// v1 configs carried `targetModel` + `fallbackModels` and no tiers.
    /// Migrate them to a single `medium` tier with strategy `balanced`
    /// (legacy `pool` is preserved by the strategy parser).
    pub fn migrate_v1(&mut self) {
        let is_v2 = matches!(self.version.as_deref(), Some("2.0")) || !self.tiers.is_empty();
        if is_v2 {
            return;
        }
        let Some(target) = self.target_model.take() else {
            return;
        };

        let mut models = vec![target];
        models.append(&mut self.fallback_models);
        let models = models
            .into_iter()
            .map(|id| ModelConfig {
                id,
                max_concurrency: default_model_concurrency(),
                context_length: None,
                cost_per_mtok: None,
                provider: None,
            })
            .collect();

        self.tiers.insert(
            Tier::Medium,
            TierConfig {
                label: Some("migrated".to_string()),
                models,
                strategy: Strategy::Balanced,
            },
        );
        self.version = Some("2.0".to_string());
        tracing::info!("config: migrated v1 model routing (targetModel + fallbackModels) to v2");
    }

    /// Hard errors abort startup; the returned strings are warnings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        for (tier, tc) in &self.tiers {
            if tc.models.is_empty() {
                return Err(ConfigError::EmptyModels { tier: *tier });
            }
            if let Some(label) = &tc.label {
                if label.is_empty() {
                    return Err(ConfigError::BadLabel { tier: *tier });
                }
            }
            if self.failover.max_model_switches_per_request as usize > tc.models.len() {
                warnings.push(format!(
                    "tiers.{tier}: maxModelSwitchesPerRequest ({}) exceeds the tier's model count ({})",
                    self.failover.max_model_switches_per_request,
                    tc.models.len(),
                ));
            }
        }

        // Models shared across tiers form a shared pool — legal, but worth a
        // warning because their in-flight counters are shared too.
        let mut seen: HashMap<&str, Tier> = HashMap::new();
        for (tier, tc) in &self.tiers {
            for model in &tc.models {
                if let Some(other) = seen.insert(model.id.as_str(), *tier) {
                    if other != *tier {
                        warnings.push(format!(
                            "model '{}' is shared between tiers {other} and {tier} (shared pool)",
                            model.id
                        ));
                    }
                }
            }
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(glob) = &rule.matcher.model {
                if glob::Pattern::new(glob).is_err() {
                    return Err(ConfigError::BadGlob {
                        index,
                        glob: glob.clone(),
                    });
                }
            }
        }
        if !self.rules.is_empty() {
            let has_catch_all = self.rules.iter().any(|r| r.matcher.is_catch_all());
            if !has_catch_all && self.default_model.is_none() {
                return Err(ConfigError::NoCatchAll);
            }
        }

        Ok(warnings)
    }

    pub fn tier(&self, tier: Tier) -> Option<&TierConfig> {
        self.tiers.get(&tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing_json(body: &str) -> ModelRoutingConfig {
        serde_json::from_str(body).expect("routing config parses")
    }

    #[test]
    fn max_retries_clamps_to_ten() {
        let mut cfg = ProxyConfig {
            max_retries: 99,
            credentials: vec![CredentialConfig {
                id: "k1".into(),
                key: "sk-test".into(),
                provider: "anthropic".into(),
                max_concurrency: 4,
                tokens_per_minute: None,
            }],
            ..ProxyConfig::default()
        };
        cfg.finalize().unwrap();
        assert_eq!(cfg.max_retries, 10);
    }

    #[test]
    fn missing_credentials_is_an_error() {
        let mut cfg = ProxyConfig::default();
        assert!(matches!(cfg.finalize(), Err(ConfigError::NoCredentials)));
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let mut cfg = ProxyConfig {
            credentials: vec![CredentialConfig {
                id: "k1".into(),
                key: "sk".into(),
                provider: "nonesuch".into(),
                max_concurrency: 1,
                tokens_per_minute: None,
            }],
            ..ProxyConfig::default()
        };
        assert!(matches!(
            cfg.finalize(),
            Err(ConfigError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn trace_payload_size_clamps_both_ways() {
        for (input, expected) in [(1usize, 10 * 1024usize), (usize::MAX, 1024 * 1024)] {
            let mut cfg = ProxyConfig {
                credentials: vec![CredentialConfig {
                    id: "k1".into(),
                    key: "sk".into(),
                    provider: "anthropic".into(),
                    max_concurrency: 1,
                    tokens_per_minute: None,
                }],
                model_routing: Some(ModelRoutingConfig {
                    trace: RoutingTraceConfig {
                        sampling_rate: 0.0,
                        max_payload_size: input,
                    },
                    ..ModelRoutingConfig::default()
                }),
                ..ProxyConfig::default()
            };
            cfg.finalize().unwrap();
            assert_eq!(
                cfg.model_routing.unwrap().trace.max_payload_size,
                expected
            );
        }
    }

    #[test]
    fn empty_tier_models_rejected() {
        let routing = routing_json(
            r#"{"enabled": true, "tiers": {"heavy": {"models": [], "strategy": "quality"}}}"#,
        );
        assert!(matches!(
            routing.validate(),
            Err(ConfigError::EmptyModels { tier: Tier::Heavy })
        ));
    }

    #[test]
    fn unknown_strategy_rejected_at_parse() {
        let err = serde_json::from_str::<ModelRoutingConfig>(
            r#"{"tiers": {"light": {"models": [{"id": "m"}], "strategy": "chaos"}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown strategy"));
    }

    #[test]
    fn legacy_failover_strategy_migrates_to_balanced() {
        let routing = routing_json(
            r#"{"tiers": {"light": {"models": [{"id": "m"}], "strategy": "failover"}}}"#,
        );
        assert_eq!(routing.tiers[&Tier::Light].strategy, Strategy::Balanced);
    }

    #[test]
    fn rules_without_catch_all_or_default_rejected() {
        let routing = routing_json(
            r#"{
                "rules": [{"match": {"hasTools": true}, "tier": "heavy"}],
                "tiers": {"heavy": {"models": [{"id": "m"}], "strategy": "quality"}}
            }"#,
        );
        assert!(matches!(routing.validate(), Err(ConfigError::NoCatchAll)));
    }

    #[test]
    fn rules_with_default_model_pass() {
        let routing = routing_json(
            r#"{
                "defaultModel": "claude-haiku-4-5",
                "rules": [{"match": {"hasTools": true}, "tier": "heavy"}],
                "tiers": {"heavy": {"models": [{"id": "m"}], "strategy": "quality"}}
            }"#,
        );
        assert!(routing.validate().is_ok());
    }

    #[test]
    fn shared_models_warn_not_reject() {
        let routing = routing_json(
            r#"{"tiers": {
                "heavy": {"models": [{"id": "shared"}], "strategy": "quality"},
                "medium": {"models": [{"id": "shared"}], "strategy": "quality"}
            }}"#,
        );
        let warnings = routing.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("shared")));
    }

    #[test]
    fn v1_config_migrates_to_v2() {
        let mut routing = routing_json(
            r#"{"enabled": true, "targetModel": "claude-sonnet-4-5", "fallbackModels": ["claude-haiku-4-5"]}"#,
        );
        routing.migrate_v1();
        assert_eq!(routing.version.as_deref(), Some("2.0"));
        let tier = &routing.tiers[&Tier::Medium];
        assert_eq!(tier.strategy, Strategy::Balanced);
        let ids: Vec<_> = tier.models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["claude-sonnet-4-5", "claude-haiku-4-5"]);
    }

    #[test]
    fn v2_config_not_touched_by_migration() {
        let mut routing = routing_json(
            r#"{"version": "2.0", "targetModel": "stale", "tiers": {"light": {"models": [{"id": "m"}], "strategy": "pool"}}}"#,
        );
        routing.migrate_v1();
        assert!(routing.tiers.contains_key(&Tier::Light));
        assert!(!routing.tiers.contains_key(&Tier::Medium));
    }

    #[test]
    fn bad_rule_glob_rejected() {
        let routing = routing_json(
            r#"{
                "defaultModel": "m",
                "rules": [{"match": {"model": "claude-[*"}, "tier": "light"}],
                "tiers": {"light": {"models": [{"id": "m"}], "strategy": "quality"}}
            }"#,
        );
        assert!(matches!(routing.validate(), Err(ConfigError::BadGlob { index: 0, .. })));
    }

    #[test]
    fn tier_downgrade_order() {
        assert_eq!(Tier::Heavy.downgrade(), Some(Tier::Medium));
        assert_eq!(Tier::Medium.downgrade(), Some(Tier::Light));
        assert_eq!(Tier::Light.downgrade(), None);
    }
}
