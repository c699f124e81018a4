// keymux — credential pool
//
// Owns every upstream credential: per-key in-flight caps, circuit breakers,
// latency windows, optional token buckets, per-key 429 cooldowns, and the
// pool-level (global and per-model) 429 cooldown state. Acquisition is
// atomic: a returned key has already passed every guard and had its
// in-flight counter bumped.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::config::{CredentialConfig, PoolCooldownConfig};
use crate::errors::ErrorType;
use crate::latency::{LatencyProfile, LatencyWindow};

/// Hits this close together count toward burst/account detection.
const HIT_WINDOW: Duration = Duration::from_secs(60);
const ACCOUNT_DETECTION_WINDOW: Duration = Duration::from_secs(10);
/// Per-key penalty cap while the whole pool is rate limited.
const DAMPENED_KEY_COOLDOWN_MS: u64 = 1_000;
/// Quarantined keys recover below threshold·0.8.
const SLOW_KEY_RECOVERY_FACTOR: f64 = 0.8;

// ── Token bucket (tokens per minute, burst up to one minute's worth) ───────

struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_minute: u32) -> Self {
        let burst = tokens_per_minute as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate_per_sec: tokens_per_minute as f64 / 60.0,
            burst,
        }
    }

    fn try_take(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ── Credential ──────────────────────────────────────────────────────────────

pub struct Credential {
    pub id: String,
    key: String,
    pub provider: String,
    pub max_concurrency: usize,
    in_flight: AtomicUsize,
    pub breaker: CircuitBreaker,
    pub latency: LatencyWindow,
    bucket: Option<TokenBucket>,
    /// Millis since pool epoch; 0 = no cooldown.
    cooldown_until_ms: AtomicU64,
    rate_limit_hits: AtomicU32,
    quarantined: AtomicBool,
}

impl Credential {
    fn from_config(config: &CredentialConfig) -> Self {
        Self {
            id: config.id.clone(),
            key: config.key.clone(),
            provider: config.provider.clone(),
            max_concurrency: config.max_concurrency,
            in_flight: AtomicUsize::new(0),
            breaker: CircuitBreaker::new(BreakerConfig::default()),
            latency: LatencyWindow::default(),
            bucket: config.tokens_per_minute.map(TokenBucket::new),
            cooldown_until_ms: AtomicU64::new(0),
            rate_limit_hits: AtomicU32::new(0),
            quarantined: AtomicBool::new(false),
        }
    }

    /// The secret, handed out only at dispatch time.
    pub fn secret(&self) -> &str {
        &self.key
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// CAS increment bounded by max_concurrency.
    fn try_reserve(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_concurrency {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Read view of one credential, consumed by the drift detector and the
/// status endpoint. The secret is intentionally absent.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub index: usize,
    pub id: String,
    pub provider: String,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub breaker_state: &'static str,
    pub cooldown_remaining_ms: u64,
    pub rate_limit_hits: u32,
    pub quarantined: bool,
    pub latency: LatencySnapshot,
    /// Whether `acquire` could return this key right now.
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

impl From<LatencyProfile> for LatencySnapshot {
    fn from(p: LatencyProfile) -> Self {
        Self {
            count: p.count,
            p50_ms: p.p50_ms,
            p95_ms: p.p95_ms,
        }
    }
}

// ── Pool-level cooldown state ───────────────────────────────────────────────

#[derive(Default)]
struct CooldownState {
    cooldown_until: Option<Instant>,
    last_hit_at: Option<Instant>,
    hits: VecDeque<Instant>,
}

impl CooldownState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > HIT_WINDOW {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.cooldown_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }
}

/// Outcome of recording one pool-level 429.
#[derive(Debug, Clone, Copy)]
pub struct PoolRateLimitHit {
    pub cooldown_ms: u64,
    pub pool_429_count: u32,
    pub was_already_blocked: bool,
}

// ── The pool ────────────────────────────────────────────────────────────────

pub struct KeyPool {
    credentials: Vec<Credential>,
    rr_cursor: AtomicUsize,
    epoch: Instant,
    weighted_selection: bool,
    cooldown_config: PoolCooldownConfig,
    global_cooldown: Mutex<CooldownState>,
    model_cooldowns: Mutex<HashMap<String, CooldownState>>,
    /// (key index, at) pairs for account-level 429 detection.
    recent_key_429s: Mutex<VecDeque<(usize, Instant)>>,
}

impl KeyPool {
    pub fn new(configs: &[CredentialConfig], cooldown_config: PoolCooldownConfig) -> Self {
        Self {
            credentials: configs.iter().map(Credential::from_config).collect(),
            rr_cursor: AtomicUsize::new(0),
            epoch: Instant::now(),
            weighted_selection: false,
            cooldown_config,
            global_cooldown: Mutex::new(CooldownState::default()),
            model_cooldowns: Mutex::new(HashMap::new()),
            recent_key_429s: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_weighted_selection(mut self, weighted: bool) -> Self {
        self.weighted_selection = weighted;
        self
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credential(&self, index: usize) -> Option<&Credential> {
        self.credentials.get(index)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn eligible(&self, index: usize, provider: &str, excluded: &[usize]) -> bool {
        let cred = &self.credentials[index];
        if cred.provider != provider || excluded.contains(&index) {
            return false;
        }
        if cred.quarantined.load(Ordering::Acquire) {
            return false;
        }
        if cred.cooldown_until_ms.load(Ordering::Acquire) > self.now_ms() {
            return false;
        }
        if cred.in_flight() >= cred.max_concurrency {
            return false;
        }
        true
    }

    /// Pick and reserve a credential for `provider`. Round-robin over the
    /// eligible set by default, best health score when weighted selection is
    /// on; every guard (breaker, bucket, cap, cooldown) is applied before
    /// the in-flight counter moves. Returns the key's index.
    pub fn acquire(&self, provider: &str, excluded: &[usize]) -> Option<usize> {
        let n = self.credentials.len();
        if n == 0 {
            return None;
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
        let order: Vec<usize> = if self.weighted_selection {
            let mut scored: Vec<(usize, f64)> = (0..n)
                .map(|index| (index, self.health_score(index)))
                .collect();
            scored.sort_by(|(ia, sa), (ib, sb)| {
                sb.partial_cmp(sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ia.cmp(ib))
            });
            scored.into_iter().map(|(index, _)| index).collect()
        } else {
            (0..n).map(|offset| (start + offset) % n).collect()
        };

        for index in order {
            if !self.eligible(index, provider, excluded) {
                continue;
            }
            let cred = &self.credentials[index];
            // The breaker check may consume the half-open trial slot, so it
            // runs last among the cheap guards.
            if !cred.breaker.allow_request() {
                continue;
            }
            if let Some(bucket) = &cred.bucket {
                if !bucket.try_take() {
                    continue;
                }
            }
            if cred.try_reserve() {
                tracing::debug!(key = %cred.id, in_flight = cred.in_flight(), "key pool: acquired");
                return Some(index);
            }
        }
        None
    }

    /// Composite health score for weighted selection: recent failures,
    /// latency and rate-limit pressure all push a key down the order.
    fn health_score(&self, index: usize) -> f64 {
        let cred = &self.credentials[index];
        let failures = cred.breaker.failure_count() as f64;
        let p50 = cred.latency.p50() as f64;
        let rate_limit_hits = cred.rate_limit_hits.load(Ordering::Acquire) as f64;
        let headroom =
            1.0 - cred.in_flight() as f64 / cred.max_concurrency.max(1) as f64;
        headroom / ((1.0 + failures) * (1.0 + p50 / 1_000.0) * (1.0 + rate_limit_hits))
    }

    /// Give the in-flight slot back. Exactly one release per acquisition.
    pub fn release(&self, index: usize) {
        if let Some(cred) = self.credentials.get(index) {
            let prev = cred.in_flight.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "release without matching acquire");
        }
    }

    pub fn record_success(&self, index: usize, latency_ms: u64) {
        if let Some(cred) = self.credentials.get(index) {
            cred.latency.record(latency_ms);
            cred.breaker.record_success();
        }
    }

    pub fn record_failure(&self, index: usize, error_type: ErrorType) {
        if let Some(cred) = self.credentials.get(index) {
            tracing::debug!(key = %cred.id, error = %error_type, "key pool: failure recorded");
            cred.breaker.record_failure();
        }
    }

    /// Per-key 429. Without an upstream Retry-After the cooldown grows as
    /// base · 2^(hits−2), capped, with jitter.
    pub fn record_rate_limit(&self, index: usize, retry_after_ms: Option<u64>) {
        let Some(cred) = self.credentials.get(index) else {
            return;
        };
        let hits = cred.rate_limit_hits.fetch_add(1, Ordering::AcqRel) + 1;
        let cooldown_ms = match retry_after_ms {
            Some(ms) => ms,
            None => {
                let exponent = hits.saturating_sub(2);
                let backoff = self
                    .cooldown_config
                    .base_ms
                    .saturating_mul(2u64.saturating_pow(exponent))
                    .min(self.cooldown_config.cap_ms);
                backoff + rand::random_range(0..=self.cooldown_config.retry_jitter_ms)
            }
        };
        self.set_key_cooldown(index, cooldown_ms);

        let mut recent = self.recent_key_429s.lock().expect("recent 429 lock");
        let now = Instant::now();
        recent.push_back((index, now));
        while let Some((_, at)) = recent.front() {
            if now.duration_since(*at) > ACCOUNT_DETECTION_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Directly pin a key's cooldown, used for burst dampening where the
    /// per-key penalty is capped at min(1 s, pool cooldown).
    pub fn set_key_cooldown(&self, index: usize, cooldown_ms: u64) {
        if let Some(cred) = self.credentials.get(index) {
            let until = self.now_ms() + cooldown_ms;
            cred.cooldown_until_ms.store(until, Ordering::Release);
            tracing::info!(key = %cred.id, cooldown_ms, "key pool: key cooling down");
        }
    }

    /// The dampened per-key penalty during a pool burst.
    pub fn dampened_key_cooldown_ms(&self, pool_cooldown_ms: u64) -> u64 {
        pool_cooldown_ms.min(DAMPENED_KEY_COOLDOWN_MS)
    }

    /// Record a 429 against the pool itself (global, and per-model when the
    /// model is known). `base_ms` comes from upstream Retry-After when
    /// present; otherwise the cooldown grows exponentially with the sliding
    /// hit count.
    pub fn record_pool_rate_limit_hit(
        &self,
        model: Option<&str>,
        base_ms: Option<u64>,
        cap_ms: u64,
    ) -> PoolRateLimitHit {
        let global = {
            let mut state = self.global_cooldown.lock().expect("pool cooldown lock");
            Self::record_hit(&mut state, &self.cooldown_config, base_ms, cap_ms)
        };
        if let Some(model) = model {
            let mut models = self.model_cooldowns.lock().expect("model cooldown lock");
            let state = models.entry(model.to_string()).or_default();
            Self::record_hit(state, &self.cooldown_config, base_ms, cap_ms);
        }
        tracing::warn!(
            cooldown_ms = global.cooldown_ms,
            pool_429_count = global.pool_429_count,
            already_blocked = global.was_already_blocked,
            model = model.unwrap_or("-"),
            "key pool: pool-level rate limit hit"
        );
        global
    }

    fn record_hit(
        state: &mut CooldownState,
        config: &PoolCooldownConfig,
        base_ms: Option<u64>,
        cap_ms: u64,
    ) -> PoolRateLimitHit {
        let now = Instant::now();
        state.prune(now);
        let was_already_blocked = state.remaining(now) > Duration::ZERO;
        state.hits.push_back(now);
        state.last_hit_at = Some(now);
        let count = state.hits.len() as u32;

        let cooldown_ms = match base_ms {
            Some(ms) => ms.min(cap_ms),
            None => config
                .base_ms
                .saturating_mul(2u64.saturating_pow(count.saturating_sub(1)))
                .min(cap_ms),
        };
        let until = now + Duration::from_millis(cooldown_ms);
        // Cooldown release is monotonic: never pull an existing one earlier.
        if state.cooldown_until.is_none_or(|existing| until > existing) {
            state.cooldown_until = Some(until);
        }
        PoolRateLimitHit {
            cooldown_ms,
            pool_429_count: count,
            was_already_blocked,
        }
    }

    /// Remaining pool cooldown: the larger of global and (when known) the
    /// model's own.
    pub fn pool_cooldown_remaining(&self, model: Option<&str>) -> Duration {
        let now = Instant::now();
        let mut remaining = self
            .global_cooldown
            .lock()
            .expect("pool cooldown lock")
            .remaining(now);
        if let Some(model) = model {
            if let Some(state) = self.model_cooldowns.lock().expect("model cooldown lock").get(model)
            {
                remaining = remaining.max(state.remaining(now));
            }
        }
        remaining
    }

    pub fn pool_429_count(&self) -> u32 {
        let mut state = self.global_cooldown.lock().expect("pool cooldown lock");
        state.prune(Instant::now());
        state.hits.len() as u32
    }

    /// More than one pool hit inside the window = burst.
    pub fn pool_burst_active(&self) -> bool {
        self.pool_429_count() > 1
    }

    /// Account-level 429: several *distinct* keys rate-limited within a
    /// short window means the whole account is throttled, not one key.
    pub fn account_level_429(&self) -> bool {
        let recent = self.recent_key_429s.lock().expect("recent 429 lock");
        let now = Instant::now();
        let mut distinct: Vec<usize> = recent
            .iter()
            .filter(|(_, at)| now.duration_since(*at) <= ACCOUNT_DETECTION_WINDOW)
            .map(|(index, _)| *index)
            .collect();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.len() >= 2
    }

    /// Compare each key's p50 to the pool average; quarantine outliers above
    /// `threshold`, recover below threshold·0.8. Meant to run periodically.
    pub fn detect_slow_keys(&self, slow_key_threshold: f64) {
        let profiles: Vec<LatencyProfile> =
            self.credentials.iter().map(|c| c.latency.profile()).collect();
        let with_samples: Vec<u64> = profiles
            .iter()
            .filter(|p| p.count > 0)
            .map(|p| p.p50_ms)
            .collect();
        if with_samples.len() < 2 {
            return;
        }
        let pool_avg = with_samples.iter().sum::<u64>() as f64 / with_samples.len() as f64;
        if pool_avg <= 0.0 {
            return;
        }
        for (cred, profile) in self.credentials.iter().zip(&profiles) {
            if profile.count == 0 {
                continue;
            }
            let ratio = profile.p50_ms as f64 / pool_avg;
            let quarantined = cred.quarantined.load(Ordering::Acquire);
            if !quarantined && ratio >= slow_key_threshold {
                cred.quarantined.store(true, Ordering::Release);
                tracing::warn!(key = %cred.id, ratio, "key pool: quarantined slow key");
            } else if quarantined && ratio < slow_key_threshold * SLOW_KEY_RECOVERY_FACTOR {
                cred.quarantined.store(false, Ordering::Release);
                tracing::info!(key = %cred.id, ratio, "key pool: slow key recovered");
            }
        }
    }

    pub fn key_snapshot(&self, index: usize) -> Option<KeySnapshot> {
        let cred = self.credentials.get(index)?;
        let cooldown_remaining_ms = cred
            .cooldown_until_ms
            .load(Ordering::Acquire)
            .saturating_sub(self.now_ms());
        let in_flight = cred.in_flight();
        let breaker_state = cred.breaker.state();
        let available = cooldown_remaining_ms == 0
            && in_flight < cred.max_concurrency
            && breaker_state != BreakerState::Open
            && !cred.quarantined.load(Ordering::Acquire);
        Some(KeySnapshot {
            index,
            id: cred.id.clone(),
            provider: cred.provider.clone(),
            in_flight,
            max_concurrency: cred.max_concurrency,
            breaker_state: breaker_state.as_str(),
            cooldown_remaining_ms,
            rate_limit_hits: cred.rate_limit_hits.load(Ordering::Acquire),
            quarantined: cred.quarantined.load(Ordering::Acquire),
            latency: cred.latency.profile().into(),
            available,
        })
    }

    pub fn all_key_snapshots(&self) -> Vec<KeySnapshot> {
        (0..self.credentials.len())
            .filter_map(|i| self.key_snapshot(i))
            .collect()
    }

    /// Largest p95 across keys, feeding the adaptive timeout.
    pub fn max_key_p95(&self) -> u64 {
        self.credentials
            .iter()
            .map(|c| c.latency.p95())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(id: &str, max_concurrency: usize) -> CredentialConfig {
        CredentialConfig {
            id: id.to_string(),
            key: format!("sk-{id}"),
            provider: "anthropic".to_string(),
            max_concurrency,
            tokens_per_minute: None,
        }
    }

    fn pool(configs: &[CredentialConfig]) -> KeyPool {
        KeyPool::new(configs, PoolCooldownConfig::default())
    }

    #[test]
    fn acquire_round_robins_across_keys() {
        let p = pool(&[cred("a", 4), cred("b", 4), cred("c", 4)]);
        let first = p.acquire("anthropic", &[]).unwrap();
        let second = p.acquire("anthropic", &[]).unwrap();
        let third = p.acquire("anthropic", &[]).unwrap();
        let mut seen = [first, second, third];
        seen.sort_unstable();
        assert_eq!(seen, [0, 1, 2]);
    }

    #[test]
    fn acquire_respects_concurrency_cap() {
        let p = pool(&[cred("a", 1)]);
        assert!(p.acquire("anthropic", &[]).is_some());
        assert!(p.acquire("anthropic", &[]).is_none());
        p.release(0);
        assert!(p.acquire("anthropic", &[]).is_some());
    }

    #[test]
    fn acquire_skips_excluded_and_wrong_provider() {
        let mut other = cred("g", 4);
        other.provider = "openai-compat".to_string();
        let p = pool(&[cred("a", 4), other]);
        assert!(p.acquire("openai-compat", &[]).is_some());
        assert!(p.acquire("anthropic", &[0]).is_none());
    }

    #[test]
    fn acquire_skips_cooling_keys() {
        let p = pool(&[cred("a", 4), cred("b", 4)]);
        p.set_key_cooldown(0, 60_000);
        for _ in 0..4 {
            let idx = p.acquire("anthropic", &[]).unwrap();
            assert_eq!(idx, 1);
            p.release(idx);
        }
    }

    #[test]
    fn acquire_skips_open_breaker() {
        let p = pool(&[cred("a", 4), cred("b", 4)]);
        for _ in 0..10 {
            p.record_failure(0, ErrorType::ServerError);
        }
        let idx = p.acquire("anthropic", &[]).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn release_returns_in_flight_to_zero() {
        let p = pool(&[cred("a", 2)]);
        let i1 = p.acquire("anthropic", &[]).unwrap();
        let i2 = p.acquire("anthropic", &[]).unwrap();
        p.release(i1);
        p.release(i2);
        assert_eq!(p.credential(0).unwrap().in_flight(), 0);
    }

    #[test]
    fn pool_hit_counts_slide_and_escalate() {
        let p = pool(&[cred("a", 4)]);
        let first = p.record_pool_rate_limit_hit(None, None, 60_000);
        assert_eq!(first.pool_429_count, 1);
        assert!(!first.was_already_blocked);
        assert_eq!(first.cooldown_ms, 1_000); // base · 2^0

        let second = p.record_pool_rate_limit_hit(None, None, 60_000);
        assert_eq!(second.pool_429_count, 2);
        assert!(second.was_already_blocked);
        assert_eq!(second.cooldown_ms, 2_000); // base · 2^1
        assert!(p.pool_burst_active());
    }

    #[test]
    fn retry_after_wins_over_exponential() {
        let p = pool(&[cred("a", 4)]);
        let hit = p.record_pool_rate_limit_hit(None, Some(5_500), 60_000);
        assert_eq!(hit.cooldown_ms, 5_500);
        assert!(p.pool_cooldown_remaining(None) > Duration::from_millis(5_000));
    }

    #[test]
    fn per_model_cooldown_is_tracked_separately() {
        let p = pool(&[cred("a", 4)]);
        p.record_pool_rate_limit_hit(Some("claude-opus-4-6"), Some(10_000), 60_000);
        assert!(
            p.pool_cooldown_remaining(Some("claude-opus-4-6")) > Duration::from_millis(9_000)
        );
        // The global hit also set a global cooldown; another model sees only
        // that, which here is the same 10 s baseline.
        assert!(p.pool_cooldown_remaining(Some("other-model")) > Duration::ZERO);
    }

    #[test]
    fn cooldown_release_is_monotonic() {
        let p = pool(&[cred("a", 4)]);
        p.record_pool_rate_limit_hit(None, Some(30_000), 60_000);
        let before = p.pool_cooldown_remaining(None);
        // A shorter follow-up hit must not pull the release earlier.
        p.record_pool_rate_limit_hit(None, Some(10), 60_000);
        let after = p.pool_cooldown_remaining(None);
        assert!(after >= before - Duration::from_millis(50));
    }

    #[test]
    fn account_level_requires_distinct_keys() {
        let p = pool(&[cred("a", 4), cred("b", 4)]);
        p.record_rate_limit(0, Some(100));
        assert!(!p.account_level_429(), "one key is not account-level");
        p.record_rate_limit(0, Some(100));
        assert!(!p.account_level_429(), "same key twice is still not");
        p.record_rate_limit(1, Some(100));
        assert!(p.account_level_429(), "two distinct keys inside the window");
    }

    #[test]
    fn dampened_cooldown_caps_at_one_second() {
        let p = pool(&[cred("a", 4)]);
        assert_eq!(p.dampened_key_cooldown_ms(30_000), 1_000);
        assert_eq!(p.dampened_key_cooldown_ms(400), 400);
    }

    #[test]
    fn slow_key_quarantine_and_recovery() {
        let p = pool(&[cred("fast", 4), cred("slow", 4)]);
        for _ in 0..10 {
            p.credential(0).unwrap().latency.record(100);
            p.credential(1).unwrap().latency.record(2_000);
        }
        p.detect_slow_keys(1.5);
        assert!(p.key_snapshot(1).unwrap().quarantined);
        assert!(!p.key_snapshot(0).unwrap().quarantined);
        assert!(p.acquire("anthropic", &[0]).is_none(), "quarantined key not served");

        // Enough fast samples push the slow key's p50 back under the bar.
        for _ in 0..64 {
            p.credential(1).unwrap().latency.record(100);
        }
        p.detect_slow_keys(1.5);
        assert!(!p.key_snapshot(1).unwrap().quarantined);
    }

    #[test]
    fn weighted_selection_prefers_the_healthier_key() {
        let p = KeyPool::new(
            &[cred("struggling", 4), cred("healthy", 4)],
            PoolCooldownConfig::default(),
        )
        .with_weighted_selection(true);

        // Key 0 carries failures and slow latency; key 1 is clean.
        p.record_failure(0, ErrorType::ServerError);
        p.record_failure(0, ErrorType::ServerError);
        for _ in 0..8 {
            p.credential(0).unwrap().latency.record(3_000);
            p.credential(1).unwrap().latency.record(150);
        }

        for _ in 0..4 {
            let idx = p.acquire("anthropic", &[]).unwrap();
            assert_eq!(idx, 1, "weighted selection should keep picking the healthy key");
            p.release(idx);
        }
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let configs = [CredentialConfig {
            id: "bucketed".into(),
            key: "sk-b".into(),
            provider: "anthropic".into(),
            max_concurrency: 100,
            tokens_per_minute: Some(60), // 1/sec
        }];
        let p = pool(&configs);
        let mut granted = 0;
        for _ in 0..70 {
            if let Some(idx) = p.acquire("anthropic", &[]) {
                p.release(idx);
                granted += 1;
            }
        }
        // Burst allows one minute's worth, then the bucket runs dry.
        assert!(granted >= 60 && granted < 70, "granted {granted}");
    }

    #[test]
    fn snapshots_expose_availability() {
        let p = pool(&[cred("a", 1)]);
        let snap = p.key_snapshot(0).unwrap();
        assert!(snap.available);
        let _ = p.acquire("anthropic", &[]).unwrap();
        let snap = p.key_snapshot(0).unwrap();
        assert!(!snap.available, "at capacity means unavailable");
        assert_eq!(snap.in_flight, 1);
    }
}
