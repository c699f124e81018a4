// keymux — per-credential circuit breaker
//
// closed: passing traffic, counting failures in a sliding window.
// open:   rejecting, cooldown armed.
// half-open: one trial call; success closes, failure re-opens.
//
// The read path (`allow_request`) is atomics-only; transitions go through
// compare_exchange so concurrent observers agree on a single winner.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `window` that trip the circuit.
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted.
    pub window: Duration,
    /// How long the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    /// Millis since `epoch` when the circuit opened; 0 while closed.
    opened_at_ms: AtomicU64,
    /// Recent failure instants, pruned to the window on each push.
    failures: Mutex<Vec<Instant>>,
    epoch: Instant,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_ms: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
            epoch: Instant::now(),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// True when a request may pass. An open circuit whose cooldown has
    /// elapsed transitions to half-open and lets exactly one caller through.
    pub fn allow_request(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_HALF_OPEN => false, // a trial call is already in flight
            STATE_OPEN => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                let elapsed = self.now_ms().saturating_sub(opened);
                if elapsed < self.config.cooldown.as_millis() as u64 {
                    return false;
                }
                // Cooldown elapsed — the caller that wins this exchange owns
                // the trial call.
                self.state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .map(|_| {
                        tracing::info!("circuit breaker: open -> half-open (trial call)");
                    })
                    .is_ok()
            }
            _ => true,
        }
    }

    /// A success closes a half-open circuit and clears the failure window.
    pub fn record_success(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev != STATE_CLOSED {
            tracing::info!("circuit breaker: closed after successful call");
        }
        self.opened_at_ms.store(0, Ordering::Release);
        self.failures.lock().expect("breaker window lock").clear();
    }

    /// A failure re-opens a half-open circuit immediately, or trips a closed
    /// one when the window fills.
    pub fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_HALF_OPEN {
            if self
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.opened_at_ms.store(self.now_ms(), Ordering::Release);
                tracing::warn!("circuit breaker: trial call failed, re-opened");
            }
            return;
        }

        let window_count = {
            let mut failures = self.failures.lock().expect("breaker window lock");
            let now = Instant::now();
            failures.retain(|at| now.duration_since(*at) < self.config.window);
            failures.push(now);
            failures.len()
        };

        if window_count >= self.config.failure_threshold
            && self
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            tracing::warn!(
                failures = window_count,
                threshold = self.config.failure_threshold,
                "circuit breaker: tripped open"
            );
        }
    }

    /// Failure count currently inside the sliding window.
    pub fn failure_count(&self) -> usize {
        let mut failures = self.failures.lock().expect("breaker window lock");
        let now = Instant::now();
        failures.retain(|at| now.duration_since(*at) < self.config.window);
        failures.len()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
