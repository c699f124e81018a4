// keymux — application state
//
// Composition root. Everything here lives for the process lifetime; the
// request handler only ever sees this through cheap clones.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::ProxyConfig;
use crate::conn_health::ConnectionHealthMonitor;
use crate::keypool::{KeyPool, KeySnapshot};
use crate::pacing::PacingGate;
use crate::queue::WaiterQueue;
use crate::router::{ModelRouter, PoolView};
use crate::stats::{EventBus, ProxyStats};
use crate::trace::TraceStore;

const TRACE_STORE_CAPACITY: usize = 512;
const PACING_ADMISSION_JITTER_MS: u64 = 25;

// ── HTTP clients ────────────────────────────────────────────────────────────

/// The shared connection pool plus a poolless client for fresh-connection
/// retries. The pooled client is swapped wholesale when the health monitor
/// asks for a rebuild.
pub struct HttpClients {
    pooled: RwLock<reqwest::Client>,
    fresh: reqwest::Client,
}

impl HttpClients {
    pub fn new() -> Self {
        Self {
            pooled: RwLock::new(Self::build_pooled()),
            fresh: reqwest::Client::builder()
                .pool_max_idle_per_host(0)
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build fresh HTTP client"),
        }
    }

    // No client-wide timeout: the per-attempt adaptive deadline is set on
    // each request instead. The socket-level connect timeout still applies.
    fn build_pooled() -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build pooled HTTP client")
    }

    pub fn pooled(&self) -> reqwest::Client {
        self.pooled.read().expect("http client lock").clone()
    }

    pub fn fresh(&self) -> reqwest::Client {
        self.fresh.clone()
    }

    /// Drop the old pool. In-flight requests keep their cloned client alive;
    /// new requests dial fresh sockets.
    pub fn rebuild(&self) {
        let mut pooled = self.pooled.write().expect("http client lock");
        *pooled = Self::build_pooled();
        tracing::warn!("http clients: connection pool rebuilt");
    }
}

impl Default for HttpClients {
    fn default() -> Self {
        Self::new()
    }
}

// ── PoolView bridge ─────────────────────────────────────────────────────────

struct KeyPoolView {
    keys: Arc<KeyPool>,
}

impl PoolView for KeyPoolView {
    fn key_snapshots(&self) -> Vec<KeySnapshot> {
        self.keys.all_key_snapshots()
    }
}

// ── AppState ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub keys: Arc<KeyPool>,
    pub router: Option<Arc<ModelRouter>>,
    pub queue: Arc<WaiterQueue>,
    pub pacing: Arc<PacingGate>,
    pub conn_health: Arc<ConnectionHealthMonitor>,
    pub stats: Arc<ProxyStats>,
    pub traces: Arc<TraceStore>,
    pub events: EventBus,
    pub clients: Arc<HttpClients>,
    pub global_in_flight: Arc<AtomicUsize>,
    /// Requests currently sleeping in an admission hold.
    pub holds_in_progress: Arc<AtomicUsize>,
    pub start_time: Instant,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Self {
        let stats = Arc::new(ProxyStats::default());
        let keys = Arc::new(
            KeyPool::new(&config.credentials, config.pool_cooldown.clone())
                .with_weighted_selection(config.weighted_selection),
        );

        let router = config.model_routing.as_ref().map(|routing| {
            let default_provider = config
                .providers
                .first()
                .map(|p| p.name.as_str())
                .unwrap_or("anthropic");
            let mut router =
                ModelRouter::new(routing.clone(), stats.router.clone(), default_provider);
            router.set_pool_view(Arc::new(KeyPoolView { keys: keys.clone() }));
            Arc::new(router)
        });

        tracing::info!(
            keys = keys.len(),
            providers = config.providers.len(),
            routing = router.as_ref().map(|r| r.is_enabled()).unwrap_or(false),
            "state initialised"
        );

        Self {
            queue: Arc::new(WaiterQueue::new(config.queue_size)),
            pacing: Arc::new(PacingGate::new(
                config.max_concurrent_upstream,
                PACING_ADMISSION_JITTER_MS,
            )),
            conn_health: Arc::new(ConnectionHealthMonitor::new(&config.connection_health)),
            traces: Arc::new(TraceStore::new(TRACE_STORE_CAPACITY)),
            events: EventBus::default(),
            clients: Arc::new(HttpClients::new()),
            global_in_flight: Arc::new(AtomicUsize::new(0)),
            holds_in_progress: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
            keys,
            stats,
            router,
        }
    }

    /// The router, but only when routing is enabled (not merely configured).
    pub fn active_router(&self) -> Option<&Arc<ModelRouter>> {
        self.router.as_ref().filter(|r| r.is_enabled())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("proxy marked as READY");
    }
}
