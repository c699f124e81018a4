// keymux — connection health monitor
//
// Repeated socket hangups usually mean the connection pool is full of
// half-dead keep-alive sockets. After `max_consecutive_hangups` in a row the
// monitor asks for a pool rebuild, at most once per recreation cooldown so a
// hangup storm can't thrash the client.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::config::ConnectionHealthConfig;

pub struct ConnectionHealthMonitor {
    consecutive_hangups: AtomicU32,
    last_recreation: Mutex<Option<Instant>>,
    max_consecutive: u32,
    recreation_cooldown: Duration,
}

impl ConnectionHealthMonitor {
    pub fn new(config: &ConnectionHealthConfig) -> Self {
        Self {
            consecutive_hangups: AtomicU32::new(0),
            last_recreation: Mutex::new(None),
            max_consecutive: config.max_consecutive_hangups,
            recreation_cooldown: Duration::from_millis(config.agent_recreation_cooldown_ms),
        }
    }

    /// Record one hangup. Returns true when the caller should rebuild the
    /// connection pool now.
    pub fn record_hangup(&self) -> bool {
        let count = self.consecutive_hangups.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(consecutive = count, "connection health: socket hangup");
        if count < self.max_consecutive {
            return false;
        }

        let mut last = self.last_recreation.lock().expect("conn health lock");
        if let Some(at) = *last {
            if at.elapsed() < self.recreation_cooldown {
                return false;
            }
        }
        *last = Some(Instant::now());
        self.consecutive_hangups.store(0, Ordering::Release);
        tracing::warn!(
            threshold = self.max_consecutive,
            "connection health: hangup threshold reached, requesting pool rebuild"
        );
        true
    }

    /// Any successful response breaks the streak.
    pub fn record_success(&self) {
        self.consecutive_hangups.store(0, Ordering::Release);
    }

    pub fn consecutive_hangups(&self) -> u32 {
        self.consecutive_hangups.load(Ordering::Acquire)
    }
}
