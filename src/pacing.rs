// keymux — upstream pacing gate
//
// Counting semaphore over outbound upstream requests. Acquisition sleeps a
// small random admission jitter first so bursts of retries don't open their
// sockets in lockstep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct PacingGate {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    admission_jitter_ms: u64,
}

impl PacingGate {
    pub fn new(max_concurrent: usize, admission_jitter_ms: u64) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            admission_jitter_ms,
        }
    }

    /// Wait for an upstream slot. The permit releases on drop.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        if self.admission_jitter_ms > 0 {
            let jitter = rand::random_range(0..=self.admission_jitter_ms);
            if jitter > 0 {
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("pacing semaphore never closes")
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_release_on_drop() {
        let gate = PacingGate::new(2, 0);
        let a = gate.acquire().await;
        let _b = gate.acquire().await;
        assert_eq!(gate.available(), 0);
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_flight(), 1);
    }

    #[tokio::test]
    async fn third_acquire_waits_for_release() {
        let gate = Arc::new(PacingGate::new(1, 0));
        let held = gate.acquire().await;

        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.acquire().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "waiter should block while the permit is held");

        drop(held);
        let _permit = waiter.await.unwrap();
        assert_eq!(gate.available(), 0);
    }
}
