// keymux — credential waiter queue
//
// Bounded FIFO of requests blocked on credential availability. Each entry
// holds a single-shot sender; the waiter owns the receiver and races it
// against its own timeout. Waiters that time out simply drop the receiver,
// so `wake_next` skips dead entries.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
#[error("waiter queue is full ({max} entries)")]
pub struct QueueFull {
    pub max: usize,
}

struct Waiter {
    request_id: String,
    enqueued_at: Instant,
    wake: oneshot::Sender<()>,
}

pub struct WaiterQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    max_size: usize,
}

impl WaiterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    /// Join the queue. The returned receiver fires when a credential frees
    /// up; the caller is responsible for racing it against its timeout.
    pub fn enqueue(&self, request_id: &str) -> Result<oneshot::Receiver<()>, QueueFull> {
        let mut waiters = self.waiters.lock().expect("waiter queue lock");
        // Dead entries (timed out, receiver dropped) don't count against
        // capacity.
        waiters.retain(|w| !w.wake.is_closed());
        if waiters.len() >= self.max_size {
            return Err(QueueFull { max: self.max_size });
        }
        let (tx, rx) = oneshot::channel();
        waiters.push_back(Waiter {
            request_id: request_id.to_string(),
            enqueued_at: Instant::now(),
            wake: tx,
        });
        Ok(rx)
    }

    /// Wake the head waiter, skipping entries whose receiver is gone.
    /// Called on every credential release.
    pub fn wake_next(&self) {
        let mut waiters = self.waiters.lock().expect("waiter queue lock");
        while let Some(waiter) = waiters.pop_front() {
            let waited = waiter.enqueued_at.elapsed();
            if waiter.wake.send(()).is_ok() {
                tracing::debug!(
                    request_id = %waiter.request_id,
                    waited_ms = waited.as_millis() as u64,
                    "waiter queue: woke head"
                );
                return;
            }
            // Receiver dropped (timeout or disconnect) — try the next one.
        }
    }

    pub fn len(&self) -> usize {
        let mut waiters = self.waiters.lock().expect("waiter queue lock");
        waiters.retain(|w| !w.wake.is_closed());
        waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wakes_in_fifo_order() {
        let q = WaiterQueue::new(4);
        let mut first = q.enqueue("req-1").unwrap();
        let mut second = q.enqueue("req-2").unwrap();

        q.wake_next();
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());

        q.wake_next();
        assert!(second.try_recv().is_ok());
    }

    #[tokio::test]
    async fn rejects_when_full() {
        let q = WaiterQueue::new(2);
        let _a = q.enqueue("req-1").unwrap();
        let _b = q.enqueue("req-2").unwrap();
        assert!(q.enqueue("req-3").is_err());
    }

    #[tokio::test]
    async fn dropped_waiters_free_capacity_and_are_skipped() {
        let q = WaiterQueue::new(2);
        let dead = q.enqueue("req-1").unwrap();
        let mut live = q.enqueue("req-2").unwrap();
        drop(dead);

        // Capacity freed by the dead entry.
        let _c = q.enqueue("req-3").unwrap();

        // Wake skips the dead head and reaches the live waiter.
        q.wake_next();
        assert!(live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn waiter_times_out_without_wake() {
        let q = WaiterQueue::new(2);
        let rx = q.enqueue("req-1").unwrap();
        let result = tokio::time::timeout(Duration::from_millis(20), rx).await;
        assert!(result.is_err(), "no wake means the waiter's own timeout fires");
    }
}
