// keymux — latency window
//
// Bounded ring of recent successful latencies. Percentiles are computed on
// read over a sorted copy; the window is small (default 64 samples) so the
// scan is cheap next to a network round-trip.

use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

/// Point-in-time percentile view.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyProfile {
    pub count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, latency_ms: u64) {
        let mut samples = self.samples.lock().expect("latency window lock");
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    pub fn profile(&self) -> LatencyProfile {
        let samples = self.samples.lock().expect("latency window lock");
        if samples.is_empty() {
            return LatencyProfile::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        LatencyProfile {
            count: sorted.len(),
            p50_ms: percentile(&sorted, 50),
            p95_ms: percentile(&sorted, 95),
        }
    }

    pub fn p50(&self) -> u64 {
        self.profile().p50_ms
    }

    pub fn p95(&self) -> u64 {
        self.profile().p95_ms
    }

    pub fn count(&self) -> usize {
        self.samples.lock().expect("latency window lock").len()
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    debug_assert!(!sorted.is_empty());
    let rank = (pct * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zeros() {
        let w = LatencyWindow::default();
        assert_eq!(w.profile(), LatencyProfile::default());
    }

    #[test]
    fn single_sample_is_both_percentiles() {
        let w = LatencyWindow::default();
        w.record(120);
        let p = w.profile();
        assert_eq!(p.count, 1);
        assert_eq!(p.p50_ms, 120);
        assert_eq!(p.p95_ms, 120);
    }

    #[test]
    fn percentiles_over_uniform_spread() {
        let w = LatencyWindow::new(100);
        for ms in 1..=100 {
            w.record(ms);
        }
        let p = w.profile();
        assert_eq!(p.count, 100);
        assert_eq!(p.p50_ms, 50);
        assert_eq!(p.p95_ms, 95);
    }

    #[test]
    fn ring_evicts_oldest() {
        let w = LatencyWindow::new(4);
        for ms in [1, 2, 3, 4, 1000] {
            w.record(ms);
        }
        assert_eq!(w.count(), 4);
        // The 1ms sample fell off; the window is now 2,3,4,1000.
        assert_eq!(w.p50(), 3);
        assert_eq!(w.p95(), 1000);
    }
}
