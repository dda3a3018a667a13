// Sliding-window byte accounting per direction (spec §4.5 "Policies").

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks bytes transferred over a trailing window of `window` seconds.
/// One instance per direction (send/receive) per Transport.
pub struct BandwidthMonitor {
    window: Duration,
    entries: VecDeque<(Instant, u64)>,
    total: u64,
}

impl BandwidthMonitor {
    pub fn new(window_secs: u64) -> Self {
        BandwidthMonitor {
            window: Duration::from_secs(window_secs.max(1)),
            entries: VecDeque::new(),
            total: 0,
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some(&(t, bytes)) = self.entries.front() {
            if now.duration_since(t) > self.window {
                self.entries.pop_front();
                self.total -= bytes;
            } else {
                break;
            }
        }
    }

    pub fn add(&mut self, bytes: u64) {
        let now = Instant::now();
        self.evict_stale(now);
        self.entries.push_back((now, bytes));
        self.total += bytes;
    }

    /// Bytes/sec averaged over the window's elapsed span (or the window
    /// length once it's full).
    pub fn get_utilization(&mut self) -> f64 {
        let now = Instant::now();
        self.evict_stale(now);
        if self.total == 0 {
            return 0.0;
        }
        self.total as f64 / self.window.as_secs_f64()
    }

    /// `limit < 0` disables the check (spec: "-1 disables").
    pub fn is_bandwidth_violated(&mut self, limit: i64) -> bool {
        if limit < 0 {
            return false;
        }
        self.get_utilization() > limit as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn s6_second_write_suppressed_within_limit_window() {
        let mut mon = BandwidthMonitor::new(10);
        assert!(!mon.is_bandwidth_violated(1000));
        mon.add(2000);
        assert!(mon.is_bandwidth_violated(1000));
    }

    #[test]
    fn negative_limit_never_violates() {
        let mut mon = BandwidthMonitor::new(10);
        mon.add(1_000_000);
        assert!(!mon.is_bandwidth_violated(-1));
    }

    #[test]
    fn zero_bytes_is_never_violated() {
        let mut mon = BandwidthMonitor::new(10);
        assert!(!mon.is_bandwidth_violated(0));
    }
}
