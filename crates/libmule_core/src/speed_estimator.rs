use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug)]
struct ProgressSnapshot {
    progress_bytes: u64,
    instant: Instant,
}

/// Estimates a transfer rate over a sliding window of per-tick snapshots of
/// a monotonically growing byte counter.
#[derive(Debug)]
pub struct RateEstimator {
    window: usize,
    snapshots: VecDeque<ProgressSnapshot>,
    bytes_per_second: u64,
}

impl RateEstimator {
    pub fn new(window_seconds: usize) -> Self {
        assert!(window_seconds > 1);
        Self {
            window: window_seconds,
            snapshots: VecDeque::with_capacity(window_seconds),
            bytes_per_second: 0,
        }
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second
    }

    pub fn time_remaining(&self, remaining_bytes: u64) -> Option<Duration> {
        if self.bytes_per_second == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            remaining_bytes as f64 / self.bytes_per_second as f64,
        ))
    }

    pub fn add_snapshot(&mut self, progress_bytes: u64, instant: Instant) {
        let current = ProgressSnapshot {
            progress_bytes,
            instant,
        };
        if self.snapshots.len() == self.window {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(current);

        let first = match self.snapshots.front() {
            Some(first) => *first,
            None => return,
        };
        let elapsed = instant.saturating_duration_since(first.instant);
        if elapsed.is_zero() {
            return;
        }
        // The counter may have been reset (e.g. transfer resumed), so saturate.
        let diff = progress_bytes.saturating_sub(first.progress_bytes);
        self.bytes_per_second = (diff as f64 / elapsed.as_secs_f64()) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_over_window() {
        let mut e = RateEstimator::new(5);
        let start = Instant::now();
        assert_eq!(e.bps(), 0);
        for i in 0..5u64 {
            e.add_snapshot(i * 1000, start + Duration::from_secs(i));
        }
        assert_eq!(e.bps(), 1000);

        // Window slides: only the last 5 snapshots count.
        e.add_snapshot(4000 + 10_000, start + Duration::from_secs(5));
        assert_eq!(e.bps(), (14_000 - 1000) / 4);
    }

    #[test]
    fn test_time_remaining() {
        let mut e = RateEstimator::new(2);
        let start = Instant::now();
        assert!(e.time_remaining(100).is_none());
        e.add_snapshot(0, start);
        e.add_snapshot(100, start + Duration::from_secs(1));
        assert_eq!(e.time_remaining(500), Some(Duration::from_secs(5)));
    }
}
