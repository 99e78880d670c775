use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::time::Instant;

#[derive(Default)]
struct PingState {
    outstanding: VecDeque<Instant>,
    rtts_us: Vec<f64>,
}

/// FIFO correlation of `ping` sends with `PONG:` replies.
///
/// Each PONG is matched to the oldest unmatched send. The firmware echoes no
/// sequence number, so a lost or reordered PONG shifts every later match.
#[derive(Clone, Default)]
pub struct PingTracker {
    state: Arc<Mutex<PingState>>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears outstanding sends and collected round trips.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.outstanding.clear();
        state.rtts_us.clear();
    }

    pub fn record_send(&self, sent_at: Instant) {
        self.lock().outstanding.push_back(sent_at);
    }

    /// Forgets the most recent send (its write failed).
    pub fn withdraw_last(&self) -> bool {
        self.lock().outstanding.pop_back().is_some()
    }

    /// Matches a PONG received at `received_at`; returns the round trip in
    /// microseconds, or `None` when nothing was outstanding.
    pub fn record_pong(&self, received_at: Instant) -> Option<f64> {
        let mut state = self.lock();
        let sent_at = state.outstanding.pop_front()?;
        let rtt_us = received_at.saturating_duration_since(sent_at).as_secs_f64() * 1e6;
        state.rtts_us.push(rtt_us);
        Some(rtt_us)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn round_trips(&self) -> Vec<f64> {
        self.lock().rtts_us.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Round-trip statistics in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingStats {
    pub sent: usize,
    pub received: usize,
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    pub median_us: f64,
    /// Sample standard deviation; 0 for a single round trip.
    pub stdev_us: f64,
    pub rtts_us: Vec<f64>,
}

impl PingStats {
    /// `None` when no round trips were collected.
    pub fn from_round_trips(sent: usize, rtts_us: Vec<f64>) -> Option<Self> {
        if rtts_us.is_empty() {
            return None;
        }

        let n = rtts_us.len();
        let mut sorted = rtts_us.clone();
        sorted.sort_by(f64::total_cmp);

        let mean = rtts_us.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        let stdev = if n > 1 {
            let ss: f64 = rtts_us.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        } else {
            0.0
        };

        Some(Self {
            sent,
            received: n,
            min_us: sorted[0],
            max_us: sorted[n - 1],
            mean_us: mean,
            median_us: median,
            stdev_us: stdev,
            rtts_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pongs_match_oldest_send_first() {
        let tracker = PingTracker::new();
        let t0 = Instant::now();
        tracker.record_send(t0);
        tracker.record_send(t0 + Duration::from_millis(10));
        tracker.record_send(t0 + Duration::from_millis(20));

        let first = tracker.record_pong(t0 + Duration::from_millis(5)).unwrap();
        assert!((first - 5_000.0).abs() < 1e-6);
        let second = tracker.record_pong(t0 + Duration::from_millis(16)).unwrap();
        assert!((second - 6_000.0).abs() < 1e-6);
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn match_count_is_min_of_sends_and_pongs() {
        for (sends, pongs) in [(5usize, 3usize), (3, 5), (0, 2), (4, 4)] {
            let tracker = PingTracker::new();
            let t0 = Instant::now();
            for i in 0..sends {
                tracker.record_send(t0 + Duration::from_millis(i as u64));
            }
            for i in 0..pongs {
                tracker.record_pong(t0 + Duration::from_millis(100 + i as u64));
            }
            let rtts = tracker.round_trips();
            assert_eq!(rtts.len(), sends.min(pongs));
            assert!(rtts.iter().all(|rtt| *rtt >= 0.0));
        }
    }

    #[test]
    fn pong_before_send_clamps_to_zero() {
        let tracker = PingTracker::new();
        let t0 = Instant::now();
        tracker.record_send(t0 + Duration::from_millis(3));
        assert_eq!(tracker.record_pong(t0), Some(0.0));
    }

    #[test]
    fn withdrawn_send_is_never_matched() {
        let tracker = PingTracker::new();
        let t0 = Instant::now();
        tracker.record_send(t0);
        assert!(tracker.withdraw_last());
        assert!(!tracker.withdraw_last());
        assert_eq!(tracker.record_pong(t0), None);
    }

    #[test]
    fn stats_use_sample_stdev_and_true_median() {
        let stats = PingStats::from_round_trips(4, vec![400.0, 100.0, 300.0, 200.0]).unwrap();
        assert_eq!(stats.min_us, 100.0);
        assert_eq!(stats.max_us, 400.0);
        assert_eq!(stats.mean_us, 250.0);
        assert_eq!(stats.median_us, 250.0);
        // sqrt(50000 / 3)
        assert!((stats.stdev_us - 129.099_444_873_580_56).abs() < 1e-9);
        assert_eq!(stats.rtts_us, vec![400.0, 100.0, 300.0, 200.0]);

        let single = PingStats::from_round_trips(1, vec![42.0]).unwrap();
        assert_eq!(single.stdev_us, 0.0);
        assert!(PingStats::from_round_trips(3, Vec::new()).is_none());
    }
}
