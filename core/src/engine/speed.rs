//! Exponential-moving-average speed/ETA tracker, sampled once per progress-pump tick.
//!
//! See SPEC_FULL.md §4.6 "Speed/ETA": `instant = Δbytes / Δt`, `ema ← α·instant +
//! (1-α)·ema` seeded on the first sample, `eta = (total - downloaded) / ema`. Per the
//! resolved Open Question (§9), the same tracker is used for both the multi-segment and
//! single-connection download paths — there is nothing path-specific about an EMA over
//! a byte counter.

use std::time::{Duration, Instant};

const ALPHA: f64 = 0.3;
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Per-download EMA state. Not `Clone`; the engine keeps one behind a `Mutex` per
/// active download.
#[derive(Debug, Default)]
pub struct SpeedTracker {
    ema_bps: Option<f64>,
    last_bytes: u64,
    last_sample: Option<Instant>,
}

impl SpeedTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a new `(downloaded_bytes, total_size)` observation and returns the
    /// current `(speed_bps, eta_secs)`. Calls within [`MIN_SAMPLE_INTERVAL`] of the last
    /// one are ignored (returning the last computed values) to avoid division-by-tiny-
    /// duration artifacts.
    pub fn sample(&mut self, downloaded_bytes: u64, total_size: u64) -> (f64, u64) {
        let now = Instant::now();
        if let Some(last_sample) = self.last_sample {
            let elapsed = now.duration_since(last_sample);
            if elapsed < MIN_SAMPLE_INTERVAL {
                return (self.ema_bps.unwrap_or(0.0), self.eta(downloaded_bytes, total_size));
            }
            let instant_bps =
                downloaded_bytes.saturating_sub(self.last_bytes) as f64 / elapsed.as_secs_f64();
            self.ema_bps = Some(match self.ema_bps {
                Some(prev) => ALPHA * instant_bps + (1.0 - ALPHA) * prev,
                None => instant_bps,
            });
        }
        self.last_bytes = downloaded_bytes;
        self.last_sample = Some(now);
        (self.ema_bps.unwrap_or(0.0), self.eta(downloaded_bytes, total_size))
    }

    fn eta(&self, downloaded_bytes: u64, total_size: u64) -> u64 {
        match self.ema_bps {
            Some(ema) if ema > 0.0 && total_size > downloaded_bytes => {
                ((total_size - downloaded_bytes) as f64 / ema) as u64
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_first_sample_has_no_speed_yet() {
        let mut tracker = SpeedTracker::new();
        let (speed, eta) = tracker.sample(0, 1000);
        assert_eq!(speed, 0.0);
        assert_eq!(eta, 0);
    }

    #[test]
    fn test_second_sample_computes_ema_seeded_with_instant() {
        let mut tracker = SpeedTracker::new();
        tracker.sample(0, 1000);
        sleep(Duration::from_millis(60));
        let (speed, _) = tracker.sample(100, 1000);
        assert!(speed > 0.0);
    }

    #[test]
    fn test_rapid_successive_samples_are_ignored() {
        let mut tracker = SpeedTracker::new();
        tracker.sample(0, 1000);
        let (speed_a, _) = tracker.sample(10, 1000);
        let (speed_b, _) = tracker.sample(999_999, 1000);
        assert_eq!(speed_a, speed_b, "sub-50ms samples must not move the EMA");
    }

    #[test]
    fn test_eta_zero_when_ema_not_yet_established() {
        let mut tracker = SpeedTracker::new();
        let (_, eta) = tracker.sample(500, 1000);
        assert_eq!(eta, 0);
    }

    #[test]
    fn test_eta_zero_when_total_size_unknown() {
        let mut tracker = SpeedTracker::new();
        tracker.sample(0, 0);
        sleep(Duration::from_millis(60));
        let (_, eta) = tracker.sample(100, 0);
        assert_eq!(eta, 0);
    }
}
