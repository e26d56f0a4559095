// =============================================================================
// Gap-risk detection — time-weighted peak tracking
// =============================================================================
//
// Trailing stops assume the tape moves through every price on the way down;
// session-boundary gaps and sudden news drops do not. The tracker keeps a
// 45-minute window of prints and maintains a time-weighted peak: a sample's
// contribution decays linearly to half-weight as it ages out of the window,
// so one ancient spike cannot hold the peak forever while a sustained high
// keeps it honest.
//
// When the current print sits more than `gap_pct` below that peak and the
// position is already in its trailing life (TRAILING or PARTIAL), the exit
// engine closes immediately instead of waiting for the stop to be crossed.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Window over which the peak is tracked.
const WINDOW_MINUTES: i64 = 45;
/// Weight a sample decays to at the far edge of the window.
const EDGE_WEIGHT: f64 = 0.5;

/// Rolling time-weighted peak of a price series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeakTracker {
    samples: Vec<(DateTime<Utc>, f64)>,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a print and prune samples older than the window.
    pub fn record(&mut self, at: DateTime<Utc>, price: f64) {
        if price <= 0.0 {
            return;
        }
        self.samples.push((at, price));
        let cutoff = at - Duration::minutes(WINDOW_MINUTES);
        self.samples.retain(|(t, _)| *t >= cutoff);
    }

    /// The time-weighted peak at `now`, or `None` with no samples.
    pub fn peak(&self, now: DateTime<Utc>) -> Option<f64> {
        let window_secs = (WINDOW_MINUTES * 60) as f64;
        self.samples
            .iter()
            .map(|(t, price)| {
                let age = (now - *t).num_seconds().max(0) as f64;
                let weight = 1.0 - (1.0 - EDGE_WEIGHT) * (age / window_secs).min(1.0);
                price * weight
            })
            .fold(None, |acc: Option<f64>, w| {
                Some(acc.map_or(w, |a| a.max(w)))
            })
    }

    /// Drop percent from the weighted peak to `current` (positive numbers
    /// mean the tape is below the peak).
    pub fn drop_from_peak_pct(&self, now: DateTime<Utc>, current: f64) -> Option<f64> {
        let peak = self.peak(now)?;
        if peak <= 0.0 {
            return None;
        }
        Some((peak - current) / peak * 100.0)
    }

    /// Whether the drop from the weighted peak exceeds `gap_pct`.
    pub fn gap_detected(&self, now: DateTime<Utc>, current: f64, gap_pct: f64) -> bool {
        self.drop_from_peak_pct(now, current)
            .map(|drop| drop > gap_pct)
            .unwrap_or(false)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 15, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn fresh_peak_has_full_weight() {
        let mut tracker = PeakTracker::new();
        tracker.record(t(0), 100.0);
        assert!((tracker.peak(t(0)).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn old_peak_decays_toward_half_weight() {
        let mut tracker = PeakTracker::new();
        tracker.record(t(0), 100.0);
        // 44 minutes later the spike is nearly at edge weight.
        let peak = tracker.peak(t(44)).unwrap();
        assert!(peak < 100.0);
        assert!(peak > 50.0);
    }

    #[test]
    fn samples_age_out_of_the_window() {
        let mut tracker = PeakTracker::new();
        tracker.record(t(0), 100.0);
        tracker.record(t(50), 90.0); // prunes the first sample
        assert_eq!(tracker.sample_count(), 1);
        assert!((tracker.peak(t(50)).unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn sustained_high_beats_decayed_spike() {
        let mut tracker = PeakTracker::new();
        tracker.record(t(0), 105.0); // old spike
        tracker.record(t(40), 100.0); // recent level
        let peak = tracker.peak(t(40)).unwrap();
        // The spike decayed (105 × ~0.556 ≈ 58); the fresh 100 wins.
        assert!((peak - 100.0).abs() < 1.0);
    }

    #[test]
    fn gap_detection_at_two_percent() {
        let mut tracker = PeakTracker::new();
        tracker.record(t(0), 100.0);
        tracker.record(t(1), 100.0);

        assert!(!tracker.gap_detected(t(1), 98.5, 2.0), "1.5% drop is not a gap");
        assert!(tracker.gap_detected(t(1), 97.5, 2.0), "2.5% drop is a gap");
    }

    #[test]
    fn empty_tracker_never_detects() {
        let tracker = PeakTracker::new();
        assert!(!tracker.gap_detected(t(0), 100.0, 2.0));
        assert!(tracker.peak(t(0)).is_none());
    }
}
