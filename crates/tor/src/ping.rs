//! Shared round-trip estimate

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lowest estimate reported, however fast the samples
pub const MIN_PING: Duration = Duration::from_millis(10);

/// Smoothed circuit round-trip time, fed by circuit self-tests and read by
/// fetch timeouts. Clones share the estimate.
#[derive(Debug, Clone)]
pub struct PingEstimate {
    micros: Arc<AtomicU64>,
}

impl PingEstimate {
    pub fn new(initial: Duration) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(initial.as_micros() as u64)),
        }
    }

    /// Current estimate, never below [`MIN_PING`]
    pub fn get(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::Relaxed)).max(MIN_PING)
    }

    /// Fold in one sample, weighting the history 3:1
    pub fn record(&self, sample: Duration) {
        let sample = sample.as_micros() as u64;
        let _ = self
            .micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(old.saturating_mul(3).saturating_add(sample) / 4)
            });
    }
}

impl Default for PingEstimate {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_moves_towards_samples() {
        let ping = PingEstimate::new(Duration::from_millis(1000));
        ping.record(Duration::from_millis(200));
        assert_eq!(ping.get(), Duration::from_millis(800));

        for _ in 0..50 {
            ping.record(Duration::from_millis(200));
        }
        assert!(ping.get() < Duration::from_millis(210));
    }

    #[test]
    fn test_clones_share_estimate() {
        let ping = PingEstimate::default();
        let other = ping.clone();
        other.record(Duration::ZERO);
        assert_eq!(ping.get(), Duration::from_millis(750));
    }

    #[test]
    fn test_sub_millisecond_samples_keep_precision() {
        let ping = PingEstimate::new(Duration::from_millis(40));
        ping.record(Duration::from_micros(900));
        assert_eq!(ping.get(), Duration::from_micros(30_225));
    }

    #[test]
    fn test_fast_samples_never_reach_zero() {
        let ping = PingEstimate::default();
        for _ in 0..200 {
            ping.record(Duration::ZERO);
        }
        assert_eq!(ping.get(), MIN_PING);

        for _ in 0..30 {
            ping.record(Duration::from_micros(900));
        }
        assert_eq!(ping.get(), MIN_PING);
    }
}
