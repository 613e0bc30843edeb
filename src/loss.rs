use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashSet;

use crate::config::LossConfig;

/// Observable loss statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossStats {
    pub loss_rate: f64,
    pub sample_size: usize,
}

/// Sliding-window loss-rate estimator with asymmetric EWMA smoothing: it
/// reacts quickly to rising loss and relaxes slowly once loss subsides, so a
/// single good window does not immediately undo a burst of NACKs.
pub struct LossEstimator {
    config: LossConfig,
    sent: VecDeque<(Instant, u64)>,
    nacked: AHashSet<u64>,
    smoothed: f64,
}

impl LossEstimator {
    pub fn new(config: LossConfig) -> Self {
        Self {
            config,
            sent: VecDeque::new(),
            nacked: AHashSet::new(),
            smoothed: 0.0,
        }
    }

    /// Records a freshly sent sequence number.
    pub fn record_sent(&mut self, sequence: u64, now: Instant) {
        self.prune(now);
        self.sent.push_back((now, sequence));
    }

    /// Records that `sequence` was reported missing by a NACK.
    pub fn record_nacked(&mut self, sequence: u64, now: Instant) {
        self.prune(now);
        if self.sent.iter().any(|(_, s)| *s == sequence) {
            self.nacked.insert(sequence);
        }
        self.recompute();
    }

    /// Advances the window to `now`, recomputing the smoothed rate even if
    /// no new event occurred (periodic housekeeping calls this).
    pub fn tick(&mut self, now: Instant) {
        self.prune(now);
        self.recompute();
    }

    pub fn stats(&self) -> LossStats {
        LossStats {
            loss_rate: self.smoothed,
            sample_size: self.sent.len(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((sent_at, _)) = self.sent.front() {
            if now.saturating_duration_since(*sent_at) > self.config.window {
                let (_, seq) = self.sent.pop_front().unwrap();
                self.nacked.remove(&seq);
            } else {
                break;
            }
        }
    }

    fn recompute(&mut self) {
        let raw = if self.sent.is_empty() {
            0.0
        } else {
            self.nacked.len() as f64 / self.sent.len() as f64
        };

        self.smoothed = if self.smoothed == 0.0 {
            raw
        } else if raw > self.smoothed {
            self.config.rise_current_weight * self.smoothed + self.config.rise_sample_weight * raw
        } else {
            self.config.fall_current_weight * self.smoothed + self.config.fall_sample_weight * raw
        };
    }

    /// Window duration, exposed so the FEC encoder and pacer can reason about
    /// staleness without duplicating the configured constant.
    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Discards all history, returning to the state of a freshly constructed
    /// estimator. Called when a session disconnects.
    pub fn reset(&mut self) {
        self.sent.clear();
        self.nacked.clear();
        self.smoothed = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sends_means_zero_loss() {
        let estimator = LossEstimator::new(LossConfig::default());
        assert_eq!(estimator.stats().loss_rate, 0.0);
    }

    #[test]
    fn a_single_nack_raises_loss_immediately() {
        let mut estimator = LossEstimator::new(LossConfig::default());
        let t0 = Instant::now();
        for seq in 0..10 {
            estimator.record_sent(seq, t0);
        }
        estimator.record_nacked(3, t0);
        assert!(estimator.stats().loss_rate > 0.0);
    }

    #[test]
    fn loss_rate_relaxes_slower_than_it_rises() {
        let mut estimator = LossEstimator::new(LossConfig::default());
        let t0 = Instant::now();
        for seq in 0..10 {
            estimator.record_sent(seq, t0);
        }
        estimator.record_nacked(0, t0);
        let risen = estimator.stats().loss_rate;

        // A fresh, loss-free window should pull the estimate down, but not
        // all the way back to zero in a single step.
        let t1 = t0 + Duration::from_millis(1);
        for seq in 10..20 {
            estimator.record_sent(seq, t1);
        }
        estimator.tick(t1);
        let relaxed = estimator.stats().loss_rate;

        assert!(relaxed < risen);
        assert!(relaxed > 0.0);
    }

    #[test]
    fn entries_older_than_the_window_are_pruned() {
        let mut estimator = LossEstimator::new(LossConfig::default());
        let t0 = Instant::now();
        estimator.record_sent(0, t0);
        estimator.record_nacked(0, t0);
        assert_eq!(estimator.stats().sample_size, 1);

        let later = t0 + Duration::from_secs(3);
        estimator.tick(later);
        assert_eq!(estimator.stats().sample_size, 0);
    }
}
