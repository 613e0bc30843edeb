use std::time::Duration;

use crate::config::RttConfig;

/// Smoothed round-trip time and retransmission timeout, following the
/// Jacobson/Karels estimator (RFC 6298's SRTT/RTTVAR/RTO update rule).
pub struct RttEstimator {
    config: RttConfig,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl RttEstimator {
    pub fn new(config: RttConfig) -> Self {
        let rto = config.min_rto;
        Self {
            config,
            srtt: None,
            rttvar: Duration::ZERO,
            rto,
        }
    }

    /// Folds in a new RTT sample (typically a PONG's round-trip time).
    pub fn update(&mut self, sample: Duration) {
        self.srtt = Some(match self.srtt {
            None => {
                self.rttvar = sample / 2;
                sample
            }
            Some(srtt) => {
                let delta = abs_diff(sample, srtt);
                self.rttvar = weighted(self.rttvar, delta, self.config.beta);
                weighted(srtt, sample, self.config.alpha)
            }
        });

        let srtt = self.srtt.unwrap();
        let rttvar_term = (self.rttvar * 4).max(self.config.min_rttvar_floor);
        let rto = srtt + rttvar_term;
        self.rto = rto.clamp(self.config.min_rto, self.config.max_rto);
    }

    pub fn srtt(&self) -> Duration {
        self.srtt.unwrap_or(Duration::ZERO)
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b { a - b } else { b - a }
}

/// `(1 - weight) * base + weight * sample`, done in floating-point
/// milliseconds to match the textbook formulation, then converted back.
fn weighted(base: Duration, sample: Duration, weight: f64) -> Duration {
    let base_ms = base.as_secs_f64() * 1000.0;
    let sample_ms = sample.as_secs_f64() * 1000.0;
    let result_ms = (1.0 - weight) * base_ms + weight * sample_ms;
    Duration::from_secs_f64((result_ms.max(0.0)) / 1000.0)
}
