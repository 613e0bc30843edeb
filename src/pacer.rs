use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::config::PacerConfig;

/// Decouples datagram enqueue from egress: the caller pushes serialized
/// datagrams in send order, and a periodic tick drains them at a rate
/// derived from the current loss estimate.
///
/// The pacer itself does no I/O and owns no timer; `MediaTransport` drives it
/// with a `tokio::time::interval` at `config.tick` granularity and hands the
/// drained datagrams to the substrate. Keeping the rate arithmetic here,
/// separate from the timer loop, makes it testable without real time
/// passing.
pub struct Pacer {
    config: PacerConfig,
    queue: VecDeque<Bytes>,
    /// Fractional packet budget left over from the previous tick (e.g. a
    /// 750pps rate at a 5ms tick allows 3.75 packets/tick; without this,
    /// every tick truncates to 3 and the sustained rate drifts 20% low).
    carry: f64,
}

impl Pacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            carry: 0.0,
        }
    }

    pub fn enqueue(&mut self, datagram: Bytes) {
        self.queue.push_back(datagram);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains the FIFO for one tick of duration `elapsed`, at the rate
    /// implied by `loss_rate`, returning the datagrams to send now in
    /// enqueue order. The fractional remainder of the tick's budget carries
    /// forward to the next tick rather than being dropped.
    pub fn drain_tick(&mut self, elapsed: Duration, loss_rate: f64) -> Vec<Bytes> {
        let rate = target_rate(&self.config, loss_rate);
        let budget = self.carry + (rate as f64) * elapsed.as_secs_f64();
        let allowed = budget.floor() as usize;
        let take = allowed.min(self.queue.len());

        self.carry = if take < allowed {
            // Nothing queued to spend the rest of the budget on; don't bank
            // it for a later burst once the queue fills back up.
            0.0
        } else {
            budget - allowed as f64
        };

        self.queue.drain(..take).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.carry = 0.0;
    }
}

fn target_rate(config: &PacerConfig, loss_rate: f64) -> u32 {
    config
        .rate_table
        .iter()
        .find(|(bound, _)| loss_rate < *bound)
        .map(|(_, rate)| *rate)
        .unwrap_or(750)
}
