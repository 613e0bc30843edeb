use std::time::{Duration, Instant};

use ahash::AHashMap;
use codec::NackPacket;

use crate::config::NackConfig;

struct PendingNack {
    missing: Vec<u64>,
    created_at: Instant,
    sent_at: Instant,
    retransmissions: u32,
}

/// Tracks gaps in the incoming sequence space and drives NACK
/// (re)transmission. The receive cache itself is owned by `MediaTransport`;
/// callers pass it in by reference so this controller stays a plain,
/// testable piece of bookkeeping with no I/O of its own.
pub struct NackController {
    config: NackConfig,
    pending: Vec<PendingNack>,
}

impl NackController {
    pub fn new(config: NackConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
        }
    }

    /// Called when the receiver observes `end` while `start` was the next
    /// expected sequence. Jumps larger than the configured threshold are
    /// assumed to be a sender window advance rather than loss, and ignored.
    pub fn on_gap_detected(
        &mut self,
        start: u64,
        end: u64,
        received: &AHashMap<u64, Instant>,
        now: Instant,
    ) {
        if end <= start || end - start > self.config.gap_ignore_threshold {
            return;
        }

        let missing: Vec<u64> = (start..end).filter(|s| !received.contains_key(s)).collect();
        if missing.is_empty() {
            return;
        }

        self.pending.push(PendingNack {
            missing,
            created_at: now,
            sent_at: now,
            retransmissions: 0,
        });
    }

    /// Called on every naturally or recovered-received RTP sequence: removes
    /// it from every pending entry, dropping entries that become empty.
    pub fn on_rtp_received(&mut self, sequence: u64) {
        for entry in &mut self.pending {
            entry.missing.retain(|s| *s != sequence);
        }
        self.pending.retain(|entry| !entry.missing.is_empty());
    }

    /// Re-prunes every pending entry against the current receive cache, then
    /// returns the NACK packets that are due for (re)transmission.
    pub fn check_pending_nacks(
        &mut self,
        received: &AHashMap<u64, Instant>,
        srtt: Duration,
        rto: Duration,
        now: Instant,
    ) -> Vec<NackPacket> {
        for entry in &mut self.pending {
            entry.missing.retain(|s| !received.contains_key(s));
        }
        self.pending.retain(|entry| !entry.missing.is_empty());

        let mut due = Vec::new();
        for entry in &mut self.pending {
            if entry.retransmissions >= self.config.max_retransmissions {
                continue;
            }

            let delay = self.delay(entry.retransmissions, srtt, rto);
            if now.saturating_duration_since(entry.sent_at) >= delay {
                due.push(NackPacket {
                    sequences: entry.missing.clone(),
                });
                entry.sent_at = now;
                entry.retransmissions += 1;
            }
        }

        self.pending
            .retain(|entry| entry.retransmissions < self.config.max_retransmissions);

        due
    }

    /// Drops entries older than `config.max_age`, regardless of
    /// retransmission count.
    pub fn cleanup(&mut self, now: Instant) {
        let max_age = self.config.max_age;
        self.pending
            .retain(|entry| now.saturating_duration_since(entry.created_at) <= max_age);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops every pending NACK outright. Called when a session disconnects.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn delay(&self, retransmissions: u32, srtt: Duration, rto: Duration) -> Duration {
        if retransmissions == 0 {
            if srtt > self.config.high_srtt_threshold {
                self.config.initial_delay_high_srtt
            } else {
                self.config.initial_delay_low_srtt
            }
        } else {
            rto
        }
    }
}
