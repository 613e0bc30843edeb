use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use codec::RtpPacket;

/// Receive-side assembly of one frame's fragments.
///
/// A conformant sender never produces fragments that disagree on
/// `fragment_count`/`timestamp` for a shared frame id, but the buffer still
/// guards against it: a divergent fragment is rejected rather than accepted,
/// so a single hostile or buggy peer cannot corrupt an in-progress
/// reassembly.
pub struct FrameBuffer {
    expected_count: u16,
    timestamp: u64,
    fragments: AHashMap<u16, RtpPacket>,
    pub created_at: Instant,
}

impl FrameBuffer {
    pub fn new(first: &RtpPacket, now: Instant) -> Self {
        let mut fragments = AHashMap::with_capacity(first.fragment_count as usize);
        fragments.insert(first.fragment_index, first.clone());

        Self {
            expected_count: first.fragment_count,
            timestamp: first.timestamp,
            fragments,
            created_at: now,
        }
    }

    /// Inserts a fragment, overwriting any prior fragment at the same index
    /// (receive-side duplicates are last-writer-wins). Returns `false`
    /// without modifying the buffer if `packet` disagrees with the frame's
    /// established fragment count or timestamp.
    pub fn add(&mut self, packet: &RtpPacket) -> bool {
        if packet.fragment_count != self.expected_count || packet.timestamp != self.timestamp {
            return false;
        }

        self.fragments.insert(packet.fragment_index, packet.clone());
        true
    }

    pub fn is_complete(&self) -> bool {
        (0..self.expected_count).all(|i| self.fragments.contains_key(&i))
    }

    /// Concatenates fragments in index order. Returns `None` if the buffer
    /// is not yet complete.
    pub fn reconstruct(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let mut out = Vec::new();
        for i in 0..self.expected_count {
            out.extend_from_slice(&self.fragments[&i].payload);
        }

        Some(out.into())
    }
}
