use std::time::Duration;

use ahash::AHashMap;
use codec::{FecEntry, FecPacket, RtpPacket};

use crate::config::FecConfig;

/// Groups outgoing RTP packets into protection groups and emits XOR parity.
///
/// The target group size is chosen when a new group starts, from the loss
/// rate and SRTT in effect at that moment; a group already in progress keeps
/// running to completion at its original size even if conditions change
/// mid-group.
pub struct FecEncoder {
    config: FecConfig,
    group: Vec<RtpPacket>,
    target: usize,
}

impl FecEncoder {
    pub fn new(config: FecConfig) -> Self {
        Self {
            config,
            group: Vec::new(),
            target: 0,
        }
    }

    /// Feeds one outgoing RTP packet through the encoder. Returns a newly
    /// completed FEC packet when the current group reaches its target size.
    pub fn process_packet(
        &mut self,
        packet: RtpPacket,
        loss_rate: f64,
        srtt: Duration,
    ) -> Option<FecPacket> {
        if self.group.is_empty() {
            self.target = group_size(&self.config, loss_rate, srtt);
        }

        if self.target == 0 {
            return None;
        }

        self.group.push(packet);

        if self.group.len() >= self.target {
            Some(self.build_and_clear())
        } else {
            None
        }
    }

    /// Emits parity for whatever is left of the current group, if it is
    /// worth protecting (at least two packets). Called when the sender has
    /// no more data to follow the group with.
    pub fn flush(&mut self) -> Option<FecPacket> {
        if self.group.len() >= 2 {
            Some(self.build_and_clear())
        } else {
            self.group.clear();
            None
        }
    }

    fn build_and_clear(&mut self) -> FecPacket {
        let group = std::mem::take(&mut self.group);
        build_parity(&group)
    }

    /// Drops any in-progress group without emitting parity for it. Called
    /// when a session disconnects.
    pub fn reset(&mut self) {
        self.group.clear();
        self.target = 0;
    }
}

fn group_size(config: &FecConfig, loss_rate: f64, srtt: Duration) -> usize {
    let mut size = config
        .group_size_table
        .iter()
        .find(|(bound, _)| loss_rate < *bound)
        .map(|(_, size)| *size)
        .unwrap_or(0);

    if size > 0 && srtt > config.high_srtt_threshold {
        size = size.saturating_sub(1).max(2);
    }

    size
}

fn build_parity(group: &[RtpPacket]) -> FecPacket {
    let max_len = group.iter().map(|p| p.payload.len()).max().unwrap_or(0);
    let mut parity = vec![0u8; max_len];

    for packet in group {
        xor_into(&mut parity, &packet.payload);
    }

    let entries = group
        .iter()
        .map(|p| FecEntry {
            sequence: p.sequence,
            timestamp: p.timestamp,
            frame_id: p.frame_id,
            fragment_index: p.fragment_index,
            fragment_count: p.fragment_count,
            payload_len: p.payload.len() as u16,
        })
        .collect();

    FecPacket {
        timestamp: group.last().map(|p| p.timestamp).unwrap_or(0),
        entries,
        parity: parity.into(),
    }
}

fn xor_into(accumulator: &mut [u8], payload: &[u8]) {
    for (byte, p) in accumulator.iter_mut().zip(payload.iter()) {
        *byte ^= p;
    }
}

/// Attempts to recover exactly one missing member of `fec`'s protection
/// group from the RTP packets already in `available` (keyed by sequence
/// number). Returns `None` when zero or more than one member is missing —
/// FEC recovers at most one loss per group.
pub fn recover_packet(
    fec: &FecPacket,
    available: &AHashMap<u64, RtpPacket>,
) -> Option<RtpPacket> {
    let mut missing = fec.entries.iter().filter(|e| !available.contains_key(&e.sequence));
    let target = missing.next()?;
    if missing.next().is_some() {
        return None;
    }

    let max_len = fec.entries.iter().map(|e| e.payload_len as usize).max().unwrap_or(0);
    let mut reconstructed = fec.parity.to_vec();
    if reconstructed.len() < max_len {
        reconstructed.resize(max_len, 0);
    }

    for entry in &fec.entries {
        if entry.sequence == target.sequence {
            continue;
        }
        if let Some(packet) = available.get(&entry.sequence) {
            xor_into(&mut reconstructed, &packet.payload);
        }
    }

    reconstructed.truncate(target.payload_len as usize);

    Some(RtpPacket {
        sequence: target.sequence,
        timestamp: target.timestamp,
        frame_id: target.frame_id,
        fragment_index: target.fragment_index,
        fragment_count: target.fragment_count,
        payload: reconstructed.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn rtp(sequence: u64, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            sequence,
            timestamp: 1,
            frame_id: 1,
            fragment_index: sequence as u16,
            fragment_count: 5,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn disabled_below_one_percent_loss() {
        let mut enc = FecEncoder::new(FecConfig::default());
        let out = enc.process_packet(rtp(0, b"a"), 0.0, Duration::from_millis(20));
        assert!(out.is_none());
        assert_eq!(enc.group.len(), 0);
    }

    #[test]
    fn high_srtt_shaves_one_off_the_group_size_floor_two() {
        assert_eq!(group_size(&FecConfig::default(), 0.02, Duration::from_millis(300)), 9);
        assert_eq!(group_size(&FecConfig::default(), 0.20, Duration::from_millis(300)), 2);
    }

    #[test]
    fn recovers_exactly_one_missing_packet() {
        let mut enc = FecEncoder::new(FecConfig::default());
        let mut fec_packet = None;
        let packets: Vec<_> = (0..3).map(|i| rtp(i, format!("payload-{i}").as_bytes())).collect();

        for p in &packets {
            if let Some(fec) = enc.process_packet(p.clone(), 0.20, Duration::from_millis(20)) {
                fec_packet = Some(fec);
            }
        }
        let fec_packet = fec_packet.or_else(|| enc.flush()).expect("group of 3 should flush");

        let mut available: AHashMap<u64, RtpPacket> = packets.iter().cloned().map(|p| (p.sequence, p)).collect();
        let missing = available.remove(&1).unwrap();

        let recovered = recover_packet(&fec_packet, &available).expect("exactly one missing");
        assert_eq!(recovered.payload, missing.payload);
        assert_eq!(recovered.sequence, missing.sequence);
    }

    #[test]
    fn refuses_to_recover_when_two_are_missing() {
        let mut enc = FecEncoder::new(FecConfig::default());
        let packets: Vec<_> = (0..3).map(|i| rtp(i, b"x")).collect();
        let mut fec_packet = None;
        for p in &packets {
            if let Some(fec) = enc.process_packet(p.clone(), 0.20, Duration::from_millis(20)) {
                fec_packet = Some(fec);
            }
        }
        let fec_packet = fec_packet.or_else(|| enc.flush()).unwrap();

        let available: AHashMap<u64, RtpPacket> = std::iter::once((0, packets[0].clone())).collect();
        assert!(recover_packet(&fec_packet, &available).is_none());
    }
}
