use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{DEFAULT_MTU, Error};

const TAG_PING: u8 = 0;
const TAG_PONG: u8 = 1;
const TAG_RTP: u8 = 2;
const TAG_NACK: u8 = 3;
const TAG_FEC: u8 = 4;

/// One fragment of a protected frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence: u64,
    pub timestamp: u64,
    pub frame_id: u64,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload: Bytes,
}

/// A request to retransmit the listed sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackPacket {
    pub sequences: Vec<u64>,
}

/// Header fields of one RTP packet protected by a FEC group, without its
/// payload (the payload is recovered, not carried).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecEntry {
    pub sequence: u64,
    pub timestamp: u64,
    pub frame_id: u64,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_len: u16,
}

/// XOR parity over a protection group, plus enough metadata to rebuild one
/// missing member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecPacket {
    pub timestamp: u64,
    pub entries: Vec<FecEntry>,
    pub parity: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping { timestamp: u64, payload: Bytes },
    Pong { timestamp: u64, payload: Bytes },
    Rtp(RtpPacket),
    Nack(NackPacket),
    Fec(FecPacket),
}

impl Packet {
    /// Encodes the packet into a freshly allocated buffer.
    ///
    /// Returns [`Error::TooLarge`] instead of producing a datagram that would
    /// not fit `mtu`.
    ///
    /// # Test
    ///
    /// ```
    /// use mesh_transport_codec::Packet;
    /// use bytes::Bytes;
    ///
    /// let packet = Packet::Ping { timestamp: 42, payload: Bytes::from_static(b"hi") };
    /// let bytes = packet.encode(1200).unwrap();
    /// assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    /// ```
    pub fn encode(&self, mtu: usize) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(64);

        match self {
            Packet::Ping { timestamp, payload } => encode_ping_pong(TAG_PING, *timestamp, payload, &mut buf),
            Packet::Pong { timestamp, payload } => encode_ping_pong(TAG_PONG, *timestamp, payload, &mut buf),
            Packet::Rtp(rtp) => encode_rtp(rtp, &mut buf),
            Packet::Nack(nack) => encode_nack(nack, &mut buf),
            Packet::Fec(fec) => encode_fec(fec, &mut buf),
        }

        if buf.len() > mtu {
            return Err(Error::TooLarge {
                len: buf.len(),
                mtu,
            });
        }

        Ok(buf.freeze())
    }

    /// Decodes a packet from a raw datagram.
    ///
    /// An unrecognized leading tag, or any truncation/inconsistency in the
    /// body, yields an error rather than a panic; the caller is expected to
    /// drop the datagram and continue.
    pub fn decode(bytes: &[u8]) -> Result<Packet, Error> {
        let mut buf = bytes;
        let tag = get_u8(&mut buf)?;

        Ok(match tag {
            TAG_PING => {
                let (timestamp, payload) = decode_ping_pong(&mut buf)?;
                Packet::Ping { timestamp, payload }
            }
            TAG_PONG => {
                let (timestamp, payload) = decode_ping_pong(&mut buf)?;
                Packet::Pong { timestamp, payload }
            }
            TAG_RTP => Packet::Rtp(decode_rtp(&mut buf)?),
            TAG_NACK => Packet::Nack(decode_nack(&mut buf)?),
            TAG_FEC => Packet::Fec(decode_fec(&mut buf)?),
            other => return Err(Error::UnknownTag(other)),
        })
    }
}

fn encode_ping_pong(tag: u8, timestamp: u64, payload: &Bytes, buf: &mut BytesMut) {
    buf.put_u8(tag);
    buf.put_u64(timestamp);
    buf.put_u16(payload.len() as u16);
    buf.put(payload.as_ref());
}

fn decode_ping_pong(buf: &mut &[u8]) -> Result<(u64, Bytes), Error> {
    let timestamp = get_u64(buf)?;
    let len = get_u16(buf)? as usize;
    let payload = get_slice(buf, len)?;
    Ok((timestamp, Bytes::copy_from_slice(payload)))
}

fn encode_rtp(rtp: &RtpPacket, buf: &mut BytesMut) {
    buf.put_u8(TAG_RTP);
    buf.put_u64(rtp.sequence);
    buf.put_u64(rtp.timestamp);
    buf.put_u64(rtp.frame_id);
    buf.put_u16(rtp.fragment_index);
    buf.put_u16(rtp.fragment_count);
    buf.put_u16(rtp.payload.len() as u16);
    buf.put(rtp.payload.as_ref());
}

fn decode_rtp(buf: &mut &[u8]) -> Result<RtpPacket, Error> {
    let sequence = get_u64(buf)?;
    let timestamp = get_u64(buf)?;
    let frame_id = get_u64(buf)?;
    let fragment_index = get_u16(buf)?;
    let fragment_count = get_u16(buf)?;
    let payload_len = get_u16(buf)? as usize;

    if fragment_count == 0 || fragment_index >= fragment_count {
        return Err(Error::Inconsistent);
    }

    let payload = get_slice(buf, payload_len)?;

    Ok(RtpPacket {
        sequence,
        timestamp,
        frame_id,
        fragment_index,
        fragment_count,
        payload: Bytes::copy_from_slice(payload),
    })
}

fn encode_nack(nack: &NackPacket, buf: &mut BytesMut) {
    buf.put_u8(TAG_NACK);
    buf.put_u16(nack.sequences.len() as u16);
    for seq in &nack.sequences {
        buf.put_u64(*seq);
    }
}

fn decode_nack(buf: &mut &[u8]) -> Result<NackPacket, Error> {
    let count = get_u16(buf)? as usize;
    let mut sequences = Vec::with_capacity(count);
    for _ in 0..count {
        sequences.push(get_u64(buf)?);
    }
    Ok(NackPacket { sequences })
}

fn encode_fec(fec: &FecPacket, buf: &mut BytesMut) {
    buf.put_u8(TAG_FEC);
    buf.put_u64(fec.timestamp);
    buf.put_u16(fec.entries.len() as u16);
    for entry in &fec.entries {
        buf.put_u64(entry.sequence);
        buf.put_u64(entry.timestamp);
        buf.put_u64(entry.frame_id);
        buf.put_u16(entry.fragment_index);
        buf.put_u16(entry.fragment_count);
        buf.put_u16(entry.payload_len);
    }
    buf.put_u16(fec.parity.len() as u16);
    buf.put(fec.parity.as_ref());
}

fn decode_fec(buf: &mut &[u8]) -> Result<FecPacket, Error> {
    let timestamp = get_u64(buf)?;
    let entry_count = get_u16(buf)? as usize;

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        entries.push(FecEntry {
            sequence: get_u64(buf)?,
            timestamp: get_u64(buf)?,
            frame_id: get_u64(buf)?,
            fragment_index: get_u16(buf)?,
            fragment_count: get_u16(buf)?,
            payload_len: get_u16(buf)?,
        });
    }

    let parity_len = get_u16(buf)? as usize;
    let parity = get_slice(buf, parity_len)?;

    Ok(FecPacket {
        timestamp,
        entries,
        parity: Bytes::copy_from_slice(parity),
    })
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, Error> {
    if buf.remaining() < 2 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, Error> {
    if buf.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_slice<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    if buf.remaining() < len {
        return Err(Error::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Maximum payload a single RTP fragment may carry while leaving enough
/// headroom in [`DEFAULT_MTU`] for every other packet kind's headers.
pub const MAX_FRAGMENT_PAYLOAD: usize = DEFAULT_MTU - 200;
