//! Wire codec for the media transport.
//!
//! Five packet kinds share one leading tag byte: PING, PONG, RTP, NACK and
//! FEC. Encoding fails closed (returns `Err`) rather than producing an
//! oversized datagram; decoding fails closed rather than panicking on
//! truncated or inconsistent input.

pub mod packet;

pub use packet::{FecEntry, FecPacket, NackPacket, Packet, RtpPacket};

#[derive(Debug)]
pub enum Error {
    Truncated,
    UnknownTag(u8),
    Inconsistent,
    TooLarge { len: usize, mtu: usize },
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Packets larger than this are refused at encode time and dropped at decode
/// time by the caller (the codec itself only ever refuses to *produce* one).
pub const DEFAULT_MTU: usize = 1200;
