//! Client-side real-time media transport.
//!
//! Fragments outgoing frames into a compact RTP-like datagram format,
//! protects them with adaptive forward error correction, repairs losses the
//! FEC missed through NACK-driven retransmission, and paces egress to the
//! rate the observed loss implies — all on top of an unreliable-datagram
//! substrate the caller supplies (see [`substrate::Substrate`]).
//!
//! This crate does not implement that substrate, does not touch media
//! codecs, and carries no congestion control beyond the pacing described in
//! [`pacer`]; those are the embedding application's concerns.

pub mod config;
pub mod error;
pub mod fec;
pub mod frame_buffer;
pub mod loss;
pub mod nack;
pub mod pacer;
pub mod rtt;
pub mod substrate;
pub mod transport;

pub use config::Config;
pub use error::TransportError;
pub use transport::{MediaTransport, TransportObserver, TransportStats};

pub use codec::{FecEntry, FecPacket, NackPacket, Packet, RtpPacket};
