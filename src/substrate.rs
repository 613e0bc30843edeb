//! The contract the transport needs from the unreliable-datagram substrate
//! underneath it (a QUIC/WebTransport-like session). Establishing that
//! session, encrypting it and routing its packets are the substrate's job,
//! not this crate's: `MediaTransport` is generic over anything that
//! implements [`Substrate`].

use bytes::Bytes;

/// Why a substrate session ended.
#[derive(Debug, Clone)]
pub struct SessionClose {
    pub code: u32,
    pub reason: String,
}

/// Best-effort, unordered datagram send/receive.
pub trait DatagramChannel: Send {
    fn send(&mut self, bytes: Bytes) -> impl Future<Output = std::io::Result<()>> + Send;

    fn recv(&mut self) -> impl Future<Output = std::io::Result<Bytes>> + Send;
}

/// The write half of a reliable unidirectional stream. One stream carries
/// exactly one reliable message; `finish` closes the stream after the last
/// write.
pub trait ReliableSendStream: Send {
    fn write_all(&mut self, bytes: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send;

    fn finish(self) -> impl Future<Output = std::io::Result<()>> + Send;
}

/// The read half of a reliable unidirectional stream opened by the peer.
pub trait ReliableRecvStream: Send {
    fn read_to_end(&mut self) -> impl Future<Output = std::io::Result<Bytes>> + Send;
}

/// A live session with the media server.
pub trait Substrate: Send + Sync + Sized + 'static {
    type Datagrams: DatagramChannel;
    type SendStream: ReliableSendStream;
    type RecvStream: ReliableRecvStream;

    /// Establishes a session against `url`, authenticated with `token` (the
    /// substrate is free to carry it however it likes, e.g. as a query
    /// parameter or a header on the initial handshake).
    fn connect(url: &str, token: &str) -> impl Future<Output = std::io::Result<Self>> + Send;

    /// Hands out the datagram channel. Implementations may return the same
    /// logical channel on every call; the transport calls this exactly once.
    fn datagrams(&self) -> Self::Datagrams;

    fn open_uni(&self) -> impl Future<Output = std::io::Result<Self::SendStream>> + Send;

    /// Accepts the next unidirectional stream opened by the peer. Called in
    /// a loop by the transport's reliable-receive task.
    fn accept_uni(&self) -> impl Future<Output = std::io::Result<Self::RecvStream>> + Send;

    /// Resolves when the session is closed, locally or by the peer.
    fn closed(&self) -> impl Future<Output = SessionClose> + Send;

    /// Requests that the session close with the given code and reason.
    /// Best-effort: implementations should not block indefinitely.
    fn close(&self, code: u32, reason: &str);
}
