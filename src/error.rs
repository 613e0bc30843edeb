use thiserror::Error;

/// Errors surfaced to the embedding application through the public API.
///
/// Decode failures, NACK exhaustion and MTU overflow are deliberately not
/// represented here: per the transport's error-handling design those are
/// tolerated conditions (drop, log, give up) rather than caller-visible
/// failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("substrate failure: {0}")]
    Substrate(String),

    #[error("ping timeout: no pong received after {missed} consecutive probes")]
    PingTimeout { missed: u32 },
}
