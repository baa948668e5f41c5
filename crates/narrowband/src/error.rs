//! Unified error type for Narrowband.

use narrowband_lock::LockError;
use narrowband_protocol::ProtocolError;
use narrowband_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum NarrowbandError {
    /// A channel-level error (unreachable peer, permission, closed socket).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encoding, fragment limits, bad envelope).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A game-lock error (contention, deadlock, contract violation).
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The node was built without something it needs.
    #[error("configuration error: {0}")]
    Config(String),
}
