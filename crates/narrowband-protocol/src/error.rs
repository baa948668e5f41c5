//! Error types for the protocol layer.
//!
//! Almost everything here describes *malformed input*: a packet that is
//! too short, from a newer protocol, or that fails its checksum. Narrowband
//! channels produce this kind of noise routinely, so the receive pipeline
//! logs these errors and drops the packet instead of propagating them.
//! Only [`ProtocolError::TooManyFragments`] and the codec variants reach
//! callers on the send path.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload needs more fragments than the channel allows. The
    /// message must be dropped rather than sent as a malformed sequence.
    #[error("message needs {needed} fragments, channel allows {max}")]
    TooManyFragments { needed: usize, max: usize },

    /// Buffer shorter than the fixed header it must start with.
    #[error("truncated: {len} bytes, need at least {need}")]
    Truncated { len: usize, need: usize },

    /// A format or protocol version this build doesn't understand.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Fragment index outside `0..count`, or a count of zero.
    #[error("bad fragment index {index} of {count}")]
    BadFragmentIndex { index: u8, count: u8 },

    /// A fragment disagrees with earlier fragments of the same message
    /// about how many pieces there are.
    #[error("fragment count mismatch: expected {expected}, got {got}")]
    CountMismatch { expected: u8, got: u8 },

    /// The Integrity Guard rejected a reassembled payload.
    #[error("checksum mismatch: carried {carried:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { carried: u32, computed: u32 },

    /// The command tag is not one we know.
    #[error("unknown command tag {0}")]
    UnknownCommand(u8),

    /// A message in a combined packet is too big for its one-byte length.
    #[error("{0} bytes is too long to combine")]
    TooLongToCombine(usize),

    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message passed decoding but violates protocol rules.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
