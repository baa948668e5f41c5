//! Codec trait for the structured parts of command payloads.
//!
//! Most commands are a few fixed-width big-endian fields and need no
//! codec. The invite carries free-form game-setup metadata, and that
//! goes through a [`Codec`] so the format can change without touching
//! the envelope or the multiplexer.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Encodes Rust values to bytes and back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every
/// endpoint task of a node.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or
    /// don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`.
///
/// Behind the `json` feature (enabled by default).
///
/// ## Example
///
/// ```rust
/// use narrowband_protocol::{Codec, GameId, InviteInfo, JsonCodec};
///
/// let codec = JsonCodec;
/// let invite = InviteInfo {
///     game_id: GameId(0x2A),
///     name: "alice".into(),
///     lang: "en".into(),
///     players_total: 2,
///     players_here: 1,
///     dict_name: None,
///     channels: vec![],
/// };
///
/// let bytes = codec.encode(&invite).unwrap();
/// let back: InviteInfo = codec.decode(&bytes).unwrap();
/// assert_eq!(invite, back);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
