//! Outer envelope and the Integrity Guard.
//!
//! Every logical message is wrapped once, before fragmentation:
//!
//! ```text
//! [protocolVersion:1][commandTag:1][checksum:4 BE][commandPayload...]
//! ```
//!
//! The checksum is CRC-32 (IEEE) over `[commandTag] ++ commandPayload`.
//! Channels here reorder, duplicate and occasionally corrupt bytes even
//! when delivery "succeeds", so nothing reaches the multiplexer until
//! [`Envelope::verify`] has recomputed and matched it.

use crate::ProtocolError;

/// Envelope protocol version this build writes and accepts.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes before the command payload.
pub const ENVELOPE_HEADER_LEN: usize = 6;

/// CRC-32 over the tag byte followed by the payload.
pub fn checksum(tag: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(payload);
    hasher.finalize()
}

/// A parsed envelope. The tag stays a raw byte until the checksum has
/// been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub tag: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wraps a payload, computing its checksum.
    pub fn seal(tag: u8, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            tag,
            checksum: checksum(tag, &payload),
            payload,
        }
    }

    /// Serializes to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        out.push(self.version);
        out.push(self.tag);
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Splits wire bytes into header fields and payload. Does not check
    /// the checksum.
    ///
    /// # Errors
    /// `Truncated` if shorter than the header, `UnsupportedVersion` for
    /// any version other than [`PROTOCOL_VERSION`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                len: bytes.len(),
                need: ENVELOPE_HEADER_LEN,
            });
        }
        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            tag: bytes[1],
            checksum: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            payload: bytes[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }

    /// Recomputes the checksum and compares it to the carried one.
    ///
    /// # Errors
    /// `ChecksumMismatch` when they differ.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let computed = checksum(self.tag, &self.payload);
        if computed != self.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                carried: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// [`parse`](Self::parse) then [`verify`](Self::verify).
    pub fn open(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope = Self::parse(bytes)?;
        envelope.verify()?;
        Ok(envelope)
    }
}
