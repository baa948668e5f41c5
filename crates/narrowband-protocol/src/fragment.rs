//! Fragment Codec: splitting a logical message into bounded packets.
//!
//! Two packet layouts share the first byte as a format version:
//!
//! ```text
//! version 1, one fragment:
//!   [1][messageId:2 BE][fragmentIndex:1][fragmentCount:1][body…]
//!
//! version 2, several whole small messages:
//!   [2] { [len:1][messageId:2 BE][body:len] }*
//! ```
//!
//! Everything here is pure: no state, no I/O.

use narrowband_transport::ChannelLimits;

use crate::ProtocolError;

/// Format version of a single-fragment packet.
pub const FORMAT_VERSION: u8 = 1;

/// Format version of a combined packet.
pub const COMBINED_FORMAT_VERSION: u8 = 2;

/// Bytes in front of every version-1 fragment body.
pub const FRAGMENT_HEADER_LEN: usize = 5;

/// Bytes in front of every message inside a combined packet.
pub const COMBINED_ENTRY_HEADER_LEN: usize = 3;

/// One bounded piece of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub format_version: u8,
    /// Shared by every fragment of one message; wraps at `u16::MAX`.
    pub message_id: u16,
    /// Zero-based position of this piece.
    pub fragment_index: u8,
    /// Total number of pieces, at least 1.
    pub fragment_count: u8,
    pub body: Vec<u8>,
}

impl Fragment {
    /// `true` for messages that fit in one fragment. These never touch
    /// the reassembly store.
    pub fn is_whole(&self) -> bool {
        self.fragment_index == 0 && self.fragment_count == 1
    }

    /// Serializes header and body into one packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.body.len());
        out.push(self.format_version);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.push(self.fragment_index);
        out.push(self.fragment_count);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Splits `payload` into fragments no bigger than the channel allows.
///
/// An empty payload still produces one (empty) fragment so the far end
/// sees the message at all.
///
/// # Errors
/// [`ProtocolError::TooManyFragments`] if the payload needs more pieces
/// than `limits.max_fragment_count` (never more than 255).
pub fn encode(
    payload: &[u8],
    limits: ChannelLimits,
    message_id: u16,
) -> Result<Vec<Fragment>, ProtocolError> {
    let limits = limits.validated();
    let needed = payload.len().div_ceil(limits.max_fragment_bytes).max(1);
    if needed > limits.max_fragment_count {
        return Err(ProtocolError::TooManyFragments {
            needed,
            max: limits.max_fragment_count,
        });
    }

    // `needed` <= 255 here, so the casts below can't truncate.
    let count = needed as u8;
    if payload.is_empty() {
        return Ok(vec![Fragment {
            format_version: FORMAT_VERSION,
            message_id,
            fragment_index: 0,
            fragment_count: 1,
            body: Vec::new(),
        }]);
    }

    Ok(payload
        .chunks(limits.max_fragment_bytes)
        .enumerate()
        .map(|(index, chunk)| Fragment {
            format_version: FORMAT_VERSION,
            message_id,
            fragment_index: index as u8,
            fragment_count: count,
            body: chunk.to_vec(),
        })
        .collect())
}

/// Parses a version-1 packet.
///
/// # Errors
/// - [`ProtocolError::Truncated`]: shorter than the header
/// - [`ProtocolError::UnsupportedVersion`]: any version but 1
/// - [`ProtocolError::BadFragmentIndex`]: count 0, or index ≥ count
pub fn parse_header(bytes: &[u8]) -> Result<Fragment, ProtocolError> {
    if bytes.len() < FRAGMENT_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            len: bytes.len(),
            need: FRAGMENT_HEADER_LEN,
        });
    }
    let format_version = bytes[0];
    if format_version != FORMAT_VERSION {
        return Err(ProtocolError::UnsupportedVersion(format_version));
    }
    let message_id = u16::from_be_bytes([bytes[1], bytes[2]]);
    let fragment_index = bytes[3];
    let fragment_count = bytes[4];
    if fragment_count == 0 || fragment_index >= fragment_count {
        return Err(ProtocolError::BadFragmentIndex {
            index: fragment_index,
            count: fragment_count,
        });
    }
    Ok(Fragment {
        format_version,
        message_id,
        fragment_index,
        fragment_count,
        body: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
    })
}

/// A whole message carried inside a combined packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedMessage {
    pub message_id: u16,
    pub body: Vec<u8>,
}

/// What a raw packet turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// One fragment (possibly the only one) of a message.
    Fragment(Fragment),
    /// Several complete messages.
    Combined(Vec<CombinedMessage>),
}

/// Parses any packet this build understands.
///
/// # Errors
/// Same as [`parse_header`] for version 1; [`ProtocolError::Truncated`]
/// if a combined entry runs past the end of the buffer.
pub fn parse_packet(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    match bytes.first() {
        None => Err(ProtocolError::Truncated { len: 0, need: 1 }),
        Some(&FORMAT_VERSION) => parse_header(bytes).map(Packet::Fragment),
        Some(&COMBINED_FORMAT_VERSION) => parse_combined(&bytes[1..]).map(Packet::Combined),
        Some(&other) => Err(ProtocolError::UnsupportedVersion(other)),
    }
}

fn parse_combined(mut rest: &[u8]) -> Result<Vec<CombinedMessage>, ProtocolError> {
    let mut msgs = Vec::new();
    while !rest.is_empty() {
        if rest.len() < COMBINED_ENTRY_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                len: rest.len(),
                need: COMBINED_ENTRY_HEADER_LEN,
            });
        }
        let len = rest[0] as usize;
        let message_id = u16::from_be_bytes([rest[1], rest[2]]);
        let end = COMBINED_ENTRY_HEADER_LEN + len;
        if rest.len() < end {
            return Err(ProtocolError::Truncated {
                len: rest.len(),
                need: end,
            });
        }
        msgs.push(CombinedMessage {
            message_id,
            body: rest[COMBINED_ENTRY_HEADER_LEN..end].to_vec(),
        });
        rest = &rest[end..];
    }
    Ok(msgs)
}

/// Packs whole messages into one version-2 packet.
///
/// # Errors
/// [`ProtocolError::TooLongToCombine`] if any body exceeds 255 bytes.
pub fn combine(messages: &[CombinedMessage]) -> Result<Vec<u8>, ProtocolError> {
    let size = 1 + messages
        .iter()
        .map(|m| COMBINED_ENTRY_HEADER_LEN + m.body.len())
        .sum::<usize>();
    let mut out = Vec::with_capacity(size);
    out.push(COMBINED_FORMAT_VERSION);
    for msg in messages {
        let len = u8::try_from(msg.body.len())
            .map_err(|_| ProtocolError::TooLongToCombine(msg.body.len()))?;
        out.push(len);
        out.extend_from_slice(&msg.message_id.to_be_bytes());
        out.extend_from_slice(&msg.body);
    }
    Ok(out)
}
