//! Wire protocol for Narrowband.
//!
//! This crate turns commands into packets small enough for any channel
//! and back again:
//!
//! - **Commands** ([`Command`], [`InviteInfo`], [`GameId`]): what peers
//!   tell each other.
//! - **Envelope** ([`Envelope`]): version, tag and CRC-32 wrapped around
//!   each command before it is split. [`Envelope::verify`] is the
//!   integrity guard.
//! - **Fragments** ([`encode`], [`parse_packet`]): the per-packet
//!   header, plus combined packets that carry several small messages.
//! - **Batching** ([`Packetizer`], [`MessageIdSource`]): the outbound
//!   queue that decides when to send and how to pack.
//! - **Reassembly** ([`ReassemblyStore`]): the inbound table that puts
//!   fragments back together, exactly once per message.
//! - **Codec** ([`Codec`], [`JsonCodec`]): serialization for structured
//!   payloads.
//!
//! # Architecture
//!
//! ```text
//! send:    Command ─seal→ envelope bytes ─Packetizer→ packets ─→ channel
//! receive: channel ─→ packets ─ReassemblyStore→ envelope bytes ─open→ Command
//! ```
//!
//! # Feature Flags
//!
//! - `json` (default): [`JsonCodec`] via `serde_json`

mod batch;
mod codec;
mod envelope;
mod error;
mod fragment;
mod reassembly;
mod types;

pub use batch::{BatchConfig, MessageIdSource, Packetizer, Prepared};
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use envelope::{checksum, Envelope, ENVELOPE_HEADER_LEN, PROTOCOL_VERSION};
pub use error::ProtocolError;
pub use fragment::{
    combine, encode, parse_header, parse_packet, CombinedMessage, Fragment, Packet,
    COMBINED_ENTRY_HEADER_LEN, COMBINED_FORMAT_VERSION, FORMAT_VERSION, FRAGMENT_HEADER_LEN,
};
pub use reassembly::{PartialEntry, PartialsSnapshot, ReassemblyConfig, ReassemblyStore};
pub use types::{Command, CommandTag, GameId, InviteInfo, RowId};
