//! Channel layer for Narrowband.
//!
//! A *channel* is a physical or session-oriented medium that moves raw
//! byte blocks between two addressed endpoints. Every channel looks the
//! same to the layers above: it has a [`ChannelType`], declares its
//! [`ChannelLimits`], sends packets through [`ChannelAdapter::send_raw`],
//! and pushes whatever it receives into an [`InboundSender`] as
//! [`InboundPacket`]s.
//!
//! Two concrete shapes ship with the crate:
//!
//! - [`MemoryNetwork`] / [`MemoryChannel`]: an in-process datagram
//!   network with small packets, used by tests and the demo, and able to
//!   simulate unreachable peers and duplicate delivery.
//! - [`SocketChannel`] (feature `websocket`, default): persistent
//!   bidirectional WebSocket connections carrying self-delimited JSON
//!   frames.
//!
//! # Feature Flags
//!
//! - `websocket` (default): socket channel via `tokio-tungstenite`

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryChannel, MemoryNetwork};
#[cfg(feature = "websocket")]
pub use websocket::SocketChannel;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Addresses and channel kinds
// ---------------------------------------------------------------------------

/// Opaque address of a remote endpoint (a phone number, a device MAC,
/// a `host:port`). Only the channel that produced it knows how to read it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Creates a new address from anything string-like.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<String> for PeerAddress {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

/// The kinds of channel a game can be connected over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelType {
    /// Store-and-forward relay server.
    Relay,
    /// Publish/subscribe broker.
    Mqtt,
    /// Bluetooth socket.
    Bluetooth,
    /// Direct IP socket.
    IpDirect,
    /// Short-message data packets: tiny, unordered, billed per packet.
    Sms,
    /// Peer-discovery socket (Wi-Fi Direct style).
    P2p,
    /// Near-field tap.
    Nfc,
}

impl ChannelType {
    /// Order in which channels are listed in status summaries.
    pub const DISPLAY_ORDER: [ChannelType; 7] = [
        ChannelType::Relay,
        ChannelType::Mqtt,
        ChannelType::Bluetooth,
        ChannelType::IpDirect,
        ChannelType::Sms,
        ChannelType::P2p,
        ChannelType::Nfc,
    ];

    /// Human-readable name used in status text.
    pub fn long_name(self) -> &'static str {
        match self {
            Self::Relay => "Relay",
            Self::Mqtt => "Internet/MQTT",
            Self::Bluetooth => "Bluetooth",
            Self::IpDirect => "Direct IP",
            Self::Sms => "Data SMS",
            Self::P2p => "Wi-Fi Direct",
            Self::Nfc => "NFC",
        }
    }

    /// Whether users pick this channel explicitly. Channels that are not
    /// selectable (NFC) only show up in summaries once they've been used.
    pub fn is_selectable(self) -> bool {
        !matches!(self, Self::Nfc)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long_name())
    }
}

/// Which way a packet travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// Sent to a peer.
    Outbound,
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Per-channel size ceilings. These are configuration, not protocol: the
/// fragment format is the same on every channel, only the limits differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    /// Largest fragment body this channel can carry in one packet.
    pub max_fragment_bytes: usize,
    /// Most fragments one logical message may be split into. Never more
    /// than 255, since the index travels in one byte.
    pub max_fragment_count: usize,
}

impl ChannelLimits {
    /// Hard ceiling imposed by the one-byte fragment index.
    pub const MAX_FRAGMENT_COUNT: usize = 255;

    /// Short-message datagrams: small packets, few of them.
    pub const DATAGRAM: Self = Self {
        max_fragment_bytes: 115,
        max_fragment_count: 16,
    };

    /// Socket channels: big frames, fragmenting is the exception.
    pub const SOCKET: Self = Self {
        max_fragment_bytes: 16 * 1024,
        max_fragment_count: Self::MAX_FRAGMENT_COUNT,
    };

    /// Clamp out-of-range values so the limits are safe to use.
    pub fn validated(mut self) -> Self {
        if self.max_fragment_bytes == 0 {
            tracing::warn!("max_fragment_bytes of 0, clamping to 1");
            self.max_fragment_bytes = 1;
        }
        self.max_fragment_count = self
            .max_fragment_count
            .clamp(1, Self::MAX_FRAGMENT_COUNT);
        self
    }

    /// Largest logical message that fits within these limits.
    pub fn max_message_bytes(&self) -> usize {
        self.max_fragment_bytes * self.max_fragment_count
    }
}

// ---------------------------------------------------------------------------
// Inbound plumbing
// ---------------------------------------------------------------------------

/// One raw byte block delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Channel that carried the packet.
    pub channel: ChannelType,
    /// Sender's address on that channel.
    pub from: PeerAddress,
    /// Raw packet bytes, not yet parsed.
    pub bytes: Vec<u8>,
}

/// Where channels push what they receive.
pub type InboundSender = mpsc::UnboundedSender<InboundPacket>;

/// The receiving half of an inbound queue.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundPacket>;

/// Creates a fresh inbound queue.
pub fn inbound_queue() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// A physical channel capable of sending raw packets to an address.
///
/// Receiving is push-based: adapters are constructed with an
/// [`InboundSender`] and feed it from whatever listener they run.
pub trait ChannelAdapter: Send + Sync + 'static {
    /// Which kind of channel this is.
    fn channel_type(&self) -> ChannelType;

    /// Size ceilings for packets on this channel.
    fn limits(&self) -> ChannelLimits;

    /// Sends one packet to `to`. `Ok(())` means the channel accepted the
    /// packet; it says nothing about delivery.
    fn send_raw(
        &self,
        to: &PeerAddress,
        packet: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_display_and_eq() {
        let a = PeerAddress::new("+15555550100");
        let b: PeerAddress = "+15555550100".into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "+15555550100");
    }

    #[test]
    fn test_peer_address_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(PeerAddress::new("alice"), 1);
        map.insert(PeerAddress::new("bob"), 2);
        assert_eq!(map[&PeerAddress::new("alice")], 1);
    }

    #[test]
    fn test_limits_validated_clamps_zero_and_overflow() {
        let limits = ChannelLimits {
            max_fragment_bytes: 0,
            max_fragment_count: 1000,
        }
        .validated();
        assert_eq!(limits.max_fragment_bytes, 1);
        assert_eq!(limits.max_fragment_count, 255);
    }

    #[test]
    fn test_datagram_limits_max_message_bytes() {
        assert_eq!(ChannelLimits::DATAGRAM.max_message_bytes(), 115 * 16);
    }

    #[test]
    fn test_channel_display_order_covers_every_type() {
        let mut seen = ChannelType::DISPLAY_ORDER.to_vec();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);
        assert!(!ChannelType::Nfc.is_selectable());
        assert!(ChannelType::Sms.is_selectable());
    }
}
