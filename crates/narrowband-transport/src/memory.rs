//! In-process datagram network.
//!
//! Every endpoint that joins a [`MemoryNetwork`] gets a [`MemoryChannel`]
//! for sending and an [`InboundReceiver`] for receiving. Packets are
//! routed synchronously through the shared routing table, so tests can
//! make peers unreachable or turn on duplicate delivery and watch the
//! upper layers cope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{
    inbound_queue, ChannelAdapter, ChannelLimits, ChannelType, InboundPacket,
    InboundReceiver, InboundSender, PeerAddress, TransportError,
};

struct Routes {
    endpoints: HashMap<PeerAddress, InboundSender>,
    unreachable: HashSet<PeerAddress>,
    duplicate_delivery: bool,
}

/// Shared routing table for a set of [`MemoryChannel`]s.
///
/// Cheap to clone; all clones see the same routes.
#[derive(Clone)]
pub struct MemoryNetwork {
    channel: ChannelType,
    limits: ChannelLimits,
    routes: Arc<Mutex<Routes>>,
    sent: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Creates an empty network that reports itself as `channel`.
    pub fn new(channel: ChannelType, limits: ChannelLimits) -> Self {
        Self {
            channel,
            limits: limits.validated(),
            routes: Arc::new(Mutex::new(Routes {
                endpoints: HashMap::new(),
                unreachable: HashSet::new(),
                duplicate_delivery: false,
            })),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a short-message style network with datagram limits.
    pub fn datagram() -> Self {
        Self::new(ChannelType::Sms, ChannelLimits::DATAGRAM)
    }

    /// Registers `addr` and returns its sending half and inbound queue.
    ///
    /// Joining twice with the same address replaces the earlier endpoint.
    pub fn join(
        &self,
        addr: impl Into<PeerAddress>,
    ) -> (MemoryChannel, InboundReceiver) {
        let addr = addr.into();
        let (tx, rx) = inbound_queue();
        self.routes.lock().endpoints.insert(addr.clone(), tx);
        tracing::debug!(%addr, channel = %self.channel, "joined memory network");
        let channel = MemoryChannel {
            addr,
            network: self.clone(),
        };
        (channel, rx)
    }

    /// Marks `addr` reachable or not. Sends to an unreachable peer fail
    /// with [`TransportError::Unreachable`].
    pub fn set_reachable(&self, addr: &PeerAddress, reachable: bool) {
        let mut routes = self.routes.lock();
        if reachable {
            routes.unreachable.remove(addr);
        } else {
            routes.unreachable.insert(addr.clone());
        }
    }

    /// When enabled, every packet is delivered twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.routes.lock().duplicate_delivery = enabled;
    }

    /// Total packets accepted for delivery so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn route(
        &self,
        from: &PeerAddress,
        to: &PeerAddress,
        packet: &[u8],
    ) -> Result<(), TransportError> {
        let routes = self.routes.lock();
        if routes.unreachable.contains(to) || routes.unreachable.contains(from) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        let sender = routes
            .endpoints
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        let copies = if routes.duplicate_delivery { 2 } else { 1 };
        for _ in 0..copies {
            let delivered = sender.send(InboundPacket {
                channel: self.channel,
                from: from.clone(),
                bytes: packet.to_vec(),
            });
            if delivered.is_err() {
                return Err(TransportError::ConnectionClosed(format!(
                    "{to} stopped listening"
                )));
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One endpoint's sending half on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryChannel {
    addr: PeerAddress,
    network: MemoryNetwork,
}

impl MemoryChannel {
    /// This endpoint's own address.
    pub fn address(&self) -> &PeerAddress {
        &self.addr
    }
}

impl ChannelAdapter for MemoryChannel {
    fn channel_type(&self) -> ChannelType {
        self.network.channel
    }

    fn limits(&self) -> ChannelLimits {
        self.network.limits
    }

    async fn send_raw(
        &self,
        to: &PeerAddress,
        packet: &[u8],
    ) -> Result<(), TransportError> {
        tracing::trace!(from = %self.addr, %to, len = packet.len(), "memory send");
        self.network.route(&self.addr, to, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_raw_delivers_to_joined_peer() {
        let net = MemoryNetwork::datagram();
        let (alice, _alice_rx) = net.join("alice");
        let (_bob, mut bob_rx) = net.join("bob");

        alice
            .send_raw(&"bob".into(), b"hello")
            .await
            .expect("send should succeed");

        let pkt = bob_rx.recv().await.expect("packet");
        assert_eq!(pkt.from, PeerAddress::new("alice"));
        assert_eq!(pkt.bytes, b"hello");
        assert_eq!(pkt.channel, ChannelType::Sms);
        assert_eq!(net.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_send_raw_unknown_peer_is_unreachable() {
        let net = MemoryNetwork::datagram();
        let (alice, _rx) = net.join("alice");

        let result = alice.send_raw(&"nobody".into(), b"x").await;

        assert!(matches!(result, Err(TransportError::Unreachable(_))));
        assert_eq!(net.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_set_reachable_false_blocks_until_restored() {
        let net = MemoryNetwork::datagram();
        let (alice, _arx) = net.join("alice");
        let (_bob, mut bob_rx) = net.join("bob");
        let bob = PeerAddress::new("bob");

        net.set_reachable(&bob, false);
        assert!(alice.send_raw(&bob, b"1").await.is_err());

        net.set_reachable(&bob, true);
        alice.send_raw(&bob, b"2").await.unwrap();
        assert_eq!(bob_rx.recv().await.unwrap().bytes, b"2");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_sends_two_copies() {
        let net = MemoryNetwork::datagram();
        let (alice, _arx) = net.join("alice");
        let (_bob, mut bob_rx) = net.join("bob");
        net.set_duplicate_delivery(true);

        alice.send_raw(&"bob".into(), b"dup").await.unwrap();

        assert_eq!(bob_rx.recv().await.unwrap().bytes, b"dup");
        assert_eq!(bob_rx.recv().await.unwrap().bytes, b"dup");
    }
}
