//! One channel attached to a node.
//!
//! An [`Endpoint`] owns the channel's adapter, its outbound
//! [`Packetizer`] and a bounded list of packets whose send failed. It
//! borrows everything else (reassembly, health, link state, the command
//! multiplexer) from its [`Node`].
//!
//! ```text
//! send(to, cmd) ─seal→ Packetizer ─due?→ send_raw ─ok→ health ✓
//!                                             └─err→ health ✗, notify, keep for resend
//! run(inbound):
//!   packet      → on_receive → ingest → open → dispatch → reply via send
//!   link back   → resend_failed
//!   batch timer → flush_due
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use narrowband_protocol::{Codec, Command, JsonCodec, Packetizer, Prepared, ProtocolError};
use narrowband_transport::{
    ChannelAdapter, ChannelType, Direction, InboundPacket, InboundReceiver, PeerAddress,
    TransportError,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::collaborators::Notification;
use crate::mux::Dispatch;
use crate::node::Node;
use crate::NarrowbandError;

struct FailedPacket {
    to: PeerAddress,
    bytes: Vec<u8>,
    since: Instant,
}

struct EndpointInner<A, C: Codec> {
    node: Node<C>,
    adapter: A,
    channel: ChannelType,
    packetizer: Packetizer,
    failed: Mutex<VecDeque<FailedPacket>>,
    wake: Notify,
}

/// A channel's send path, receive pipeline and resend list. Cheap to
/// clone; clones share the queues.
pub struct Endpoint<A: ChannelAdapter, C: Codec = JsonCodec> {
    inner: Arc<EndpointInner<A, C>>,
}

impl<A: ChannelAdapter, C: Codec> Clone for Endpoint<A, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ChannelAdapter, C: Codec> Endpoint<A, C> {
    pub(crate) fn new(node: Node<C>, adapter: A) -> Self {
        let channel = adapter.channel_type();
        let packetizer = Packetizer::new(
            node.config().batch.clone(),
            adapter.limits(),
            Arc::clone(&node.inner.ids),
        );
        tracing::debug!(%channel, limits = ?packetizer.limits(), "endpoint attached");
        Self {
            inner: Arc::new(EndpointInner {
                node,
                adapter,
                channel,
                packetizer,
                failed: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn channel(&self) -> ChannelType {
        self.inner.channel
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub fn node(&self) -> &Node<C> {
        &self.inner.node
    }

    /// Packets waiting for the next resend sweep.
    pub fn pending_resends(&self) -> usize {
        self.inner.failed.lock().len()
    }

    // -----------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------

    /// Queues `command` for `to`. It goes out with the next batch, which
    /// may be right away.
    ///
    /// A channel failure is not an error here: it is recorded, reported
    /// to the notification sink and the packets are kept for the resend
    /// sweep.
    ///
    /// # Errors
    /// [`NarrowbandError::Protocol`] if the command can't be encoded or
    /// is too large for this channel. Nothing is queued in either case.
    pub async fn send(&self, to: &PeerAddress, command: &Command) -> Result<(), NarrowbandError> {
        self.enqueue(to, command, false).await
    }

    /// Like [`send`](Self::send) but flushes `to`'s queue immediately,
    /// without combining.
    pub async fn send_now(&self, to: &PeerAddress, command: &Command) -> Result<(), NarrowbandError> {
        self.enqueue(to, command, true).await
    }

    /// Sends everything queued for `to`. Returns the packets accepted.
    pub async fn flush(&self, to: &PeerAddress) -> usize {
        let prepared = self.inner.packetizer.prep_outbound(to, None, true);
        self.transmit(to, prepared).await
    }

    /// Sends whatever batches have matured and returns how long until
    /// the next one does.
    pub async fn flush_due(&self) -> Option<Duration> {
        let mut next: Option<Duration> = None;
        for to in self.inner.packetizer.pending_destinations() {
            let prepared = self.inner.packetizer.prep_outbound(&to, None, false);
            if let Some(wait) = prepared.wait {
                next = Some(next.map_or(wait, |n| n.min(wait)));
            }
            self.transmit(&to, prepared).await;
        }
        next
    }

    async fn enqueue(
        &self,
        to: &PeerAddress,
        command: &Command,
        force: bool,
    ) -> Result<(), NarrowbandError> {
        let bytes = command.seal(self.inner.node.codec())?;
        let limits = self.inner.packetizer.limits().validated();
        if bytes.len() > limits.max_message_bytes() {
            let needed = bytes.len().div_ceil(limits.max_fragment_bytes);
            tracing::warn!(
                %to,
                channel = %self.inner.channel,
                tag = %command.tag(),
                game_id = %command.game_id(),
                len = bytes.len(),
                max = limits.max_message_bytes(),
                "command too large for channel"
            );
            return Err(ProtocolError::TooManyFragments {
                needed,
                max: limits.max_fragment_count,
            }
            .into());
        }
        tracing::debug!(
            %to,
            channel = %self.inner.channel,
            tag = %command.tag(),
            game_id = %command.game_id(),
            len = bytes.len(),
            force,
            "queueing command"
        );
        let prepared = self.inner.packetizer.prep_outbound(to, Some(bytes), force);
        self.transmit(to, prepared).await;
        Ok(())
    }

    async fn transmit(&self, to: &PeerAddress, prepared: Prepared) -> usize {
        if prepared.dropped > 0 {
            tracing::warn!(%to, channel = %self.inner.channel, dropped = prepared.dropped, "messages too large for channel");
        }
        if prepared.wait.is_some() {
            self.inner.wake.notify_one();
        }

        let health = self.inner.node.health();
        let mut packets = prepared.packets.into_iter();
        let mut sent = 0;
        let mut unsent = None;
        for packet in packets.by_ref() {
            match self.inner.adapter.send_raw(to, &packet).await {
                Ok(()) => {
                    health.update(self.inner.channel, Direction::Outbound, true);
                    sent += 1;
                }
                Err(e) => {
                    self.report_send_failure(to, &e);
                    unsent = Some(packet);
                    break;
                }
            }
        }
        if let Some(first) = unsent {
            let since = Instant::now();
            let kept = std::iter::once(first)
                .chain(packets)
                .map(|bytes| FailedPacket {
                    to: to.clone(),
                    bytes,
                    since,
                });
            self.keep_for_resend(kept, false);
        }
        sent
    }

    fn report_send_failure(&self, to: &PeerAddress, error: &TransportError) {
        let channel = self.inner.channel;
        tracing::warn!(%to, %channel, %error, "send failed");
        self.inner
            .node
            .health()
            .update(channel, Direction::Outbound, false);
        let notification = if error.is_permission() {
            Notification::SendFailedNoPermission {
                channel,
                to: to.clone(),
            }
        } else {
            Notification::SendFailed {
                channel,
                to: to.clone(),
            }
        };
        self.inner.node.inner.sink.notify(notification);
    }

    /// Adds packets to the resend list, at the back or (for packets that
    /// failed again during a sweep) at the front. The oldest go first
    /// when the list is full.
    fn keep_for_resend(&self, packets: impl DoubleEndedIterator<Item = FailedPacket>, front: bool) {
        let max = self.inner.node.config().max_resend_queue;
        let mut failed = self.inner.failed.lock();
        if front {
            for p in packets.rev() {
                failed.push_front(p);
            }
        } else {
            failed.extend(packets);
        }
        let mut dropped = 0;
        while failed.len() > max {
            failed.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(channel = %self.inner.channel, dropped, max, "resend list full, oldest packets dropped");
        }
    }

    /// Re-sends failed packets in order, stopping at the first new
    /// failure. Returns the packets accepted this time.
    pub async fn resend_failed(&self) -> usize {
        let pending: Vec<FailedPacket> = self.inner.failed.lock().drain(..).collect();
        if pending.is_empty() {
            return 0;
        }
        let channel = self.inner.channel;
        tracing::info!(%channel, count = pending.len(), "resending failed packets");

        let health = self.inner.node.health();
        let mut pending = pending.into_iter();
        let mut sent = 0;
        let mut unsent = None;
        for p in pending.by_ref() {
            match self.inner.adapter.send_raw(&p.to, &p.bytes).await {
                Ok(()) => {
                    health.update(channel, Direction::Outbound, true);
                    health.note_stall(channel, p.since.elapsed());
                    sent += 1;
                }
                Err(e) => {
                    self.report_send_failure(&p.to, &e);
                    unsent = Some(p);
                    break;
                }
            }
        }
        if let Some(first) = unsent {
            let rest: Vec<_> = std::iter::once(first).chain(pending).collect();
            self.keep_for_resend(rest.into_iter(), true);
        }
        sent
    }

    // -----------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------

    /// Runs one raw packet through reassembly, the integrity check and
    /// the multiplexer, and sends any replies. Returns one [`Dispatch`]
    /// per command it completed.
    ///
    /// Malformed packets and corrupted messages are logged and dropped
    /// without counting as a receipt in the connection health.
    pub async fn on_receive(&self, packet: InboundPacket) -> Vec<Dispatch> {
        let InboundPacket {
            channel,
            from,
            bytes,
        } = packet;
        let node = &self.inner.node;

        let mut handled = Vec::new();
        for payload in node.store().ingest(&from, &bytes) {
            let command = match Command::open(&payload, node.codec()) {
                Ok(command) => {
                    node.health().update(channel, Direction::Inbound, true);
                    command
                }
                Err(e) => {
                    tracing::warn!(%from, %channel, len = payload.len(), error = %e, "dropping unusable message");
                    continue;
                }
            };
            match node.mux().dispatch(&from, channel, command).await {
                Ok(dispatch) => {
                    if let Some(reply) = &dispatch.reply {
                        if let Err(e) = self.send(&from, reply).await {
                            tracing::error!(%from, %channel, error = %e, "reply could not be queued");
                        }
                    }
                    handled.push(dispatch);
                }
                Err(e) => {
                    tracing::error!(%from, %channel, error = %e, "command handling failed");
                }
            }
        }
        handled
    }

    /// Drives the endpoint: inbound packets, resend sweeps when the link
    /// comes back, and batch deadlines. Returns when `inbound` closes.
    pub async fn run(&self, mut inbound: InboundReceiver) {
        let channel = self.inner.channel;
        let mut resend = self.inner.node.link().subscribe_resend();
        let mut resend_open = true;
        let mut deadline: Option<Instant> = None;
        tracing::info!(%channel, "endpoint running");

        loop {
            let until = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                packet = inbound.recv() => {
                    let Some(packet) = packet else {
                        tracing::info!(%channel, "inbound queue closed, endpoint stopping");
                        self.inner.node.inner.sink.notify(Notification::ReceiveFailed { channel });
                        break;
                    };
                    self.on_receive(packet).await;
                }
                changed = resend.changed(), if resend_open => {
                    if changed.is_ok() {
                        self.resend_failed().await;
                    } else {
                        resend_open = false;
                    }
                }
                () = self.inner.wake.notified() => {}
                () = tokio::time::sleep_until(until), if deadline.is_some() => {}
            }
            deadline = self.flush_due().await.map(|wait| Instant::now() + wait);
        }
    }
}
