//! Outbound side: message ids, batching and packetizing.
//!
//! Short-message channels bill per packet, and a move plus its chat line
//! plus an ack are often each far smaller than one packet. The
//! [`Packetizer`] holds logical messages per destination for a short
//! while and, when it flushes, packs consecutive small ones into a single
//! version-2 combined packet. Anything that doesn't fit in one packet is
//! fragmented normally.
//!
//! ```text
//! prep_outbound(to, msg, force)
//!     │  queue msg under `to`
//!     ├─ total < send_now_size and oldest younger than max_wait and !force
//!     │      → nothing to send, come back in `wait`
//!     └─ otherwise drain the queue:
//!            single-fragment runs → combined packets (unless forced)
//!            everything else      → version-1 fragments
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use narrowband_transport::{ChannelLimits, PeerAddress};
use parking_lot::Mutex;

use crate::fragment::{
    combine, encode, CombinedMessage, COMBINED_ENTRY_HEADER_LEN, FRAGMENT_HEADER_LEN,
};
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Message ids
// ---------------------------------------------------------------------------

/// Process-wide source of message ids. Wraps at `u16::MAX`.
#[derive(Debug)]
pub struct MessageIdSource {
    next: AtomicU16,
}

impl MessageIdSource {
    /// Starts at a random id so a restarted process doesn't immediately
    /// reuse ids the far end may still hold partials for.
    pub fn new_random() -> Self {
        Self::starting_at(rand::random::<u16>())
    }

    pub fn starting_at(first: u16) -> Self {
        Self {
            next: AtomicU16::new(first),
        }
    }

    /// Hands out the next id.
    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdSource {
    fn default() -> Self {
        Self::new_random()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// When to stop waiting and send.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Longest a queued message may wait for company.
    pub max_wait: Duration,
    /// Queue size (bytes) that triggers an immediate flush.
    pub send_now_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(5),
            send_now_size: 115,
        }
    }
}

// ---------------------------------------------------------------------------
// Packetizer
// ---------------------------------------------------------------------------

/// Result of one [`Packetizer::prep_outbound`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Prepared {
    /// Raw packets ready for `send_raw`, in order.
    pub packets: Vec<Vec<u8>>,
    /// Set when messages are still queued: call again after this long.
    pub wait: Option<Duration>,
    /// Messages thrown away because they exceed the channel's limits.
    pub dropped: usize,
}

struct Queued {
    payload: Vec<u8>,
    queued_at: Instant,
}

#[derive(Default)]
struct Pending {
    msgs: Vec<Queued>,
    bytes: usize,
}

/// Per-destination outbound queue for one channel.
pub struct Packetizer {
    config: BatchConfig,
    limits: ChannelLimits,
    ids: Arc<MessageIdSource>,
    pending: Mutex<HashMap<PeerAddress, Pending>>,
}

impl Packetizer {
    pub fn new(config: BatchConfig, limits: ChannelLimits, ids: Arc<MessageIdSource>) -> Self {
        Self {
            config,
            limits: limits.validated(),
            ids,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> ChannelLimits {
        self.limits
    }

    /// Queues `msg` (if any) for `to` and returns whatever is due.
    ///
    /// Passing `None` just re-checks the queue, which is how a caller
    /// honours the `wait` of an earlier call.
    pub fn prep_outbound(&self, to: &PeerAddress, msg: Option<Vec<u8>>, force: bool) -> Prepared {
        self.prep_outbound_at(to, msg, force, Instant::now())
    }

    fn prep_outbound_at(
        &self,
        to: &PeerAddress,
        msg: Option<Vec<u8>>,
        force: bool,
        now: Instant,
    ) -> Prepared {
        let drained = {
            let mut pending = self.pending.lock();
            let queue = pending.entry(to.clone()).or_default();
            if let Some(payload) = msg {
                queue.bytes += payload.len();
                queue.msgs.push(Queued {
                    payload,
                    queued_at: now,
                });
            }
            let Some(oldest) = queue.msgs.first().map(|q| q.queued_at) else {
                pending.remove(to);
                return Prepared::default();
            };

            let age = now.saturating_duration_since(oldest);
            let due = force || queue.bytes >= self.config.send_now_size || age >= self.config.max_wait;
            if !due {
                return Prepared {
                    wait: Some(self.config.max_wait - age),
                    ..Prepared::default()
                };
            }
            pending.remove(to).map(|q| q.msgs).unwrap_or_default()
        };

        let prepared = self.packetize(drained, !force);
        tracing::debug!(
            %to,
            packets = prepared.packets.len(),
            dropped = prepared.dropped,
            force,
            "outbound flushed"
        );
        prepared
    }

    /// Destinations with messages still waiting.
    pub fn pending_destinations(&self) -> Vec<PeerAddress> {
        let mut dests: Vec<_> = self.pending.lock().keys().cloned().collect();
        dests.sort();
        dests
    }

    /// Largest combined packet: the same wire size as one full fragment.
    fn combine_budget(&self) -> usize {
        self.limits.max_fragment_bytes + FRAGMENT_HEADER_LEN
    }

    fn packetize(&self, msgs: Vec<Queued>, allow_combine: bool) -> Prepared {
        let mut out = Prepared::default();
        let mut group: Vec<CombinedMessage> = Vec::new();
        let mut group_size = 1;

        for Queued { payload, .. } in msgs {
            let id = self.ids.next();
            let fragments = match encode(&payload, self.limits, id) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(msg_id = id, len = payload.len(), error = %e, "dropping oversized message");
                    out.dropped += 1;
                    continue;
                }
            };

            let entry_size = COMBINED_ENTRY_HEADER_LEN + payload.len();
            let combinable = allow_combine
                && fragments.len() == 1
                && payload.len() <= u8::MAX as usize
                && 1 + entry_size <= self.combine_budget();
            if !combinable {
                self.flush_group(&mut group, &mut out);
                group_size = 1;
                out.packets.extend(fragments.iter().map(|f| f.to_bytes()));
                continue;
            }

            if group_size + entry_size > self.combine_budget() {
                self.flush_group(&mut group, &mut out);
                group_size = 1;
            }
            group_size += entry_size;
            group.push(CombinedMessage {
                message_id: id,
                body: payload,
            });
        }
        self.flush_group(&mut group, &mut out);
        out
    }

    fn flush_group(&self, group: &mut Vec<CombinedMessage>, out: &mut Prepared) {
        match group.len() {
            0 => {}
            1 => {
                let msg = group.remove(0);
                match encode(&msg.body, self.limits, msg.message_id) {
                    Ok(frags) => out.packets.extend(frags.iter().map(|f| f.to_bytes())),
                    Err(e) => self.drop_group(1, &e, out),
                }
            }
            n => match combine(group) {
                Ok(packet) => out.packets.push(packet),
                Err(e) => self.drop_group(n, &e, out),
            },
        }
        group.clear();
    }

    fn drop_group(&self, n: usize, error: &ProtocolError, out: &mut Prepared) {
        tracing::warn!(count = n, %error, "dropping messages that failed to packetize");
        out.dropped += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{parse_packet, Packet};

    fn to() -> PeerAddress {
        PeerAddress::new("bob")
    }

    fn packetizer(bytes: usize, count: usize) -> Packetizer {
        Packetizer::new(
            BatchConfig::default(),
            ChannelLimits {
                max_fragment_bytes: bytes,
                max_fragment_count: count,
            },
            Arc::new(MessageIdSource::starting_at(100)),
        )
    }

    // =====================================================================
    // MessageIdSource
    // =====================================================================

    #[test]
    fn test_message_ids_increment_and_wrap() {
        let ids = MessageIdSource::starting_at(u16::MAX);
        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
    }

    // =====================================================================
    // prep_outbound()
    // =====================================================================

    #[test]
    fn test_small_message_waits_for_company() {
        let p = packetizer(115, 16);
        let now = Instant::now();

        let prepared = p.prep_outbound_at(&to(), Some(vec![1; 10]), false, now);

        assert!(prepared.packets.is_empty());
        assert_eq!(prepared.wait, Some(Duration::from_secs(5)));
        assert_eq!(p.pending_destinations(), vec![to()]);
    }

    #[test]
    fn test_waiting_message_flushes_after_max_wait() {
        let p = packetizer(115, 16);
        let t0 = Instant::now();
        p.prep_outbound_at(&to(), Some(vec![1; 10]), false, t0);

        let early = p.prep_outbound_at(&to(), None, false, t0 + Duration::from_secs(2));
        assert_eq!(early.wait, Some(Duration::from_secs(3)));

        let late = p.prep_outbound_at(&to(), None, false, t0 + Duration::from_secs(5));
        assert_eq!(late.packets.len(), 1);
        assert_eq!(late.wait, None);
        assert!(p.pending_destinations().is_empty());
    }

    #[test]
    fn test_small_messages_combine_into_one_packet() {
        let p = packetizer(115, 16);
        let t0 = Instant::now();
        p.prep_outbound_at(&to(), Some(b"move".to_vec()), false, t0);
        p.prep_outbound_at(&to(), Some(b"chat".to_vec()), false, t0);

        let prepared = p.prep_outbound_at(&to(), None, false, t0 + Duration::from_secs(6));

        assert_eq!(prepared.packets.len(), 1);
        match parse_packet(&prepared.packets[0]).unwrap() {
            Packet::Combined(msgs) => {
                let bodies: Vec<_> = msgs.iter().map(|m| m.body.as_slice()).collect();
                assert_eq!(bodies, vec![&b"move"[..], &b"chat"[..]]);
                assert_eq!(msgs[0].message_id, 100);
                assert_eq!(msgs[1].message_id, 101);
            }
            other => panic!("expected combined packet, got {other:?}"),
        }
    }

    #[test]
    fn test_forced_flush_never_combines() {
        let p = packetizer(115, 16);
        p.prep_outbound(&to(), Some(b"a".to_vec()), false);

        let prepared = p.prep_outbound(&to(), Some(b"b".to_vec()), true);

        assert_eq!(prepared.packets.len(), 2);
        for packet in &prepared.packets {
            assert!(matches!(parse_packet(packet).unwrap(), Packet::Fragment(_)));
        }
    }

    #[test]
    fn test_send_now_size_triggers_flush() {
        let p = packetizer(50, 16);

        let prepared = p.prep_outbound(&to(), Some(vec![7; 120]), false);

        // 120 bytes at 50 per fragment: three version-1 packets.
        assert_eq!(prepared.packets.len(), 3);
        assert_eq!(prepared.wait, None);
    }

    #[test]
    fn test_combined_packets_respect_budget() {
        let p = packetizer(20, 16);
        let t0 = Instant::now();
        for _ in 0..4 {
            p.prep_outbound_at(&to(), Some(vec![0; 8]), false, t0);
        }

        let prepared = p.prep_outbound_at(&to(), None, false, t0 + Duration::from_secs(5));

        // Budget 25 bytes: 1 + 11 + 11 = 23 fits two entries per packet.
        assert_eq!(prepared.packets.len(), 2);
        assert!(prepared.packets.iter().all(|pk| pk.len() <= 25));
    }

    #[test]
    fn test_oversized_message_is_dropped() {
        let p = packetizer(10, 2);

        let prepared = p.prep_outbound(&to(), Some(vec![0; 25]), true);

        assert!(prepared.packets.is_empty());
        assert_eq!(prepared.dropped, 1);
    }

    #[test]
    fn test_recheck_of_empty_queue_is_noop() {
        let p = packetizer(115, 16);
        assert_eq!(p.prep_outbound(&to(), None, false), Prepared::default());
        assert!(p.pending_destinations().is_empty());
    }
}
