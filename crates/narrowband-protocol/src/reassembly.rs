//! Reassembly Store: turning fragments back into messages.
//!
//! Fragments of one message may arrive in any order and any number of
//! times. The store keeps one [`PartialMessage`] per
//! `(peer, message_id)` until every slot is filled, then hands the
//! concatenated bytes back exactly once and forgets the key.
//!
//! # Concurrency
//!
//! One coarse `parking_lot::Mutex` guards the whole table. Message rates
//! on these channels are tiny and critical sections are a few memcpys,
//! so finer locking buys nothing. The lock is never held across an
//! `.await`.
//!
//! # Lifetime of partials
//!
//! A peer that sends fragment 0 of 3 and then vanishes would otherwise
//! leave its partial behind forever. Every partial remembers when it was
//! last touched; [`ReassemblyStore::evict_idle`] drops the stale ones and
//! runs automatically whenever a new partial is created. The table is
//! also capped at [`ReassemblyConfig::max_partials`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use narrowband_transport::PeerAddress;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::fragment::{parse_packet, Fragment, Packet};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning for the reassembly store.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Partials untouched for longer than this are evicted.
    pub max_idle: Duration,
    /// Most partials kept at once; the stalest is evicted beyond this.
    pub max_partials: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(10 * 60),
            max_partials: 256,
        }
    }
}

impl ReassemblyConfig {
    /// Clamp out-of-range values. `max_partials` is at least 1.
    pub fn validated(mut self) -> Self {
        self.max_partials = self.max_partials.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Partial messages
// ---------------------------------------------------------------------------

type Key = (PeerAddress, u16);

#[derive(Debug)]
struct PartialMessage {
    slots: Vec<Option<Vec<u8>>>,
    have_count: usize,
    total_bytes: usize,
    last_touched: Instant,
}

impl PartialMessage {
    fn new(count: u8, now: Instant) -> Self {
        Self {
            slots: vec![None; count as usize],
            have_count: 0,
            total_bytes: 0,
            last_touched: now,
        }
    }

    /// Stores one piece. A repeated index replaces the earlier copy
    /// without counting twice.
    fn put(&mut self, index: usize, body: Vec<u8>, now: Instant) {
        self.last_touched = now;
        let len = body.len();
        match self.slots[index].replace(body) {
            Some(old) => {
                self.total_bytes = self.total_bytes - old.len() + len;
            }
            None => {
                self.have_count += 1;
                self.total_bytes += len;
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.have_count == self.slots.len()
    }

    fn concat(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serializable copy of every partial, for persisting across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialsSnapshot {
    pub entries: Vec<PartialEntry>,
}

/// One partial message inside a [`PartialsSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialEntry {
    pub peer: PeerAddress,
    pub message_id: u16,
    /// One slot per fragment; `None` for pieces not yet received.
    pub slots: Vec<Option<Vec<u8>>>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Accumulates fragments per `(peer, message_id)` until complete.
pub struct ReassemblyStore {
    config: ReassemblyConfig,
    partials: Mutex<HashMap<Key, PartialMessage>>,
}

impl ReassemblyStore {
    /// Creates an empty store.
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config: config.validated(),
            partials: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds one fragment. Returns the whole message the moment its last
    /// missing piece arrives, and `None` otherwise.
    ///
    /// Single-fragment messages come straight back without touching the
    /// table. Fragments that contradict what the store already holds for
    /// their key (different count, index out of range) are logged and
    /// dropped.
    pub fn accept(&self, from: &PeerAddress, fragment: Fragment) -> Option<Vec<u8>> {
        self.accept_at(from, fragment, Instant::now())
    }

    fn accept_at(
        &self,
        from: &PeerAddress,
        fragment: Fragment,
        now: Instant,
    ) -> Option<Vec<u8>> {
        if fragment.is_whole() {
            return Some(fragment.body);
        }
        let Fragment {
            message_id,
            fragment_index: index,
            fragment_count: count,
            body,
            ..
        } = fragment;
        if count == 0 || index >= count {
            tracing::warn!(%from, message_id, index, count, "dropping fragment with bad index");
            return None;
        }

        let key = (from.clone(), message_id);
        let mut partials = self.partials.lock();

        if !partials.contains_key(&key) {
            self.make_room(&mut partials, now);
        }
        let partial = partials
            .entry(key.clone())
            .or_insert_with(|| PartialMessage::new(count, now));

        if partial.slots.len() != count as usize {
            tracing::warn!(
                %from,
                message_id,
                expected = partial.slots.len(),
                got = count,
                "dropping fragment whose count disagrees with earlier pieces"
            );
            return None;
        }

        partial.put(index as usize, body, now);
        tracing::trace!(
            %from,
            message_id,
            index,
            have = partial.have_count,
            count,
            "fragment stored"
        );

        if !partial.is_complete() {
            return None;
        }
        let done = partials.remove(&key)?;
        tracing::debug!(%from, message_id, len = done.total_bytes, "message reassembled");
        Some(done.concat())
    }

    /// Parses a raw packet and feeds it through the store. Returns every
    /// message it completes: none, one, or several for combined packets.
    ///
    /// Malformed packets are logged and yield nothing.
    pub fn ingest(&self, from: &PeerAddress, packet: &[u8]) -> Vec<Vec<u8>> {
        match parse_packet(packet) {
            Ok(Packet::Fragment(fragment)) => self.accept(from, fragment).into_iter().collect(),
            Ok(Packet::Combined(msgs)) => {
                tracing::debug!(%from, count = msgs.len(), "combined packet");
                msgs.into_iter().map(|m| m.body).collect()
            }
            Err(e) => {
                tracing::debug!(%from, len = packet.len(), error = %e, "dropping malformed packet");
                Vec::new()
            }
        }
    }

    /// Whether a partial exists for `(from, message_id)`.
    pub fn contains(&self, from: &PeerAddress, message_id: u16) -> bool {
        self.partials.lock().contains_key(&(from.clone(), message_id))
    }

    /// Number of incomplete messages held.
    pub fn len(&self) -> usize {
        self.partials.lock().len()
    }

    /// `true` when nothing is waiting for more fragments.
    pub fn is_empty(&self) -> bool {
        self.partials.lock().is_empty()
    }

    /// Drops partials idle longer than `max_idle`. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let mut partials = self.partials.lock();
        Self::evict_idle_locked(&mut partials, self.config.max_idle, now)
    }

    fn evict_idle_locked(
        partials: &mut HashMap<Key, PartialMessage>,
        max_idle: Duration,
        now: Instant,
    ) -> usize {
        let before = partials.len();
        partials.retain(|(peer, message_id), p| {
            let idle = now.saturating_duration_since(p.last_touched);
            let keep = idle <= max_idle;
            if !keep {
                tracing::info!(
                    %peer,
                    message_id,
                    have = p.have_count,
                    count = p.slots.len(),
                    idle_secs = idle.as_secs(),
                    "evicting stale partial message"
                );
            }
            keep
        });
        before - partials.len()
    }

    /// Called before inserting a new key: age out stale partials, then
    /// enforce the size cap.
    fn make_room(&self, partials: &mut HashMap<Key, PartialMessage>, now: Instant) {
        Self::evict_idle_locked(partials, self.config.max_idle, now);
        while partials.len() >= self.config.max_partials {
            let Some(stalest) = partials
                .iter()
                .min_by_key(|(_, p)| p.last_touched)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            tracing::warn!(peer = %stalest.0, message_id = stalest.1, "partial table full, evicting stalest");
            partials.remove(&stalest);
        }
    }

    /// Copies every partial out for persistence.
    pub fn snapshot(&self) -> PartialsSnapshot {
        let partials = self.partials.lock();
        let mut entries: Vec<PartialEntry> = partials
            .iter()
            .map(|((peer, message_id), p)| PartialEntry {
                peer: peer.clone(),
                message_id: *message_id,
                slots: p.slots.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.peer, a.message_id).cmp(&(&b.peer, b.message_id)));
        PartialsSnapshot { entries }
    }

    /// Re-imports partials saved by [`snapshot`](Self::snapshot). Entries
    /// with an impossible slot count are skipped. Restored partials count
    /// as freshly touched.
    pub fn restore(&self, snapshot: PartialsSnapshot) {
        let now = Instant::now();
        let mut partials = self.partials.lock();
        for entry in snapshot.entries {
            let Ok(count) = u8::try_from(entry.slots.len()) else {
                tracing::warn!(peer = %entry.peer, "skipping restored partial with too many slots");
                continue;
            };
            if count < 2 {
                continue;
            }
            let mut partial = PartialMessage::new(count, now);
            for (index, slot) in entry.slots.into_iter().enumerate() {
                if let Some(body) = slot {
                    partial.put(index, body, now);
                }
            }
            if partial.have_count == 0 || partial.is_complete() {
                continue;
            }
            partials.insert((entry.peer, entry.message_id), partial);
        }
        tracing::debug!(count = partials.len(), "partials restored");
    }
}

impl Default for ReassemblyStore {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{encode, FORMAT_VERSION};
    use narrowband_transport::ChannelLimits;

    fn peer() -> PeerAddress {
        PeerAddress::new("+15555550100")
    }

    fn limits(bytes: usize) -> ChannelLimits {
        ChannelLimits {
            max_fragment_bytes: bytes,
            max_fragment_count: 255,
        }
    }

    fn frag(id: u16, index: u8, count: u8, body: &[u8]) -> Fragment {
        Fragment {
            format_version: FORMAT_VERSION,
            message_id: id,
            fragment_index: index,
            fragment_count: count,
            body: body.to_vec(),
        }
    }

    /// Feeds `order` and returns every completion seen along the way.
    fn feed(store: &ReassemblyStore, frags: &[Fragment], order: &[usize]) -> Vec<Vec<u8>> {
        order
            .iter()
            .filter_map(|&i| store.accept(&peer(), frags[i].clone()))
            .collect()
    }

    // =====================================================================
    // accept()
    // =====================================================================

    #[test]
    fn test_accept_out_of_order_completes_once() {
        let store = ReassemblyStore::default();
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let frags = encode(&payload, limits(100), 7).unwrap();

        assert_eq!(store.accept(&peer(), frags[1].clone()), None);
        assert_eq!(store.accept(&peer(), frags[0].clone()), None);
        assert!(store.contains(&peer(), 7));
        assert_eq!(store.accept(&peer(), frags[2].clone()), Some(payload));
        assert!(!store.contains(&peer(), 7));
        assert!(store.is_empty());
    }

    #[test]
    fn test_accept_every_permutation_of_four_round_trips() {
        let payload: Vec<u8> = (0..37u8).collect();
        let frags = encode(&payload, limits(10), 42).unwrap();
        assert_eq!(frags.len(), 4);

        let mut order = [0usize, 1, 2, 3];
        // Heap's algorithm over the 24 orders.
        let mut c = [0usize; 4];
        let mut check = |order: &[usize]| {
            let store = ReassemblyStore::default();
            assert_eq!(feed(&store, &frags, order), vec![payload.clone()], "order {order:?}");
            assert!(store.is_empty());
        };
        check(&order);
        let mut i = 0;
        while i < 4 {
            if c[i] < i {
                if i % 2 == 0 {
                    order.swap(0, i);
                } else {
                    order.swap(c[i], i);
                }
                check(&order);
                c[i] += 1;
                i = 0;
            } else {
                c[i] = 0;
                i += 1;
            }
        }
    }

    #[test]
    fn test_accept_duplicate_does_not_complete_early() {
        let store = ReassemblyStore::default();
        let frags = encode(b"abcdefghij", limits(4), 1).unwrap();
        assert_eq!(frags.len(), 3);

        let got = feed(&store, &frags, &[0, 0, 1, 1, 0]);
        assert!(got.is_empty(), "two distinct pieces of three is not complete");

        let got = feed(&store, &frags, &[2]);
        assert_eq!(got, vec![b"abcdefghij".to_vec()]);
    }

    #[test]
    fn test_accept_duplicate_after_completion_starts_fresh_partial() {
        let store = ReassemblyStore::default();
        let frags = encode(b"abcdef", limits(3), 9).unwrap();

        assert_eq!(feed(&store, &frags, &[0, 1]).len(), 1);
        // A late duplicate opens a new partial but never completes alone.
        assert_eq!(store.accept(&peer(), frags[1].clone()), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_accept_single_fragment_short_circuits() {
        let store = ReassemblyStore::default();
        let got = store.accept(&peer(), frag(5, 0, 1, b"whole"));
        assert_eq!(got, Some(b"whole".to_vec()));
        assert!(!store.contains(&peer(), 5));
        assert!(store.is_empty());
    }

    #[test]
    fn test_accept_same_id_different_peers_are_independent() {
        let store = ReassemblyStore::default();
        let other = PeerAddress::new("+15555550199");

        assert_eq!(store.accept(&peer(), frag(1, 0, 2, b"A")), None);
        assert_eq!(store.accept(&other, frag(1, 1, 2, b"z")), None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.accept(&peer(), frag(1, 1, 2, b"B")), Some(b"AB".to_vec()));
        assert!(store.contains(&other, 1));
    }

    #[test]
    fn test_accept_count_mismatch_is_dropped() {
        let store = ReassemblyStore::default();
        store.accept(&peer(), frag(3, 0, 3, b"a"));

        assert_eq!(store.accept(&peer(), frag(3, 1, 2, b"b")), None);

        // Original partial still expects three pieces.
        store.accept(&peer(), frag(3, 1, 3, b"b"));
        assert_eq!(store.accept(&peer(), frag(3, 2, 3, b"c")), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_accept_bad_index_is_dropped() {
        let store = ReassemblyStore::default();
        assert_eq!(store.accept(&peer(), frag(3, 4, 3, b"x")), None);
        assert!(store.is_empty());
    }

    // =====================================================================
    // ingest()
    // =====================================================================

    #[test]
    fn test_ingest_drops_garbage_and_unknown_versions() {
        let store = ReassemblyStore::default();
        assert!(store.ingest(&peer(), &[]).is_empty());
        assert!(store.ingest(&peer(), &[1, 0]).is_empty());
        assert!(store.ingest(&peer(), &[0x7F, 0, 1, 0, 1, 0]).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_ingest_combined_packet_yields_all_bodies() {
        use crate::fragment::{combine, CombinedMessage};
        let store = ReassemblyStore::default();
        let packet = combine(&[
            CombinedMessage { message_id: 1, body: b"one".to_vec() },
            CombinedMessage { message_id: 2, body: b"two".to_vec() },
        ])
        .unwrap();

        let got = store.ingest(&peer(), &packet);

        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(store.is_empty());
    }

    // =====================================================================
    // eviction
    // =====================================================================

    #[test]
    fn test_evict_idle_drops_stale_partials() {
        let store = ReassemblyStore::new(ReassemblyConfig {
            max_idle: Duration::from_secs(60),
            ..ReassemblyConfig::default()
        });
        let t0 = Instant::now();
        store.accept_at(&peer(), frag(1, 0, 2, b"a"), t0);
        store.accept_at(&peer(), frag(2, 0, 2, b"b"), t0 + Duration::from_secs(50));

        let evicted = store.evict_idle_at(t0 + Duration::from_secs(90));

        assert_eq!(evicted, 1);
        assert!(!store.contains(&peer(), 1));
        assert!(store.contains(&peer(), 2));
    }

    #[test]
    fn test_new_partial_triggers_idle_eviction() {
        let store = ReassemblyStore::new(ReassemblyConfig {
            max_idle: Duration::from_secs(1),
            ..ReassemblyConfig::default()
        });
        let t0 = Instant::now();
        store.accept_at(&peer(), frag(1, 0, 2, b"a"), t0);

        store.accept_at(&peer(), frag(2, 0, 2, b"b"), t0 + Duration::from_secs(5));

        assert!(!store.contains(&peer(), 1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_table_cap_evicts_stalest() {
        let store = ReassemblyStore::new(ReassemblyConfig {
            max_partials: 2,
            ..ReassemblyConfig::default()
        });
        let t0 = Instant::now();
        store.accept_at(&peer(), frag(1, 0, 2, b"a"), t0);
        store.accept_at(&peer(), frag(2, 0, 2, b"b"), t0 + Duration::from_millis(1));
        store.accept_at(&peer(), frag(3, 0, 2, b"c"), t0 + Duration::from_millis(2));

        assert_eq!(store.len(), 2);
        assert!(!store.contains(&peer(), 1));
    }

    // =====================================================================
    // snapshot / restore
    // =====================================================================

    #[test]
    fn test_snapshot_restore_resumes_reassembly() {
        let store = ReassemblyStore::default();
        store.accept(&peer(), frag(4, 2, 3, b"c"));
        store.accept(&peer(), frag(4, 0, 3, b"a"));

        let snap = store.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: PartialsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);

        let fresh = ReassemblyStore::default();
        fresh.restore(back);
        assert!(fresh.contains(&peer(), 4));
        assert_eq!(fresh.accept(&peer(), frag(4, 1, 3, b"b")), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_restore_skips_empty_entries() {
        let store = ReassemblyStore::default();
        store.restore(PartialsSnapshot {
            entries: vec![PartialEntry {
                peer: peer(),
                message_id: 1,
                slots: vec![None, None],
            }],
        });
        assert!(store.is_empty());
    }
}
