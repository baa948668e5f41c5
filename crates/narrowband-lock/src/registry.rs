//! The lock table and its guards.
//!
//! A row is in one of three states:
//!
//! ```text
//! Unheld ──try_acquire(any)──→ HeldForRead(owner, n) / HeldForWrite(owner)
//! HeldForRead(owner, n) ──same owner, Read──→ HeldForRead(owner, n + 1)
//! held ──release by holder──→ count - 1, entry removed at 0
//! ```
//!
//! Every other request fails. Waiting is a poll loop: try, sleep
//! `poll_interval`, try again. Simple, and every wait is bounded and
//! shows up in the logs with the current holders.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use narrowband_protocol::RowId;
use parking_lot::Mutex;

use crate::{LockConfig, LockError};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of a lock holder. Two handles are the same holder only if
/// they carry the same `OwnerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocates a fresh, process-unique owner.
    pub fn new() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Re-entrant for the same owner; excludes everyone else.
    Read,
    /// Exclusive.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// What a bounded acquire does when its budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTimeout {
    /// `Ok(None)`.
    ReturnNone,
    /// `Err(LockError::Locked)`.
    Error,
}

#[derive(Debug)]
struct LockEntry {
    owner: OwnerId,
    mode: LockMode,
    count: u32,
    since: Instant,
}

struct Inner {
    config: LockConfig,
    table: Mutex<HashMap<RowId, LockEntry>>,
}

/// Registry of per-game locks. Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct GameLocks {
    inner: Arc<Inner>,
}

impl GameLocks {
    pub fn new(config: LockConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.validated(),
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// One attempt, no waiting.
    ///
    /// # Errors
    /// [`LockError::Locked`] if anyone else holds the row, or this owner
    /// holds it in a way that can't be shared. [`LockError::InvalidRow`]
    /// for rows that aren't positive.
    pub fn try_acquire(
        &self,
        row: RowId,
        owner: OwnerId,
        mode: LockMode,
    ) -> Result<GameLock, LockError> {
        if self.grant(row, owner, mode)? {
            return Ok(self.guard(row, owner, mode));
        }
        tracing::debug!(%row, %owner, %mode, holders = %self.describe(row), "lock busy");
        Err(LockError::Locked(row))
    }

    /// Polls until the lock is granted or the wait is over.
    ///
    /// `max_wait` of zero waits without a budget; going past
    /// `deadlock_ceiling` that way is reported as [`LockError::Deadlock`].
    /// A non-zero `max_wait` longer than `max_bounded_wait` is clamped.
    /// When a bounded wait runs out, `on_timeout` picks between `Ok(None)`
    /// and [`LockError::Locked`]. Abandoning a wait leaves no trace in the
    /// table.
    pub async fn acquire(
        &self,
        row: RowId,
        owner: OwnerId,
        mode: LockMode,
        max_wait: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<GameLock>, LockError> {
        let budget = self.budget(row, max_wait);
        let start = tokio::time::Instant::now();
        loop {
            if self.grant(row, owner, mode)? {
                return Ok(Some(self.guard(row, owner, mode)));
            }
            if let Some(outcome) = self.give_up(row, start.elapsed(), budget, on_timeout) {
                return outcome;
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// [`acquire`](Self::acquire) for threads outside the async runtime.
    /// Sleeps the calling thread between attempts.
    pub fn acquire_blocking(
        &self,
        row: RowId,
        owner: OwnerId,
        mode: LockMode,
        max_wait: Duration,
        on_timeout: OnTimeout,
    ) -> Result<Option<GameLock>, LockError> {
        let budget = self.budget(row, max_wait);
        let start = Instant::now();
        loop {
            if self.grant(row, owner, mode)? {
                return Ok(Some(self.guard(row, owner, mode)));
            }
            if let Some(outcome) = self.give_up(row, start.elapsed(), budget, on_timeout) {
                return outcome;
            }
            std::thread::sleep(self.inner.config.poll_interval);
        }
    }

    /// Drops one hold of `owner` on `row`. The entry disappears when the
    /// last hold goes.
    ///
    /// # Errors
    /// [`LockError::NotHeld`] if `owner` isn't the holder.
    pub fn release(&self, row: RowId, owner: OwnerId) -> Result<(), LockError> {
        let mut table = self.inner.table.lock();
        let Some(entry) = table.get_mut(&row) else {
            return Err(LockError::NotHeld { row, owner });
        };
        if entry.owner != owner {
            return Err(LockError::NotHeld { row, owner });
        }
        entry.count -= 1;
        if entry.count == 0 {
            table.remove(&row);
            tracing::trace!(%row, %owner, "lock released");
        }
        Ok(())
    }

    /// Whether anyone holds `row`.
    pub fn is_locked(&self, row: RowId) -> bool {
        self.inner.table.lock().contains_key(&row)
    }

    /// Mode and hold count for `row`, if held.
    pub fn holder(&self, row: RowId) -> Option<(OwnerId, LockMode, u32)> {
        self.inner
            .table
            .lock()
            .get(&row)
            .map(|e| (e.owner, e.mode, e.count))
    }

    /// Human-readable holder dump for diagnostics.
    pub fn describe(&self, row: RowId) -> String {
        let table = self.inner.table.lock();
        match table.get(&row) {
            None => format!("{row} unheld"),
            Some(e) => {
                let held = e.since.elapsed();
                let long = if held >= self.inner.config.long_hold_warning {
                    " (long hold!)"
                } else {
                    ""
                };
                format!(
                    "{row} held for {} by {} x{} for {}ms{long}",
                    e.mode,
                    e.owner,
                    e.count,
                    held.as_millis()
                )
            }
        }
    }

    fn grant(&self, row: RowId, owner: OwnerId, mode: LockMode) -> Result<bool, LockError> {
        if !row.is_valid() {
            tracing::error!(%row, %owner, "lock requested for invalid row");
            return Err(LockError::InvalidRow(row));
        }
        let mut table = self.inner.table.lock();
        match table.entry(row) {
            Entry::Vacant(slot) => {
                slot.insert(LockEntry {
                    owner,
                    mode,
                    count: 1,
                    since: Instant::now(),
                });
                Ok(true)
            }
            Entry::Occupied(mut held) => {
                let e = held.get_mut();
                if e.owner == owner && e.mode == LockMode::Read && mode == LockMode::Read {
                    e.count += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn guard(&self, row: RowId, owner: OwnerId, mode: LockMode) -> GameLock {
        GameLock {
            locks: self.clone(),
            row,
            owner,
            mode,
            released: false,
        }
    }

    /// `None` for an unbounded wait.
    fn budget(&self, row: RowId, max_wait: Duration) -> Option<Duration> {
        if max_wait.is_zero() {
            return None;
        }
        let limit = self.inner.config.max_bounded_wait;
        if max_wait > limit {
            tracing::warn!(%row, ?max_wait, ?limit, "bounded lock wait too long, clamping");
            return Some(limit);
        }
        Some(max_wait)
    }

    fn give_up(
        &self,
        row: RowId,
        waited: Duration,
        budget: Option<Duration>,
        on_timeout: OnTimeout,
    ) -> Option<Result<Option<GameLock>, LockError>> {
        match budget {
            Some(limit) if waited >= limit => {
                tracing::warn!(%row, ?waited, holders = %self.describe(row), "lock wait timed out");
                Some(match on_timeout {
                    OnTimeout::ReturnNone => Ok(None),
                    OnTimeout::Error => Err(LockError::Locked(row)),
                })
            }
            None if waited >= self.inner.config.deadlock_ceiling => {
                tracing::error!(%row, ?waited, holders = %self.describe(row), "lock wait hit deadlock ceiling");
                Some(Err(LockError::Deadlock { row, waited }))
            }
            _ => None,
        }
    }
}

impl Default for GameLocks {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// One hold on a game. Dropping it releases the hold.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct GameLock {
    locks: GameLocks,
    row: RowId,
    owner: OwnerId,
    mode: LockMode,
    released: bool,
}

impl GameLock {
    pub fn row(&self) -> RowId {
        self.row
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn can_write(&self) -> bool {
        self.mode == LockMode::Write
    }

    /// Takes one more hold for the same owner, e.g. to hand the game to
    /// another task that will release it independently.
    pub fn retain(&self) -> Result<GameLock, LockError> {
        let mut table = self.locks.inner.table.lock();
        match table.get_mut(&self.row) {
            Some(e) if e.owner == self.owner => {
                e.count += 1;
                Ok(self.locks.guard(self.row, self.owner, self.mode))
            }
            _ => Err(LockError::NotHeld {
                row: self.row,
                owner: self.owner,
            }),
        }
    }

    /// Releases now and reports a contract violation instead of logging it.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.locks.release(self.row, self.owner)
    }
}

impl fmt::Debug for GameLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameLock")
            .field("row", &self.row)
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for GameLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.locks.release(self.row, self.owner) {
            tracing::error!(row = %self.row, owner = %self.owner, error = %e, "lock guard release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW: RowId = RowId(5);

    // =====================================================================
    // try_acquire()
    // =====================================================================

    #[test]
    fn test_try_acquire_unheld_succeeds() {
        let locks = GameLocks::default();
        let owner = OwnerId::new();

        let lock = locks.try_acquire(ROW, owner, LockMode::Write).unwrap();

        assert!(lock.can_write());
        assert_eq!(locks.holder(ROW), Some((owner, LockMode::Write, 1)));
        drop(lock);
        assert!(!locks.is_locked(ROW));
    }

    #[test]
    fn test_try_acquire_second_writer_fails() {
        let locks = GameLocks::default();
        let _held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

        let other = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write);

        assert!(matches!(other, Err(LockError::Locked(ROW))));
    }

    #[test]
    fn test_try_acquire_same_owner_read_is_reentrant() {
        let locks = GameLocks::default();
        let owner = OwnerId::new();

        let guards: Vec<_> = (0..3)
            .map(|_| locks.try_acquire(ROW, owner, LockMode::Read).unwrap())
            .collect();
        assert_eq!(locks.holder(ROW), Some((owner, LockMode::Read, 3)));

        let mut guards = guards.into_iter();
        drop(guards.next());
        drop(guards.next());
        assert!(locks.is_locked(ROW));
        drop(guards.next());
        assert!(!locks.is_locked(ROW));
    }

    #[test]
    fn test_try_acquire_other_owner_read_denied() {
        let locks = GameLocks::default();
        let _a = locks.try_acquire(ROW, OwnerId::new(), LockMode::Read).unwrap();

        assert!(locks.try_acquire(ROW, OwnerId::new(), LockMode::Read).is_err());
    }

    #[test]
    fn test_try_acquire_same_owner_write_after_read_denied() {
        let locks = GameLocks::default();
        let owner = OwnerId::new();
        let _r = locks.try_acquire(ROW, owner, LockMode::Read).unwrap();

        assert!(locks.try_acquire(ROW, owner, LockMode::Write).is_err());
    }

    #[test]
    fn test_try_acquire_invalid_row_is_contract_violation() {
        let locks = GameLocks::default();
        let result = locks.try_acquire(RowId(0), OwnerId::new(), LockMode::Read);
        assert!(matches!(result, Err(LockError::InvalidRow(RowId(0)))));
    }

    // =====================================================================
    // release()
    // =====================================================================

    #[test]
    fn test_release_by_non_holder_fails() {
        let locks = GameLocks::default();
        let _held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

        let result = locks.release(ROW, OwnerId::new());

        assert!(matches!(result, Err(LockError::NotHeld { .. })));
        assert!(locks.is_locked(ROW));
    }

    #[test]
    fn test_explicit_release_then_drop_releases_once() {
        let locks = GameLocks::default();
        let lock = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

        lock.release().unwrap();

        assert!(!locks.is_locked(ROW));
    }

    #[test]
    fn test_retain_needs_matching_release() {
        let locks = GameLocks::default();
        let lock = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();
        let extra = lock.retain().unwrap();

        drop(lock);
        assert!(locks.is_locked(ROW));
        drop(extra);
        assert!(!locks.is_locked(ROW));
    }

    // =====================================================================
    // describe()
    // =====================================================================

    #[test]
    fn test_describe_names_holder_and_mode() {
        let locks = GameLocks::default();
        assert_eq!(locks.describe(ROW), "row-5 unheld");

        let owner = OwnerId::new();
        let _l = locks.try_acquire(ROW, owner, LockMode::Write).unwrap();
        let text = locks.describe(ROW);
        assert!(text.starts_with(&format!("row-5 held for write by {owner} x1")), "{text}");
    }

    // =====================================================================
    // acquire_blocking()
    // =====================================================================

    #[test]
    fn test_acquire_blocking_times_out_with_chosen_policy() {
        let locks = GameLocks::new(LockConfig {
            poll_interval: Duration::from_millis(1),
            ..LockConfig::default()
        });
        let _held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();
        let me = OwnerId::new();

        let none = locks
            .acquire_blocking(ROW, me, LockMode::Write, Duration::from_millis(20), OnTimeout::ReturnNone)
            .unwrap();
        assert!(none.is_none());

        let err = locks.acquire_blocking(ROW, me, LockMode::Write, Duration::from_millis(20), OnTimeout::Error);
        assert!(matches!(err, Err(LockError::Locked(ROW))));
    }

    #[test]
    fn test_acquire_blocking_gets_lock_released_by_other_thread() {
        let locks = GameLocks::new(LockConfig {
            poll_interval: Duration::from_millis(1),
            ..LockConfig::default()
        });
        let held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let got = locks
            .acquire_blocking(ROW, OwnerId::new(), LockMode::Write, Duration::ZERO, OnTimeout::Error)
            .unwrap();
        releaser.join().unwrap();

        assert!(got.is_some());
    }
}
