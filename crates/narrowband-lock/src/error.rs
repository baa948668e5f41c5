//! Error types for the lock layer.

use std::time::Duration;

use narrowband_protocol::RowId;

use crate::OwnerId;

/// Errors that can occur while acquiring or releasing a game lock.
///
/// [`Locked`](LockError::Locked) is ordinary contention: retry later.
/// The other variants mean the calling code is wrong (or stuck), and
/// callers are expected to treat them as bugs.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Someone else holds the game and the caller's wait budget ran out.
    #[error("game {0} is locked")]
    Locked(RowId),

    /// An unbounded wait went past the deadlock ceiling.
    #[error("gave up on game {row} after {waited:?}: likely deadlock")]
    Deadlock { row: RowId, waited: Duration },

    /// Release by an owner that doesn't hold the lock.
    #[error("owner {owner} does not hold game {row}")]
    NotHeld { row: RowId, owner: OwnerId },

    /// Rows are positive; anything else is a caller bug.
    #[error("invalid game row {0}")]
    InvalidRow(RowId),
}

impl LockError {
    /// `true` for plain contention, which the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}
