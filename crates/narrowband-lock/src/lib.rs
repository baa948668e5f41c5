//! Per-game locks for Narrowband.
//!
//! Inbound moves, local moves and background jobs all mutate the same
//! persisted game. [`GameLocks`] serializes them per game row:
//!
//! - **Write**: exclusive.
//! - **Read**: re-entrant for the holding [`OwnerId`], exclusive against
//!   every other owner.
//!
//! Acquisition comes in three flavours: [`GameLocks::try_acquire`] (one
//! attempt), [`GameLocks::acquire`] (async poll loop) and
//! [`GameLocks::acquire_blocking`] (thread poll loop). A bounded wait that
//! runs out is ordinary contention ([`LockError::Locked`]); an unbounded
//! wait that runs past [`LockConfig::deadlock_ceiling`] is reported as
//! [`LockError::Deadlock`] because it almost certainly is one.
//!
//! Holds are represented by [`GameLock`] guards and released on drop.

mod config;
mod error;
mod registry;

pub use config::LockConfig;
pub use error::LockError;
pub use registry::{GameLock, GameLocks, LockMode, OnTimeout, OwnerId};
