//! Command multiplexer: one handler per command, whatever the channel.
//!
//! The flow for each verified command:
//!
//! ```text
//! Invite ─→ known game?  yes → re-ack
//!                        no  → create_from_invite → notify → ack
//! Data   ─→ row? ─no→ undeliverable (kept by sender, not an error)
//!            └─yes→ write lock → apply_inbound
//!                       Delivered → notify
//!                       GameGone  → reply Death (once per game)
//!                       NeedsDict → notify
//! Death  ─→ first time? → mark_remote_gone → notify
//! Ack    ─→ row? ─no→ undeliverable (not remembered)
//!            └─yes→ first time? → confirm_invite → notify
//! ```
//!
//! Replay memory is bounded: the oldest entries go once
//! [`REMEMBERED_COMMANDS`] is reached, and [`CommandMux::forget`] clears
//! a game that left.
//!
//! Handlers never send anything themselves. A reply travels back in
//! [`Dispatch::reply`] and the endpoint that received the command sends
//! it over the same channel.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use narrowband_lock::{GameLocks, LockMode, OnTimeout, OwnerId};
use narrowband_protocol::{Command, CommandTag, GameId, InviteInfo, RowId};
use narrowband_transport::{ChannelType, PeerAddress};
use parking_lot::Mutex;

use crate::collaborators::{
    ApplyOutcome, GameEngine, GameResolver, Notification, NotificationSink,
};
use crate::NarrowbandError;

/// What a dispatched command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An invitation created a new local game.
    GameCreated(RowId),
    /// An invitation for a game we already have.
    AlreadyHave(RowId),
    /// The resolver turned the invitation down.
    InviteRefused(GameId),
    /// A move was applied.
    Delivered(RowId),
    /// No local game for this id yet. Not an error.
    Undeliverable(GameId),
    /// Someone held the game past the lock budget; the move was not
    /// applied.
    Busy(RowId),
    /// The engine says the game is gone.
    GameGone(RowId),
    /// The engine needs a word list first.
    NeedsDict(RowId),
    /// The peer deleted its copy.
    PeerGone(GameId),
    /// The invitee created its copy.
    Confirmed(GameId),
    /// A death notice or ack we've already handled.
    Duplicate,
}

/// How many replayed Death/Ack commands and sent death notices are
/// remembered before the oldest are forgotten.
pub const REMEMBERED_COMMANDS: usize = 1024;

/// Insertion-ordered set that forgets its oldest entries past `cap`.
struct Recent<K> {
    seen: HashSet<K>,
    order: VecDeque<K>,
    cap: usize,
}

impl<K: Clone + Eq + Hash> Recent<K> {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// `true` if `key` was not already present.
    fn insert(&mut self, key: K) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.seen.retain(|k| keep(k));
        let seen = &self.seen;
        self.order.retain(|k| seen.contains(k));
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Outcome of one command plus the command to send back, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub outcome: DispatchOutcome,
    pub reply: Option<Command>,
}

impl Dispatch {
    fn quiet(outcome: DispatchOutcome) -> Self {
        Self {
            outcome,
            reply: None,
        }
    }
}

/// Routes decoded commands to the application's collaborators.
pub struct CommandMux {
    engine: Arc<dyn GameEngine>,
    resolver: Arc<dyn GameResolver>,
    sink: Arc<dyn NotificationSink>,
    locks: GameLocks,
    lock_wait: Duration,
    heard: Mutex<Recent<(CommandTag, GameId, PeerAddress)>>,
    deaths_sent: Mutex<Recent<GameId>>,
}

impl CommandMux {
    /// `lock_wait` bounds how long a Data command waits for its game.
    pub fn new(
        engine: Arc<dyn GameEngine>,
        resolver: Arc<dyn GameResolver>,
        sink: Arc<dyn NotificationSink>,
        locks: GameLocks,
        lock_wait: Duration,
    ) -> Self {
        Self {
            engine,
            resolver,
            sink,
            locks,
            lock_wait,
            heard: Mutex::new(Recent::new(REMEMBERED_COMMANDS)),
            deaths_sent: Mutex::new(Recent::new(REMEMBERED_COMMANDS)),
        }
    }

    /// Drops everything remembered about `game_id`, so a later Death,
    /// Ack or death notice for a game reusing that id is handled afresh.
    /// Call it when the application deletes a game.
    pub fn forget(&self, game_id: GameId) {
        self.heard.lock().retain(|(_, id, _)| *id != game_id);
        self.deaths_sent.lock().retain(|id| *id != game_id);
        tracing::debug!(%game_id, "forgot replay history");
    }

    /// Death/Ack replays and sent death notices currently remembered.
    pub fn remembered(&self) -> usize {
        self.heard.lock().len() + self.deaths_sent.lock().len()
    }

    /// Handles one command from `from`, received over `channel`.
    ///
    /// # Errors
    /// Only lock contract violations, e.g. a resolver handing back a row
    /// that isn't positive. Contention is reported as
    /// [`DispatchOutcome::Busy`].
    pub async fn dispatch(
        &self,
        from: &PeerAddress,
        channel: ChannelType,
        command: Command,
    ) -> Result<Dispatch, NarrowbandError> {
        tracing::debug!(%from, %channel, tag = %command.tag(), game_id = %command.game_id(), "dispatching");
        match command {
            Command::Invite(info) => Ok(self.on_invite(from, channel, &info)),
            Command::Data { game_id, payload } => self.on_data(from, game_id, &payload).await,
            Command::Death { game_id } => Ok(self.on_death(from, game_id)),
            Command::Ack { game_id } => Ok(self.on_ack(from, game_id)),
        }
    }

    fn on_invite(&self, from: &PeerAddress, channel: ChannelType, info: &InviteInfo) -> Dispatch {
        let game_id = info.game_id;
        let ack = Some(Command::Ack { game_id });
        if let Some(row) = self.resolver.row_for_game(game_id) {
            tracing::debug!(%from, %game_id, %row, "invite for a game we already have");
            return Dispatch {
                outcome: DispatchOutcome::AlreadyHave(row),
                reply: ack,
            };
        }

        let Some(row) = self.resolver.create_from_invite(info, from, channel) else {
            tracing::info!(%from, %game_id, "invite refused");
            return Dispatch::quiet(DispatchOutcome::InviteRefused(game_id));
        };
        tracing::info!(%from, %game_id, %row, name = %info.name, "game created from invite");
        self.forget(game_id);
        self.sink.notify(Notification::InviteReceived {
            game_id,
            row,
            from: from.clone(),
            channel,
        });
        Dispatch {
            outcome: DispatchOutcome::GameCreated(row),
            reply: ack,
        }
    }

    async fn on_data(
        &self,
        from: &PeerAddress,
        game_id: GameId,
        payload: &[u8],
    ) -> Result<Dispatch, NarrowbandError> {
        let Some(row) = self.resolver.row_for_game(game_id) else {
            tracing::info!(%from, %game_id, "no local game, move undeliverable for now");
            return Ok(Dispatch::quiet(DispatchOutcome::Undeliverable(game_id)));
        };

        let owner = OwnerId::new();
        let acquired = self
            .locks
            .acquire(row, owner, LockMode::Write, self.lock_wait, OnTimeout::ReturnNone)
            .await?;
        let Some(lock) = acquired else {
            tracing::warn!(%from, %game_id, holders = %self.locks.describe(row), "game busy, move not applied");
            return Ok(Dispatch::quiet(DispatchOutcome::Busy(row)));
        };
        let applied = self.engine.apply_inbound(row, payload, from);
        lock.release()?;

        tracing::debug!(%from, %game_id, %row, ?applied, len = payload.len(), "move applied");
        let dispatch = match applied {
            ApplyOutcome::Delivered => {
                self.sink.notify(Notification::MoveReceived {
                    game_id,
                    row,
                    from: from.clone(),
                });
                Dispatch::quiet(DispatchOutcome::Delivered(row))
            }
            ApplyOutcome::GameGone => Dispatch {
                outcome: DispatchOutcome::GameGone(row),
                reply: self.death_once(game_id),
            },
            ApplyOutcome::NeedsDict => {
                self.sink.notify(Notification::MissingDictionary {
                    game_id,
                    row,
                    from: from.clone(),
                });
                Dispatch::quiet(DispatchOutcome::NeedsDict(row))
            }
        };
        Ok(dispatch)
    }

    fn on_death(&self, from: &PeerAddress, game_id: GameId) -> Dispatch {
        if !self.first_time(CommandTag::Death, game_id, from) {
            tracing::debug!(%from, %game_id, "repeated death notice");
            return Dispatch::quiet(DispatchOutcome::Duplicate);
        }
        if let Some(row) = self.resolver.row_for_game(game_id) {
            self.resolver.mark_remote_gone(row, from);
        }
        tracing::info!(%from, %game_id, "peer deleted game");
        self.sink.notify(Notification::PeerUnreachable {
            game_id,
            from: from.clone(),
        });
        Dispatch::quiet(DispatchOutcome::PeerGone(game_id))
    }

    fn on_ack(&self, from: &PeerAddress, game_id: GameId) -> Dispatch {
        let Some(row) = self.resolver.row_for_game(game_id) else {
            tracing::info!(%from, %game_id, "ack for a game we don't have");
            return Dispatch::quiet(DispatchOutcome::Undeliverable(game_id));
        };
        if !self.first_time(CommandTag::Ack, game_id, from) {
            tracing::debug!(%from, %game_id, "repeated ack");
            return Dispatch::quiet(DispatchOutcome::Duplicate);
        }
        self.resolver.confirm_invite(row, from);
        self.sink.notify(Notification::InviteAccepted {
            game_id,
            from: from.clone(),
        });
        Dispatch::quiet(DispatchOutcome::Confirmed(game_id))
    }

    fn first_time(&self, tag: CommandTag, game_id: GameId, from: &PeerAddress) -> bool {
        self.heard.lock().insert((tag, game_id, from.clone()))
    }

    fn death_once(&self, game_id: GameId) -> Option<Command> {
        if self.deaths_sent.lock().insert(game_id) {
            Some(Command::Death { game_id })
        } else {
            tracing::debug!(%game_id, "death notice already sent");
            None
        }
    }
}
