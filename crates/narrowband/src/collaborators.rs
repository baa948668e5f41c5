//! What Narrowband needs from the rest of the application.
//!
//! The transport core never touches boards, tiles, dictionaries or
//! storage. It reaches them through three seams:
//!
//! - [`GameEngine`]: applies an inbound move to a stored game.
//! - [`GameResolver`]: maps game ids to local rows and creates games
//!   from invitations.
//! - [`NotificationSink`]: receives the events a user should hear about.
//!
//! Implement them over your own storage and UI, then hand them to
//! [`NodeBuilder`](crate::NodeBuilder).
//!
//! # Example
//!
//! ```rust
//! use narrowband::{ApplyOutcome, GameEngine};
//! use narrowband_protocol::RowId;
//! use narrowband_transport::PeerAddress;
//!
//! /// Accepts every move and drops it on the floor.
//! struct NullEngine;
//!
//! impl GameEngine for NullEngine {
//!     fn apply_inbound(&self, _row: RowId, _bytes: &[u8], _from: &PeerAddress) -> ApplyOutcome {
//!         ApplyOutcome::Delivered
//!     }
//! }
//! ```

use std::fmt;

use narrowband_protocol::{GameId, InviteInfo, RowId};
use narrowband_transport::{ChannelType, PeerAddress};

/// Result of handing inbound engine bytes to a stored game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The move was applied.
    Delivered,
    /// The row exists but its game was deleted underneath us.
    GameGone,
    /// The game needs a word list this device doesn't have.
    NeedsDict,
}

/// Applies inbound moves. Called with the game's write lock held.
pub trait GameEngine: Send + Sync + 'static {
    fn apply_inbound(&self, row: RowId, bytes: &[u8], from: &PeerAddress) -> ApplyOutcome;
}

/// Local game storage as seen by the command handlers.
pub trait GameResolver: Send + Sync + 'static {
    /// The local row holding `game_id`, if any.
    fn row_for_game(&self, game_id: GameId) -> Option<RowId>;

    /// Materializes a new game bound to the inviter. `None` means the
    /// invitation was refused and no acknowledgment should be sent.
    fn create_from_invite(
        &self,
        invite: &InviteInfo,
        from: &PeerAddress,
        channel: ChannelType,
    ) -> Option<RowId>;

    /// The remote party of `row` deleted its copy.
    fn mark_remote_gone(&self, row: RowId, from: &PeerAddress);

    /// The invitee created its copy; `row` can leave "invite pending".
    fn confirm_invite(&self, row: RowId, from: &PeerAddress);
}

/// An event worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    InviteReceived {
        game_id: GameId,
        row: RowId,
        from: PeerAddress,
        channel: ChannelType,
    },
    MoveReceived {
        game_id: GameId,
        row: RowId,
        from: PeerAddress,
    },
    /// The peer no longer has the game.
    PeerUnreachable { game_id: GameId, from: PeerAddress },
    /// An invitee accepted and created the game.
    InviteAccepted { game_id: GameId, from: PeerAddress },
    MissingDictionary {
        game_id: GameId,
        row: RowId,
        from: PeerAddress,
    },
    SendFailed { channel: ChannelType, to: PeerAddress },
    /// The platform refused to send; the user has to grant something.
    SendFailedNoPermission { channel: ChannelType, to: PeerAddress },
    /// A channel stopped delivering to us.
    ReceiveFailed { channel: ChannelType },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InviteReceived {
                game_id,
                from,
                channel,
                ..
            } => write!(f, "New game {game_id} from {from} via {channel}"),
            Self::MoveReceived { game_id, from, .. } => {
                write!(f, "New move in game {game_id} from {from}")
            }
            Self::PeerUnreachable { game_id, from } => {
                write!(f, "{from} deleted game {game_id}")
            }
            Self::InviteAccepted { game_id, from } => {
                write!(f, "{from} accepted the invitation to game {game_id}")
            }
            Self::MissingDictionary { game_id, .. } => {
                write!(f, "Game {game_id} needs a word list you don't have")
            }
            Self::SendFailed { channel, to } => write!(f, "Unable to send to {to} via {channel}"),
            Self::SendFailedNoPermission { channel, to } => {
                write!(f, "Not allowed to send to {to} via {channel}")
            }
            Self::ReceiveFailed { channel } => write!(f, "Stopped receiving via {channel}"),
        }
    }
}

/// Where [`Notification`]s go. Closures work directly.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

impl<F> NotificationSink for F
where
    F: Fn(Notification) + Send + Sync + 'static,
{
    fn notify(&self, notification: Notification) {
        self(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_display_names_game_and_peer() {
        let n = Notification::PeerUnreachable {
            game_id: GameId(0xBEEF),
            from: PeerAddress::new("+15555550100"),
        };
        assert_eq!(n.to_string(), "+15555550100 deleted game 0000BEEF");
    }

    #[test]
    fn test_closure_sink_receives_notification() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        let sink = move |n: Notification| log.lock().unwrap().push(n);
        sink.notify(Notification::ReceiveFailed {
            channel: ChannelType::Sms,
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
