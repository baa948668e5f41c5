//! Command types: what a verified envelope actually says.
//!
//! Four commands exist. Their payload shapes are fixed here; the game
//! bytes inside `Data` are opaque and belong to the game engine.
//!
//! ```text
//! Invite  tag 1  JSON(InviteInfo)
//! Data    tag 2  [gameId:4 BE][engine bytes...]
//! Death   tag 3  [gameId:4 BE]
//! Ack     tag 4  [gameId:4 BE]
//! ```

use std::fmt;

use narrowband_transport::ChannelType;
use serde::{Deserialize, Serialize};

use crate::{Codec, Envelope, ProtocolError};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Game identifier shared by every participant of one game.
///
/// Displayed as eight hex digits, the form players see in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub u32);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Local storage row of a game. Only meaningful on this device; valid
/// rows are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl RowId {
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Command tag
// ---------------------------------------------------------------------------

/// Leading byte of every envelope, selecting the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandTag {
    Invite = 1,
    Data = 2,
    Death = 3,
    Ack = 4,
}

impl TryFrom<u8> for CommandTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Invite),
            2 => Ok(Self::Data),
            3 => Ok(Self::Death),
            4 => Ok(Self::Ack),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invite => "invite",
            Self::Data => "data",
            Self::Death => "death",
            Self::Ack => "ack",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Invite metadata
// ---------------------------------------------------------------------------

/// Everything the invitee needs to create its own copy of a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteInfo {
    pub game_id: GameId,
    /// Display name of the inviting player.
    pub name: String,
    /// Language code of the game's word list.
    pub lang: String,
    pub players_total: u8,
    /// Players sitting on the inviting device.
    pub players_here: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dict_name: Option<String>,
    /// Channels the inviter can be reached on.
    #[serde(default)]
    pub channels: Vec<ChannelType>,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A decoded, verified command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a new game with the sender.
    Invite(InviteInfo),
    /// A move (or any engine state) for an existing game.
    Data { game_id: GameId, payload: Vec<u8> },
    /// The sender's copy of the game is gone.
    Death { game_id: GameId },
    /// The sender created its copy of a game we invited it to.
    Ack { game_id: GameId },
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Self::Invite(_) => CommandTag::Invite,
            Self::Data { .. } => CommandTag::Data,
            Self::Death { .. } => CommandTag::Death,
            Self::Ack { .. } => CommandTag::Ack,
        }
    }

    pub fn game_id(&self) -> GameId {
        match self {
            Self::Invite(info) => info.game_id,
            Self::Data { game_id, .. } | Self::Death { game_id } | Self::Ack { game_id } => {
                *game_id
            }
        }
    }

    /// Encodes the payload and wraps it in a checksummed envelope.
    /// The result is what gets fragmented.
    pub fn seal<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Self::Invite(info) => codec.encode(info)?,
            Self::Data { game_id, payload } => {
                let mut out = Vec::with_capacity(4 + payload.len());
                out.extend_from_slice(&game_id.0.to_be_bytes());
                out.extend_from_slice(payload);
                out
            }
            Self::Death { game_id } | Self::Ack { game_id } => game_id.0.to_be_bytes().to_vec(),
        };
        Ok(Envelope::seal(self.tag() as u8, payload).to_bytes())
    }

    /// Verifies the envelope of a reassembled message and decodes the
    /// command inside. Corrupted bytes never get past the checksum.
    pub fn open<C: Codec>(bytes: &[u8], codec: &C) -> Result<Self, ProtocolError> {
        let envelope = Envelope::open(bytes)?;
        let tag = CommandTag::try_from(envelope.tag)?;
        let payload = envelope.payload;
        let command = match tag {
            CommandTag::Invite => Self::Invite(codec.decode(&payload)?),
            CommandTag::Data => {
                let game_id = read_game_id(&payload)?;
                Self::Data {
                    game_id,
                    payload: payload[4..].to_vec(),
                }
            }
            CommandTag::Death => Self::Death {
                game_id: read_game_id(&payload)?,
            },
            CommandTag::Ack => Self::Ack {
                game_id: read_game_id(&payload)?,
            },
        };
        Ok(command)
    }
}

fn read_game_id(payload: &[u8]) -> Result<GameId, ProtocolError> {
    let Some(head) = payload.get(..4) else {
        return Err(ProtocolError::Truncated {
            len: payload.len(),
            need: 4,
        });
    };
    Ok(GameId(u32::from_be_bytes([head[0], head[1], head[2], head[3]])))
}
