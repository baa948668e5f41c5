//! # Narrowband
//!
//! Game-message transport for channels that are small, unordered,
//! unreliable and billed per packet.
//!
//! The application implements three collaborator traits
//! ([`GameEngine`], [`GameResolver`], [`NotificationSink`]), builds a
//! [`Node`] and attaches one [`Endpoint`] per physical channel. From then
//! on it sends [`Command`](protocol::Command)s and hears about what arrived through the
//! collaborators, whichever channel carried the bytes.
//!
//! ## Layers
//!
//! - `narrowband-transport`: addresses, channel kinds and limits, the
//!   [`ChannelAdapter`](transport::ChannelAdapter) contract, an in-memory datagram network and a
//!   WebSocket channel.
//! - `narrowband-protocol`: commands, the checksummed envelope,
//!   fragmenting, batching and reassembly.
//! - `narrowband-link`: connection health and debounced link state.
//! - `narrowband-lock`: per-game read/write locks.
//! - this crate: the command multiplexer, [`Node`] and [`Endpoint`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use narrowband::prelude::*;
//!
//! // Implement GameEngine and GameResolver over your storage, then:
//! // let node = Node::builder()
//! //     .engine(games.clone())
//! //     .resolver(games)
//! //     .notifications(|n: Notification| println!("{n}"))
//! //     .build()?;
//! // let (adapter, inbound) = MemoryNetwork::datagram().join("+15555550100");
//! // let endpoint = node.endpoint(adapter);
//! // endpoint.run(inbound).await;
//! ```

mod collaborators;
mod endpoint;
mod error;
mod mux;
mod node;

pub use collaborators::{ApplyOutcome, GameEngine, GameResolver, Notification, NotificationSink};
pub use endpoint::Endpoint;
pub use error::NarrowbandError;
pub use mux::{CommandMux, Dispatch, DispatchOutcome, REMEMBERED_COMMANDS};
pub use node::{Node, NodeBuilder, NodeConfig, NodeSnapshot};

pub use narrowband_link as link;
pub use narrowband_lock as lock;
pub use narrowband_protocol as protocol;
pub use narrowband_transport as transport;

/// Everything most applications need, in one import.
pub mod prelude {
    pub use crate::{
        ApplyOutcome, CommandMux, Dispatch, DispatchOutcome, Endpoint, GameEngine, GameResolver,
        NarrowbandError, Node, NodeBuilder, NodeConfig, NodeSnapshot, Notification,
        NotificationSink,
    };
    pub use narrowband_link::{
        ConnectionHealth, IconState, LinkConfig, LinkEvent, LinkHealth, LinkStateCache,
    };
    pub use narrowband_lock::{GameLock, GameLocks, LockConfig, LockError, LockMode, OnTimeout, OwnerId};
    pub use narrowband_protocol::{
        BatchConfig, Codec, Command, GameId, InviteInfo, JsonCodec, MessageIdSource,
        ReassemblyConfig, RowId,
    };
    pub use narrowband_transport::{
        ChannelAdapter, ChannelLimits, ChannelType, Direction, InboundPacket, MemoryChannel,
        MemoryNetwork, PeerAddress, TransportError,
    };
}
