//! `Node` builder and the registries it owns.
//!
//! A node is everything one device shares across its channels: the
//! reassembly table, connection health, link state, game locks, the
//! command multiplexer and the message-id counter. Each physical channel
//! then gets an [`Endpoint`] from [`Node::endpoint`].
//!
//! ```text
//! NodeBuilder ─build→ Node ─endpoint(adapter)→ Endpoint<A> ─run(inbound)→ …
//!                      │
//!                      ├─ ReassemblyStore   (shared by every endpoint)
//!                      ├─ ConnectionHealth
//!                      ├─ LinkStateCache ──resend generation──→ endpoints
//!                      ├─ GameLocks ──────→ CommandMux
//!                      └─ MessageIdSource ─→ each endpoint's Packetizer
//! ```

use std::sync::Arc;
use std::time::Duration;

use narrowband_link::{ConnectionHealth, HealthSnapshot, LinkConfig, LinkStateCache};
use narrowband_lock::{GameLocks, LockConfig};
use narrowband_protocol::{
    BatchConfig, Codec, JsonCodec, MessageIdSource, PartialsSnapshot, ReassemblyConfig,
    ReassemblyStore,
};
use narrowband_transport::{ChannelAdapter, ChannelType};
use serde::{Deserialize, Serialize};

use crate::collaborators::{GameEngine, GameResolver, NotificationSink};
use crate::endpoint::Endpoint;
use crate::mux::CommandMux;
use crate::NarrowbandError;

/// Configuration for a [`Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub reassembly: ReassemblyConfig,
    /// Batching for every endpoint's outbound queue.
    pub batch: BatchConfig,
    /// Used only when the builder creates its own link cache.
    pub link: LinkConfig,
    /// Used only when the builder creates its own lock table.
    pub lock: LockConfig,
    /// How long an inbound move waits for its game's lock.
    pub lock_wait: Duration,
    /// Failed packets kept per endpoint for the next resend sweep.
    pub max_resend_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            reassembly: ReassemblyConfig::default(),
            batch: BatchConfig::default(),
            link: LinkConfig::default(),
            lock: LockConfig::default(),
            lock_wait: Duration::from_secs(1),
            max_resend_queue: 64,
        }
    }
}

impl NodeConfig {
    pub fn validated(mut self) -> Self {
        self.reassembly = self.reassembly.validated();
        self.lock = self.lock.validated();
        if self.lock_wait.is_zero() {
            tracing::warn!("lock_wait of 0 would wait without a budget, using 1ms");
            self.lock_wait = Duration::from_millis(1);
        }
        if self.max_resend_queue == 0 {
            tracing::warn!("max_resend_queue of 0, keeping 1 packet");
            self.max_resend_queue = 1;
        }
        self
    }
}

/// Persistable state of a node: partial messages and health records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub partials: PartialsSnapshot,
    pub health: HealthSnapshot,
}

pub(crate) struct NodeInner<C> {
    pub(crate) config: NodeConfig,
    pub(crate) codec: C,
    pub(crate) store: ReassemblyStore,
    pub(crate) health: ConnectionHealth,
    pub(crate) link: LinkStateCache,
    pub(crate) locks: GameLocks,
    pub(crate) mux: CommandMux,
    pub(crate) ids: Arc<MessageIdSource>,
    pub(crate) sink: Arc<dyn NotificationSink>,
}

/// Builder for a [`Node`].
///
/// The game engine, resolver and notification sink are required. The
/// link cache, lock table and message-id source default to fresh ones;
/// pass your own to share them with the rest of the application.
///
/// # Example
///
/// ```rust,ignore
/// let node = Node::builder()
///     .config(NodeConfig::default())
///     .engine(games.clone())
///     .resolver(games)
///     .notifications(|n| println!("{n}"))
///     .build()?;
/// let sms = node.endpoint(sms_adapter);
/// tokio::spawn(async move { sms.run(sms_inbound).await });
/// ```
pub struct NodeBuilder<C: Codec = JsonCodec> {
    config: NodeConfig,
    codec: C,
    engine: Option<Arc<dyn GameEngine>>,
    resolver: Option<Arc<dyn GameResolver>>,
    sink: Option<Arc<dyn NotificationSink>>,
    link: Option<LinkStateCache>,
    locks: Option<GameLocks>,
    ids: Option<Arc<MessageIdSource>>,
}

impl NodeBuilder<JsonCodec> {
    /// Creates a new builder with default settings and `JsonCodec`.
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            codec: JsonCodec,
            engine: None,
            resolver: None,
            sink: None,
            link: None,
            locks: None,
            ids: None,
        }
    }
}

impl Default for NodeBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> NodeBuilder<C> {
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Swaps the codec used for structured command payloads.
    pub fn codec<C2: Codec>(self, codec: C2) -> NodeBuilder<C2> {
        NodeBuilder {
            config: self.config,
            codec,
            engine: self.engine,
            resolver: self.resolver,
            sink: self.sink,
            link: self.link,
            locks: self.locks,
            ids: self.ids,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn GameEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn GameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn notifications(mut self, sink: impl NotificationSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Uses an existing, process-wide link cache.
    pub fn link_state(mut self, link: LinkStateCache) -> Self {
        self.link = Some(link);
        self
    }

    /// Uses an existing lock table, so local moves and inbound moves
    /// contend on the same locks.
    pub fn locks(mut self, locks: GameLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn message_ids(mut self, ids: Arc<MessageIdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Builds the node.
    ///
    /// # Errors
    /// [`NarrowbandError::Config`] when the engine, resolver or
    /// notification sink is missing.
    pub fn build(self) -> Result<Node<C>, NarrowbandError> {
        let config = self.config.validated();
        let engine = self
            .engine
            .ok_or_else(|| NarrowbandError::Config("no game engine".into()))?;
        let resolver = self
            .resolver
            .ok_or_else(|| NarrowbandError::Config("no game resolver".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| NarrowbandError::Config("no notification sink".into()))?;

        // Without a platform probe the link is assumed up.
        let link = self
            .link
            .unwrap_or_else(|| LinkStateCache::new(config.link.clone(), || true));
        let locks = self
            .locks
            .unwrap_or_else(|| GameLocks::new(config.lock.clone()));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(MessageIdSource::new_random()));

        let mux = CommandMux::new(engine, resolver, Arc::clone(&sink), locks.clone(), config.lock_wait);
        tracing::info!(
            lock_wait_ms = config.lock_wait.as_millis() as u64,
            max_resend_queue = config.max_resend_queue,
            "narrowband node ready"
        );
        Ok(Node {
            inner: Arc::new(NodeInner {
                store: ReassemblyStore::new(config.reassembly.clone()),
                health: ConnectionHealth::new(),
                config,
                codec: self.codec,
                link,
                locks,
                mux,
                ids,
                sink,
            }),
        })
    }
}

/// One device's shared transport state. Cheap to clone.
pub struct Node<C: Codec = JsonCodec> {
    pub(crate) inner: Arc<NodeInner<C>>,
}

impl<C: Codec> Clone for Node<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Node<JsonCodec> {
    /// Creates a new builder.
    pub fn builder() -> NodeBuilder<JsonCodec> {
        NodeBuilder::new()
    }
}

impl<C: Codec> Node<C> {
    /// Attaches a channel. Each endpoint has its own outbound queue and
    /// resend list but shares everything else with the node.
    pub fn endpoint<A: ChannelAdapter>(&self, adapter: A) -> Endpoint<A, C> {
        Endpoint::new(self.clone(), adapter)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn store(&self) -> &ReassemblyStore {
        &self.inner.store
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.inner.health
    }

    pub fn link(&self) -> &LinkStateCache {
        &self.inner.link
    }

    pub fn locks(&self) -> &GameLocks {
        &self.inner.locks
    }

    pub fn mux(&self) -> &CommandMux {
        &self.inner.mux
    }

    /// Status text for the listed channels.
    pub fn status_text(&self, channels: &[ChannelType]) -> String {
        self.inner.health.status_text(channels)
    }

    /// Copies partial messages and health records out for persistence.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            partials: self.inner.store.snapshot(),
            health: self.inner.health.snapshot(),
        }
    }

    /// Loads a snapshot taken by [`snapshot`](Self::snapshot), typically
    /// right after startup.
    pub fn restore(&self, snapshot: NodeSnapshot) {
        self.inner.store.restore(snapshot.partials);
        self.inner.health.restore(snapshot.health);
    }
}
