//! Socket channel over WebSocket using `tokio-tungstenite`.
//!
//! Each pair of peers shares one persistent connection, opened lazily by
//! whichever side sends first. Frames are self-delimited JSON text
//! messages: the opener announces its listening address with a `hello`
//! frame, after which both directions carry `packet` frames.
//!
//! The peer table is only locked to look up or swap entries. Connecting
//! and writing happen outside it, each sink behind its own lock, so one
//! slow peer never holds up traffic to the others. Opening a connection
//! and writing a frame are both bounded by the channel's I/O timeout.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::{
    ChannelAdapter, ChannelLimits, ChannelType, InboundPacket, InboundSender,
    PeerAddress, TransportError,
};

type FrameSink =
    Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// One peer's write half. Shared so a send can proceed after the table
/// lock is released.
type SharedSink = Arc<tokio::sync::Mutex<FrameSink>>;

type FrameStream =
    Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

type PeerSinks = Arc<Mutex<HashMap<PeerAddress, SharedSink>>>;

/// Default bound on opening a connection or writing one frame.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One structured frame on the wire.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SocketFrame {
    /// First frame from the connecting side: who I am.
    Hello { addr: PeerAddress },
    /// One raw packet for the upper layers.
    Packet { data: Vec<u8> },
}

impl SocketFrame {
    fn to_message(&self) -> Result<Message, TransportError> {
        let json = serde_json::to_string(self).map_err(TransportError::Frame)?;
        Ok(Message::Text(json.into()))
    }
}

/// A persistent, bidirectional socket [`ChannelAdapter`].
///
/// Peers are addressed by their listening `host:port`.
pub struct SocketChannel {
    local: PeerAddress,
    local_addr: SocketAddr,
    peers: PeerSinks,
    inbound: InboundSender,
    io_timeout: Duration,
    accept_task: JoinHandle<()>,
}

impl SocketChannel {
    /// Binds a listener on `addr` and starts accepting peers. Everything
    /// received is pushed into `inbound`.
    pub async fn bind(
        addr: &str,
        inbound: InboundSender,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        let local_addr = listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)?;
        let local = PeerAddress::new(local_addr.to_string());
        tracing::info!(%local, "socket channel listening");

        let peers: PeerSinks = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            inbound.clone(),
        ));

        Ok(Self {
            local,
            local_addr,
            peers,
            inbound,
            io_timeout: DEFAULT_IO_TIMEOUT,
            accept_task,
        })
    }

    /// Bounds how long opening a connection or writing one frame may
    /// take before the peer is reported unreachable.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Our own address, as peers should use it.
    pub fn address(&self) -> &PeerAddress {
        &self.local
    }

    /// The socket address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peers with an open connection right now.
    pub async fn connected_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<_> = self.peers.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Stops accepting new connections and drops every open one.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let open: Vec<_> = self.peers.lock().drain().collect();
        for (addr, sink) in open {
            if let Err(e) = sink.lock().await.close().await {
                tracing::debug!(%addr, error = %e, "close failed");
            }
        }
    }

    /// The sink for `to`, opening a connection if there is none. Never
    /// called with the peer table locked.
    async fn sink_for(&self, to: &PeerAddress) -> Result<SharedSink, TransportError> {
        let existing = self.peers.lock().get(to).cloned();
        if let Some(sink) = existing {
            return Ok(sink);
        }

        let (sink, stream) = match tokio::time::timeout(self.io_timeout, self.connect(to)).await {
            Ok(opened) => opened?,
            Err(_) => {
                tracing::debug!(%to, timeout = ?self.io_timeout, "connect timed out");
                return Err(TransportError::Unreachable(to.clone()));
            }
        };

        // Both sides may have connected at once; keep whichever sink got
        // into the table first and let the other connection serve reads.
        let (sink, ours) = {
            let mut peers = self.peers.lock();
            match peers.get(to) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
                    peers.insert(to.clone(), Arc::clone(&sink));
                    (sink, true)
                }
            }
        };
        if !ours {
            tracing::debug!(%to, "connection raced with an accepted one");
        }
        tokio::spawn(read_loop(
            stream,
            to.clone(),
            ours.then(|| Arc::clone(&sink)),
            Arc::clone(&self.peers),
            self.inbound.clone(),
        ));
        Ok(sink)
    }

    async fn connect(&self, to: &PeerAddress) -> Result<(FrameSink, FrameStream), TransportError> {
        let url = format!("ws://{to}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            tracing::debug!(%to, error = %e, "connect failed");
            TransportError::Unreachable(to.clone())
        })?;
        let (sink, stream) = ws.split();
        let mut sink: FrameSink = Box::pin(sink);

        let hello = SocketFrame::Hello {
            addr: self.local.clone(),
        };
        sink.send(hello.to_message()?).await.map_err(broken_pipe)?;
        tracing::debug!(%to, "opened socket connection");
        Ok((sink, Box::pin(stream)))
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl ChannelAdapter for SocketChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::P2p
    }

    fn limits(&self) -> ChannelLimits {
        ChannelLimits::SOCKET
    }

    async fn send_raw(
        &self,
        to: &PeerAddress,
        packet: &[u8],
    ) -> Result<(), TransportError> {
        let msg = SocketFrame::Packet {
            data: packet.to_vec(),
        }
        .to_message()?;

        let sink = self.sink_for(to).await?;
        let writer = Arc::clone(&sink);
        let sent = tokio::time::timeout(self.io_timeout, async move {
            writer.lock().await.send(msg).await
        })
        .await;
        let error = match sent {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => broken_pipe(e),
            Err(_) => {
                tracing::debug!(%to, timeout = ?self.io_timeout, "write timed out");
                TransportError::Unreachable(to.clone())
            }
        };
        // Drop the dead connection so the next send reconnects.
        forget_sink(&self.peers, to, &sink);
        Err(error)
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerSinks,
    inbound: InboundSender,
) {
    loop {
        let (stream, addr) = accept_with_backoff(|| listener.accept()).await;
        let peers = Arc::clone(&peers);
        let inbound = inbound.clone();
        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "handshake failed");
                    return;
                }
            };
            let (sink, mut stream) = ws.split();

            // The opener must introduce itself before anything else.
            let Some(peer) = next_frame(&mut stream).await.and_then(|f| match f {
                SocketFrame::Hello { addr } => Some(addr),
                SocketFrame::Packet { .. } => None,
            }) else {
                tracing::debug!(%addr, "connection did not start with hello");
                return;
            };
            tracing::debug!(%peer, %addr, "accepted socket connection");
            let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(Box::pin(sink)));
            peers.lock().insert(peer.clone(), Arc::clone(&sink));

            read_loop(stream, peer, Some(sink), peers, inbound).await;
        });
    }
}

/// Retries `accept` until it succeeds, pausing [`ACCEPT_BACKOFF`] after
/// each failure so a persistent error (out of descriptors) doesn't spin.
async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Forwards packet frames from one connection until it closes, then
/// removes the connection's own sink (if it has one in the table).
async fn read_loop<S>(
    mut stream: S,
    peer: PeerAddress,
    own_sink: Option<SharedSink>,
    peers: PeerSinks,
    inbound: InboundSender,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send,
{
    while let Some(frame) = next_frame(&mut stream).await {
        match frame {
            SocketFrame::Packet { data } => {
                let pkt = InboundPacket {
                    channel: ChannelType::P2p,
                    from: peer.clone(),
                    bytes: data,
                };
                if inbound.send(pkt).is_err() {
                    tracing::debug!(%peer, "inbound queue closed");
                    break;
                }
            }
            SocketFrame::Hello { .. } => {
                tracing::debug!(%peer, "ignoring repeated hello");
            }
        }
    }
    if let Some(sink) = own_sink {
        forget_sink(&peers, &peer, &sink);
    }
    tracing::debug!(%peer, "socket connection closed");
}

/// Removes `peer`'s entry, but only if it still is `sink`. A newer
/// connection may have replaced it meanwhile.
fn forget_sink(peers: &PeerSinks, peer: &PeerAddress, sink: &SharedSink) {
    let mut peers = peers.lock();
    if peers.get(peer).is_some_and(|current| Arc::ptr_eq(current, sink)) {
        peers.remove(peer);
    }
}

/// Reads frames until one parses. `None` once the stream ends or errors.
async fn next_frame<S>(stream: &mut S) -> Option<SocketFrame>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<SocketFrame>(text.as_str()) {
                    Ok(frame) => return Some(frame),
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping unparseable frame");
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue, // skip ping/pong/binary
            Some(Err(e)) => {
                tracing::debug!(error = %e, "socket read failed");
                return None;
            }
        }
    }
}

fn broken_pipe(e: tungstenite::Error) -> TransportError {
    TransportError::SendFailed(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        e,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_json_shape_is_tagged() {
        let json = serde_json::to_string(&SocketFrame::Hello {
            addr: PeerAddress::new("127.0.0.1:9"),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"hello","addr":"127.0.0.1:9"}"#);

        let back: SocketFrame =
            serde_json::from_str(r#"{"kind":"packet","data":[1,2,3]}"#).unwrap();
        assert_eq!(back, SocketFrame::Packet { data: vec![1, 2, 3] });
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off_before_retrying() {
        let attempts = std::cell::Cell::new(0);
        let started = tokio::time::Instant::now();

        let accepted = accept_with_backoff(|| {
            attempts.set(attempts.get() + 1);
            let n = attempts.get();
            async move {
                if n <= 3 {
                    Err(std::io::Error::other("too many open files"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(accepted, 4);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 3);
    }
}
