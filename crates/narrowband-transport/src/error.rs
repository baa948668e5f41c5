use crate::PeerAddress;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No route to the peer right now (unknown address, link down).
    #[error("peer {0} is unreachable")]
    Unreachable(PeerAddress),

    /// The platform refused to send on our behalf (missing permission,
    /// channel disabled by the user).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// A structured frame on a socket channel could not be (de)serialized.
    #[error("bad frame: {0}")]
    Frame(#[source] serde_json::Error),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// `true` when the failure comes from the platform refusing the send
    /// rather than from the network.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}
