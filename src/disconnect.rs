use std::fmt::{Display, Formatter};

/// Why a session ended. Used internally to drive teardown and surfaced to callers
///  through the dispatcher's disconnect notification.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectReason {
    /// the remote peer closed the connection in an orderly fashion
    ClosedByRemotePeer,
    /// the local endpoint is shutting down
    ShuttingDown,
    /// explicit disconnect through the session API
    Disconnected,
    /// no traffic (or no ACK progress) inside the configured idle window
    TimedOut,
    /// an outbound connection attempt did not complete
    ConnectionRequestFailed,
    /// a connection attempt from a peer that is already connected
    AlreadyConnected,
    /// the accepting side is at its connection limit
    NoFreeIncomingConnections,
    IncompatibleProtocolVersion,
    /// the same IP attempted to connect again inside the cooldown window
    IpRecentlyConnected,
    /// a malformed or out-of-range frame - trust in the rest of the stream is void
    BadPacket,
    /// the outbound send queue exceeded its configured bound
    QueueTooLong,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    /// traffic with the peer has started but the connection is not established yet
    Handshaking,
    Connected,
    /// an orderly close is in progress, no new sends are accepted
    Disconnecting,
    /// terminal
    Closed,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Handshaking | ConnectionState::Connected)
    }
}
