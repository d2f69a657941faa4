use std::time::Duration;

use tether_protocol::Channel;
use tokio_tungstenite::tungstenite;

/// Failures talking to the rendezvous service.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling service unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    #[error("signaling protocol error: {0}")]
    Protocol(String),
    /// Auth failure or unknown server id
    #[error("signaling service rejected the request: {0}")]
    Rejected(String),
    #[error("no acknowledgment from signaling service within {0:?}")]
    AckTimeout(Duration),
    /// Socket closed before the ack arrived
    #[error("signaling socket closed {after:?} after connecting (code {code:?}): {reason}")]
    ClosedEarly {
        code: Option<u16>,
        reason: String,
        after: Duration,
    },
    #[error("signaling socket is closed")]
    Closed,
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Failures while building the peer transport.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("peer connection error: {0}")]
    PeerConnection(#[from] webrtc::Error),
    #[error("no SDP answer within {0:?}")]
    AnswerTimeout(Duration),
    #[error("{channel} data channel did not open within {timeout:?}")]
    ChannelOpenTimeout { channel: Channel, timeout: Duration },
    #[error("signaling ended during negotiation: {0}")]
    SignalingLost(String),
    #[error("remote side refused the session: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("bridge is not connected")]
    NotConnected,
    #[error("no {0} channel in this session")]
    UnknownChannel(Channel),
    #[error("{0}")]
    Unsupported(String),
    #[error("transport send failed: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect was cancelled by disconnect")]
    Cancelled,
    #[error("bridge task has shut down")]
    Shutdown,
}
