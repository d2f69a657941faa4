use std::fmt;

use serde::{Deserialize, Serialize};

/// Signaling messages exchanged with the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Ask the rendezvous service to route this socket to a server
    ConnectRequest { server_id: String },
    /// Rendezvous acknowledgment of a connect-request
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Extra ICE servers (usually TURN with short-lived credentials)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServerInfo>,
    },
    /// WebRTC SDP offer from the client
    Offer { sdp: String },
    /// WebRTC SDP answer from the remote server
    Answer { sdp: String },
    /// Trickled ICE candidate, in either direction
    IceCandidate { candidate: IceCandidate },
    /// The remote server went away; the session is dead
    PeerDisconnected,
    /// Rejection (unknown server, bad token) or protocol error
    Error { message: String },
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// ICE server entry handed out by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Logical data channel carried by the peer connection.
///
/// `Control` carries the JSON command protocol, `Media` carries the audio
/// streaming protocol (JSON control messages plus binary chunks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Control,
    Media,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Control, Channel::Media];

    /// Data channel label the remote side expects.
    pub fn default_label(self) -> &'static str {
        match self {
            Channel::Control => "api",
            Channel::Media => "sendspin",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => f.write_str("control"),
            Channel::Media => f.write_str("media"),
        }
    }
}
