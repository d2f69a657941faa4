//! Remote connection bridge.
//!
//! Reaches a server behind NAT by rendezvousing over a websocket signaling
//! service and then talking over WebRTC data channels. The bridge keeps that
//! transport honest: per-channel backpressure, detection of channels that
//! still send but no longer receive, and a single-owner reconnection state
//! machine with capped exponential backoff.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_bridge::{Bridge, WebRtcConnector};
//! use tether_protocol::{BridgeConfig, Channel};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = BridgeConfig::default();
//! config.signaling.url = "wss://relay.example.com/ws".to_string();
//! let connector = Arc::new(WebRtcConnector::new(Arc::new(config.clone())));
//! let (bridge, mut events) = Bridge::start(config, connector);
//! bridge.connect("server-A").await?;
//! bridge.send(Channel::Control, r#"{"command":"status"}"#).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod connector;
pub mod error;
pub mod flow;
pub mod health;
pub mod link;
pub mod peer;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod state;

pub use connector::WebRtcConnector;
pub use error::{BridgeError, NegotiationError, SendError, SignalingError};
pub use flow::FlowOverrun;
pub use health::{ChannelFailure, FailureKind};
pub use link::{Connector, DataSink, Epoch, EventSink, Link, LinkEvent, LinkEventKind, Payload};
pub use reconnect::{Bridge, BridgeEvent, Diagnostics, ReconnectAttempt, SessionLoss};
pub use session::ChannelDiagnostics;
pub use state::BridgeState;

use tokio::time::Instant;

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
