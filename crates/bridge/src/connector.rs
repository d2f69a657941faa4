use std::sync::Arc;

use async_trait::async_trait;
use tether_protocol::BridgeConfig;

use crate::error::BridgeError;
use crate::link::{Connector, EventSink, Link};
use crate::peer::PeerConnectionManager;
use crate::signaling::SignalingClient;

/// Production connector: rendezvous over websocket, then WebRTC.
pub struct WebRtcConnector {
    config: Arc<BridgeConfig>,
    peers: PeerConnectionManager,
}

impl WebRtcConnector {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            peers: PeerConnectionManager::new(Arc::clone(&config)),
            config,
        }
    }
}

#[async_trait]
impl Connector for WebRtcConnector {
    async fn establish(
        &self,
        server_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn Link>, BridgeError> {
        let (signaling, signal_rx, grant) =
            SignalingClient::connect(&self.config.signaling, server_id).await?;
        let session = self
            .peers
            .create_session(signaling, signal_rx, grant, events)
            .await?;
        Ok(Box::new(session))
    }
}
