//! Seams between the reconnection controller and a concrete transport.
//!
//! A [`Connector`] builds one session ([`Link`]) per attempt. Everything the
//! link observes is reported through the [`EventSink`] it was handed, tagged
//! with the session epoch. Detaching the sink is synchronous and final: a
//! detached sink drops every later event on the floor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tether_protocol::Channel;
use tokio::sync::mpsc;

use crate::error::{BridgeError, SendError};
use crate::signaling::SignalingDisconnected;

/// Monotonic session generation. Never reused within one bridge.
pub type Epoch = u64;

/// One data channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(data) => data,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    /// Inbound message on a physical channel
    Message { channel: Channel, payload: Payload },
    /// Buffered amount fell to the low watermark
    BufferedAmountLow { channel: Channel },
    /// Data channel closed underneath the session
    ChannelClosed { channel: Channel },
    SignalingDisconnected(SignalingDisconnected),
    /// ICE recovery gave up
    TransportFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub epoch: Epoch,
    pub kind: LinkEventKind,
}

/// Epoch-tagged event reporter handed to a link.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: Epoch,
    tx: mpsc::UnboundedSender<LinkEvent>,
    attached: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(epoch: Epoch, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            epoch,
            tx,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Report an event. Returns false once detached (or the controller is gone).
    pub fn emit(&self, kind: LinkEventKind) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        self.tx
            .send(LinkEvent {
                epoch: self.epoch,
                kind,
            })
            .is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Stop forwarding events. Shared by every clone of this sink.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }
}

/// Send side of one data channel.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Bytes queued locally awaiting transmission.
    async fn buffered_amount(&self) -> usize;

    async fn send(&self, payload: &Payload) -> Result<(), SendError>;
}

/// An established session: peer transport, its data channels and the
/// signaling socket that negotiated it.
#[async_trait]
pub trait Link: Send + Sync {
    /// Physical channels of this session.
    fn channels(&self) -> Vec<(Channel, Arc<dyn DataSink>)>;

    /// Unregister every transport callback. Must not block.
    fn detach(&self);

    /// Close channels, then the transport, then the signaling socket.
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Run signaling and negotiation for one session.
    async fn establish(
        &self,
        server_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn Link>, BridgeError>;
}
