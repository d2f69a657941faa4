use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tether_protocol::{BridgeConfig, Channel, ChannelMode, MuxTag, decode_mux, encode_mux};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SendError;
use crate::flow::{Dispatch, FlowController, Outbound};
use crate::health::ChannelCounters;
use crate::link::{DataSink, Epoch, EventSink, Link, Payload};

/// Per-channel view exposed to the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDiagnostics {
    pub channel: Channel,
    pub sent: u64,
    pub recv: u64,
    pub buffered_amount: usize,
    /// None until the first inbound message
    pub last_recv_age: Option<Duration>,
    pub paused: bool,
    pub queued: usize,
}

pub struct ChannelState {
    pub channel: Channel,
    pub sent: u64,
    pub recv: u64,
    pub last_recv_at: Option<Instant>,
    pub buffered_amount: usize,
    flow: FlowController,
    sink: Arc<dyn DataSink>,
}

impl ChannelState {
    fn new(channel: Channel, sink: Arc<dyn DataSink>, config: &BridgeConfig) -> Self {
        Self {
            channel,
            sent: 0,
            recv: 0,
            last_recv_at: None,
            buffered_amount: 0,
            flow: FlowController::new(channel, &config.flow),
            sink,
        }
    }

    async fn drain(&mut self) -> Result<usize, SendError> {
        let delivered = self.flow.drain(self.sink.as_ref()).await?;
        self.sent += delivered as u64;
        self.buffered_amount = self.sink.buffered_amount().await;
        Ok(delivered)
    }
}

/// The live session: one link, its channel states and the sink its
/// callbacks report through. Owned by the controller task.
pub struct ConnectionSession {
    id: Uuid,
    epoch: Epoch,
    link: Box<dyn Link>,
    events: EventSink,
    mode: ChannelMode,
    channels: BTreeMap<Channel, ChannelState>,
    created_at: Instant,
}

impl ConnectionSession {
    pub fn new(link: Box<dyn Link>, events: EventSink, config: &BridgeConfig) -> Self {
        let channels = link
            .channels()
            .into_iter()
            .map(|(channel, sink)| (channel, ChannelState::new(channel, sink, config)))
            .collect();
        let session = Self {
            id: Uuid::new_v4(),
            epoch: events.epoch(),
            link,
            events,
            mode: config.channels.mode,
            channels,
            created_at: Instant::now(),
        };
        info!(session_id = %session.id, epoch = session.epoch, "Session installed");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn physical(&self, channel: Channel) -> Channel {
        match self.mode {
            ChannelMode::Dual => channel,
            ChannelMode::Multiplexed => Channel::Control,
        }
    }

    /// Send one message on a logical channel through its flow controller.
    pub async fn send(&mut self, channel: Channel, msg: Outbound) -> Result<Dispatch, SendError> {
        let msg = match self.mode {
            ChannelMode::Dual => msg,
            ChannelMode::Multiplexed => {
                let tag = MuxTag::for_message(channel, msg.payload.is_binary())
                    .map_err(|e| SendError::Unsupported(e.to_string()))?;
                let framed = encode_mux(tag, msg.payload.as_bytes());
                Outbound {
                    payload: Payload::Binary(Bytes::from(framed)),
                    critical: msg.critical,
                }
            }
        };
        let physical = self.physical(channel);
        let state = self
            .channels
            .get_mut(&physical)
            .ok_or(SendError::UnknownChannel(channel))?;
        let dispatch = state.flow.send(state.sink.as_ref(), msg).await?;
        state.sent += dispatch.delivered as u64;
        state.buffered_amount = state.sink.buffered_amount().await;
        Ok(dispatch)
    }

    /// Count an inbound message and unwrap it into logical messages.
    pub fn record_inbound(&mut self, channel: Channel, payload: Payload) -> Option<(Channel, Payload)> {
        let Some(state) = self.channels.get_mut(&channel) else {
            debug!(%channel, "Inbound message on unknown channel");
            return None;
        };
        state.recv += 1;
        state.last_recv_at = Some(Instant::now());

        match self.mode {
            ChannelMode::Dual => Some((channel, payload)),
            ChannelMode::Multiplexed => match decode_mux(payload.as_bytes()) {
                Ok((tag, body)) => {
                    let payload = if tag.is_binary() {
                        Payload::Binary(Bytes::copy_from_slice(body))
                    } else {
                        Payload::Text(String::from_utf8_lossy(body).into_owned())
                    };
                    Some((tag.channel(), payload))
                }
                Err(e) => {
                    warn!(epoch = self.epoch, "Dropping multiplexed frame: {e}");
                    None
                }
            },
        }
    }

    /// Drain after a low-watermark notification.
    pub async fn drain(&mut self, channel: Channel) -> Result<usize, SendError> {
        match self.channels.get_mut(&channel) {
            Some(state) => state.drain().await,
            None => Ok(0),
        }
    }

    /// Drain every channel whose transport buffer is already back at the low
    /// watermark.
    pub async fn drain_ready(&mut self) {
        for state in self.channels.values_mut() {
            state.buffered_amount = state.sink.buffered_amount().await;
            if !state.flow.should_drain(state.buffered_amount) {
                continue;
            }
            match state.drain().await {
                Ok(delivered) => debug!(channel = %state.channel, delivered, "Tick drain"),
                Err(e) => warn!(channel = %state.channel, "Tick drain failed: {e}"),
            }
        }
    }

    pub fn counters(&self, now: Instant) -> Vec<ChannelCounters> {
        self.channels
            .values()
            .map(|state| ChannelCounters {
                channel: state.channel,
                sent: state.sent,
                recv: state.recv,
                last_recv_age: now.duration_since(state.last_recv_at.unwrap_or(self.created_at)),
            })
            .collect()
    }

    pub async fn diagnostics(&mut self) -> Vec<ChannelDiagnostics> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.channels.len());
        for state in self.channels.values_mut() {
            state.buffered_amount = state.sink.buffered_amount().await;
            out.push(ChannelDiagnostics {
                channel: state.channel,
                sent: state.sent,
                recv: state.recv,
                buffered_amount: state.buffered_amount,
                last_recv_age: state.last_recv_at.map(|at| now.duration_since(at)),
                paused: state.flow.is_paused(),
                queued: state.flow.queued(),
            });
        }
        out
    }

    /// Detach every callback, then close channels, transport and signaling.
    pub async fn teardown(mut self) {
        self.events.detach();
        self.link.detach();
        let dropped: usize = self
            .channels
            .values_mut()
            .map(|state| state.flow.clear())
            .sum();
        info!(
            session_id = %self.id,
            epoch = self.epoch,
            dropped,
            age = ?self.created_at.elapsed(),
            "Tearing down session"
        );
        self.link.close().await;
    }
}
