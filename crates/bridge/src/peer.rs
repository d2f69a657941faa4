use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tether_protocol::{BridgeConfig, Channel, IceCandidate, IceConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{NegotiationError, SendError};
use crate::link::{DataSink, EventSink, Link, LinkEventKind, Payload};
use crate::signaling::{SessionGrant, SignalingClient, SignalingDisconnected, SignalingEvent};
use crate::sleep_until;

/// What to do after an ICE state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceAction {
    Nothing,
    /// Arm the grace timer
    StartGrace,
    CancelGrace,
    /// Renegotiate with fresh ICE credentials; arms the restart watchdog
    Restart,
    /// Give the session up
    Escalate(String),
}

/// ICE recovery policy for one session: a grace period for `disconnected`,
/// a single restart for `failed`, escalation after that.
#[derive(Debug, Default)]
pub struct IceRecovery {
    restarted: bool,
    timer_armed: bool,
}

impl IceRecovery {
    pub fn on_state(&mut self, state: RTCIceConnectionState) -> IceAction {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                if std::mem::take(&mut self.timer_armed) {
                    IceAction::CancelGrace
                } else {
                    IceAction::Nothing
                }
            }
            RTCIceConnectionState::Disconnected if !self.timer_armed => {
                self.timer_armed = true;
                IceAction::StartGrace
            }
            RTCIceConnectionState::Failed => {
                self.timer_armed = false;
                self.fail()
            }
            _ => IceAction::Nothing,
        }
    }

    /// The grace period (or restart watchdog) ran out without recovery.
    pub fn on_timer_expired(&mut self) -> IceAction {
        if std::mem::take(&mut self.timer_armed) {
            self.fail()
        } else {
            IceAction::Nothing
        }
    }

    fn fail(&mut self) -> IceAction {
        if self.restarted {
            IceAction::Escalate("ICE failed again after restart".to_string())
        } else {
            self.restarted = true;
            self.timer_armed = true;
            IceAction::Restart
        }
    }
}

/// Builds peer sessions: one peer connection and its data channels per call.
#[derive(Clone)]
pub struct PeerConnectionManager {
    config: Arc<BridgeConfig>,
}

impl PeerConnectionManager {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self { config }
    }

    /// Negotiate a session over an acknowledged signaling socket. Data
    /// channels are created before the offer; the remote side only answers
    /// client-initiated channels.
    pub async fn create_session(
        &self,
        signaling: SignalingClient,
        signal_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        grant: SessionGrant,
        events: EventSink,
    ) -> Result<PeerSession, NegotiationError> {
        let signaling = Arc::new(signaling);
        let epoch = events.epoch();

        let mut media_engine = MediaEngine::default();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&self.config.ice, &grant),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = ice_tx.send(state);
            Box::pin(async {})
        }));
        pc.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!(epoch, "Peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!(epoch, "Peer connection disconnected"),
                _ => info!(epoch, ?state, "Peer connection state changed"),
            }
            Box::pin(async {})
        }));
        let candidate_signaling: Weak<SignalingClient> = Arc::downgrade(&signaling);
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let (Some(c), Some(signaling)) = (candidate, candidate_signaling.upgrade()) {
                match c.to_json() {
                    Ok(json) => {
                        let candidate = IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        };
                        if let Err(e) = signaling.send_ice_candidate(candidate) {
                            debug!("Dropping local ICE candidate: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        // Anything opened from here on is closed again if this future is
        // dropped (attempt timeout or cancellation) before it completes.
        let pump = Arc::new(Mutex::new(None));
        let mut guard = AttemptGuard {
            pc: Arc::clone(&pc),
            signaling: Arc::clone(&signaling),
            pump: Arc::clone(&pump),
            events: events.clone(),
            armed: true,
        };

        let mut channels = Vec::new();
        let mut opened = Vec::new();
        for &channel in self.config.channels.physical_channels() {
            let label = self.config.channels.label(channel);
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc.create_data_channel(label, Some(init)).await?;
            opened.push((channel, wire_channel(&dc, channel, &events, self.config.flow.low_watermark).await));
            channels.push((channel, dc));
        }

        let session = PeerSession {
            pc,
            channels,
            signaling,
            events,
            pump,
        };

        let negotiated = self.negotiate(&session, signal_rx, ice_rx, opened).await;
        guard.armed = false;
        if let Err(e) = negotiated {
            session.detach();
            session.close().await;
            return Err(e);
        }
        info!(epoch, channels = session.channels.len(), "Peer session established");
        Ok(session)
    }

    async fn negotiate(
        &self,
        session: &PeerSession,
        mut signal_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        ice_rx: mpsc::UnboundedReceiver<RTCIceConnectionState>,
        opened: Vec<(Channel, oneshot::Receiver<()>)>,
    ) -> Result<(), NegotiationError> {
        let pc = &session.pc;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        session
            .signaling
            .send_offer(offer.sdp)
            .map_err(|e| NegotiationError::SignalingLost(e.to_string()))?;
        debug!("SDP offer sent");

        // Candidates may race ahead of the answer
        let mut early_candidates = Vec::new();
        let answer_timeout = self.config.reconnect.answer_timeout();
        let deadline = Instant::now() + answer_timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, signal_rx.recv())
                .await
                .map_err(|_| NegotiationError::AnswerTimeout(answer_timeout))?;
            match event {
                Some(SignalingEvent::Answer { sdp }) => {
                    pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                        .await?;
                    break;
                }
                Some(SignalingEvent::IceCandidate(candidate)) => early_candidates.push(candidate),
                Some(SignalingEvent::Error { message }) => {
                    return Err(NegotiationError::Rejected(message));
                }
                Some(SignalingEvent::PeerDisconnected) => {
                    return Err(NegotiationError::SignalingLost(
                        "remote server disconnected".to_string(),
                    ));
                }
                Some(SignalingEvent::Disconnected(d)) => {
                    return Err(NegotiationError::SignalingLost(d.reason));
                }
                None => return Err(NegotiationError::SignalingLost("event stream ended".to_string())),
            }
        }
        debug!(buffered = early_candidates.len(), "SDP answer applied");
        for candidate in early_candidates {
            add_remote_candidate(pc, candidate).await;
        }

        // Remaining candidates and ICE transitions are handled by the pump
        // while the channels come up.
        let pump = tokio::spawn(run_pump(PumpCtx {
            pc: Arc::clone(pc),
            signaling: Arc::clone(&session.signaling),
            events: session.events.clone(),
            signal_rx,
            ice_rx,
            ice_grace: self.config.reconnect.ice_grace(),
            restart_watchdog: answer_timeout + self.config.reconnect.ice_grace(),
        }));
        if let Ok(mut guard) = session.pump.lock() {
            *guard = Some(pump);
        }

        let open_timeout = self.config.channels.open_timeout();
        let deadline = Instant::now() + open_timeout;
        for (channel, rx) in opened {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(())) => debug!(%channel, "Data channel open"),
                _ => {
                    return Err(NegotiationError::ChannelOpenTimeout {
                        channel,
                        timeout: open_timeout,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Closes a half-built session whose negotiation future was dropped.
struct AttemptGuard {
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<SignalingClient>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
    events: EventSink,
    armed: bool,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let epoch = self.events.epoch();
        self.events.detach();
        if let Ok(mut guard) = self.pump.lock()
            && let Some(pump) = guard.take()
        {
            pump.abort();
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(epoch, "No runtime left to close an abandoned attempt on");
            return;
        };
        debug!(epoch, "Attempt abandoned mid-negotiation, closing its transport");
        let pc = Arc::clone(&self.pc);
        let signaling = Arc::clone(&self.signaling);
        handle.spawn(async move {
            if let Err(e) = pc.close().await {
                debug!(epoch, "Closing abandoned peer connection: {e}");
            }
            signaling.close().await;
        });
    }
}

/// Register data channel callbacks. Returns a receiver that fires on open.
async fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    channel: Channel,
    events: &EventSink,
    low_watermark: usize,
) -> oneshot::Receiver<()> {
    let (open_tx, open_rx) = oneshot::channel();
    dc.on_open(Box::new(move || {
        let _ = open_tx.send(());
        Box::pin(async {})
    }));

    let sink = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let payload = if msg.is_string {
            Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            Payload::Binary(msg.data)
        };
        sink.emit(LinkEventKind::Message { channel, payload });
        Box::pin(async {})
    }));

    let sink = events.clone();
    dc.on_close(Box::new(move || {
        sink.emit(LinkEventKind::ChannelClosed { channel });
        Box::pin(async {})
    }));

    dc.set_buffered_amount_low_threshold(low_watermark).await;
    let sink = events.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        sink.emit(LinkEventKind::BufferedAmountLow { channel });
        Box::pin(async {})
    }))
    .await;

    open_rx
}

fn ice_servers(ice: &IceConfig, grant: &SessionGrant) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers.extend(grant.ice_servers.iter().map(|s| RTCIceServer {
        urls: s.urls.clone(),
        username: s.username.clone().unwrap_or_default(),
        credential: s.credential.clone().unwrap_or_default(),
    }));
    servers
}

async fn add_remote_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        ..Default::default()
    };
    if let Err(e) = pc.add_ice_candidate(init).await {
        warn!("Failed to add ICE candidate: {e}");
    }
}

struct PumpCtx {
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<SignalingClient>,
    events: EventSink,
    signal_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    ice_rx: mpsc::UnboundedReceiver<RTCIceConnectionState>,
    ice_grace: Duration,
    restart_watchdog: Duration,
}

/// Per-session loop: trickled candidates, restart answers, ICE recovery and
/// signaling loss.
async fn run_pump(mut ctx: PumpCtx) {
    let epoch = ctx.events.epoch();
    let mut recovery = IceRecovery::default();
    let mut deadline: Option<Instant> = None;
    let mut awaiting_answer = false;
    let mut signaling_open = true;

    loop {
        tokio::select! {
            event = ctx.signal_rx.recv(), if signaling_open => match event {
                Some(SignalingEvent::IceCandidate(candidate)) => {
                    add_remote_candidate(&ctx.pc, candidate).await;
                }
                Some(SignalingEvent::Answer { sdp }) if awaiting_answer => {
                    awaiting_answer = false;
                    let applied = match RTCSessionDescription::answer(sdp) {
                        Ok(answer) => ctx.pc.set_remote_description(answer).await,
                        Err(e) => Err(e),
                    };
                    match applied {
                        Ok(()) => info!(epoch, "ICE restart answer applied"),
                        Err(e) => {
                            ctx.events.emit(LinkEventKind::TransportFailed {
                                reason: format!("ICE restart answer rejected: {e}"),
                            });
                        }
                    }
                }
                Some(SignalingEvent::Answer { .. }) => debug!(epoch, "Ignoring unsolicited SDP answer"),
                Some(SignalingEvent::Error { message }) => {
                    warn!(epoch, %message, "Signaling service reported an error");
                }
                Some(SignalingEvent::PeerDisconnected) => {
                    ctx.events.emit(LinkEventKind::SignalingDisconnected(SignalingDisconnected {
                        code: None,
                        reason: "remote server disconnected".to_string(),
                        lifetime: ctx.signaling.uptime(),
                    }));
                }
                Some(SignalingEvent::Disconnected(d)) => {
                    signaling_open = false;
                    ctx.events.emit(LinkEventKind::SignalingDisconnected(d));
                }
                None => signaling_open = false,
            },
            Some(state) = ctx.ice_rx.recv() => {
                info!(epoch, %state, "ICE connection state changed");
                let action = recovery.on_state(state);
                if apply_ice_action(&ctx, action, &mut deadline, &mut awaiting_answer).await {
                    break;
                }
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                warn!(epoch, "ICE did not recover in time");
                let action = recovery.on_timer_expired();
                if apply_ice_action(&ctx, action, &mut deadline, &mut awaiting_answer).await {
                    break;
                }
            }
            else => break,
        }
    }
}

/// Returns true when the session has been escalated and the pump should stop.
async fn apply_ice_action(
    ctx: &PumpCtx,
    action: IceAction,
    deadline: &mut Option<Instant>,
    awaiting_answer: &mut bool,
) -> bool {
    match action {
        IceAction::Nothing => false,
        IceAction::StartGrace => {
            *deadline = Some(Instant::now() + ctx.ice_grace);
            false
        }
        IceAction::CancelGrace => {
            *deadline = None;
            false
        }
        IceAction::Restart => {
            warn!(epoch = ctx.events.epoch(), "Attempting ICE restart");
            *deadline = Some(Instant::now() + ctx.restart_watchdog);
            match restart_ice(&ctx.pc, &ctx.signaling).await {
                Ok(()) => {
                    *awaiting_answer = true;
                    false
                }
                Err(reason) => {
                    ctx.events.emit(LinkEventKind::TransportFailed { reason });
                    true
                }
            }
        }
        IceAction::Escalate(reason) => {
            ctx.events.emit(LinkEventKind::TransportFailed { reason });
            true
        }
    }
}

async fn restart_ice(pc: &RTCPeerConnection, signaling: &SignalingClient) -> Result<(), String> {
    let options = RTCOfferOptions {
        ice_restart: true,
        ..Default::default()
    };
    let offer = pc
        .create_offer(Some(options))
        .await
        .map_err(|e| format!("ICE restart offer failed: {e}"))?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(|e| format!("ICE restart offer failed: {e}"))?;
    signaling
        .send_offer(offer.sdp)
        .map_err(|e| format!("cannot relay ICE restart offer: {e}"))
}

/// One negotiated session: peer connection, data channels, signaling socket.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    channels: Vec<(Channel, Arc<RTCDataChannel>)>,
    signaling: Arc<SignalingClient>,
    events: EventSink,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

#[async_trait]
impl Link for PeerSession {
    fn channels(&self) -> Vec<(Channel, Arc<dyn DataSink>)> {
        self.channels
            .iter()
            .map(|(channel, dc)| (*channel, Arc::clone(dc) as Arc<dyn DataSink>))
            .collect()
    }

    fn detach(&self) {
        self.events.detach();
        for (_, dc) in &self.channels {
            dc.on_message(Box::new(|_| Box::pin(async {})));
            dc.on_close(Box::new(|| Box::pin(async {})));
        }
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        if let Ok(mut guard) = self.pump.lock()
            && let Some(pump) = guard.take()
        {
            pump.abort();
        }
    }

    async fn close(&self) {
        let epoch = self.events.epoch();
        for (channel, dc) in &self.channels {
            if let Err(e) = dc.close().await {
                debug!(epoch, %channel, "Data channel close: {e}");
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(epoch, "Failed to close peer connection: {e}");
        }
        self.signaling.close().await;
        info!(epoch, "Peer session closed");
    }
}

#[async_trait]
impl DataSink for RTCDataChannel {
    async fn buffered_amount(&self) -> usize {
        RTCDataChannel::buffered_amount(self).await
    }

    async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        if self.ready_state() != RTCDataChannelState::Open {
            return Err(SendError::Transport(format!(
                "data channel {} is {}",
                self.label(),
                self.ready_state()
            )));
        }
        let result = match payload {
            Payload::Text(text) => self.send_text(text.clone()).await,
            Payload::Binary(data) => RTCDataChannel::send(self, data).await,
        };
        result
            .map(|_| ())
            .map_err(|e| SendError::Transport(e.to_string()))
    }
}
