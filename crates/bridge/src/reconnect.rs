//! The reconnection controller.
//!
//! A single task owns the session and every piece of mutable bridge state.
//! Callers talk to it through [`Bridge`], which turns each call into a
//! command with a oneshot reply; link callbacks reach it as epoch-tagged
//! [`LinkEvent`]s. Because one task applies every transition, no two
//! transitions can interleave, and the `Connected -> Reconnecting` step is
//! additionally a compare-and-swap on the shared [`StateCell`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tether_protocol::{BridgeConfig, Channel};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::error::{BridgeError, SendError};
use crate::flow::{Dispatch, FlowOverrun, Outbound};
use crate::health::{ChannelFailure, ChannelHealthMonitor};
use crate::link::{Connector, Epoch, EventSink, Link, LinkEvent, LinkEventKind, Payload};
use crate::session::{ChannelDiagnostics, ConnectionSession};
use crate::signaling::SignalingDisconnected;
use crate::sleep_until;
use crate::state::{BridgeState, StateCell};

const COMMAND_CAPACITY: usize = 64;

/// One scheduled reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub number: u32,
    pub scheduled_at: Instant,
    pub backoff: Duration,
}

/// Why an established session was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLoss {
    Channel(ChannelFailure),
    Signaling(SignalingDisconnected),
    ChannelClosed(Channel),
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    StateChanged(BridgeState),
    SessionEstablished { epoch: Epoch, session_id: Uuid },
    Message { channel: Channel, payload: Payload },
    SessionLost { epoch: Epoch, cause: SessionLoss },
    /// A reconnection attempt failed; the reason carries close codes and
    /// socket lifetimes for storm diagnosis
    AttemptFailed { attempt: u32, reason: String },
    ReconnectScheduled(ReconnectAttempt),
    ReconnectExhausted { attempts: u32 },
    FlowOverrun(FlowOverrun),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub state: BridgeState,
    pub epoch: Option<Epoch>,
    pub session_id: Option<Uuid>,
    pub attempts: u32,
    pub stale_events_ignored: u64,
    pub channels: Vec<ChannelDiagnostics>,
}

enum Command {
    Connect {
        server_id: String,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        channel: Channel,
        msg: Outbound,
        reply: oneshot::Sender<Result<Dispatch, SendError>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Diagnostics>,
    },
}

/// Handle to a running bridge. Cheap to clone; the controller task stops
/// (tearing down any session) when the last handle is dropped.
#[derive(Clone)]
pub struct Bridge {
    commands: mpsc::Sender<Command>,
    state: Arc<StateCell>,
    state_rx: watch::Receiver<BridgeState>,
}

impl Bridge {
    /// Spawn the controller task. Must be called inside a tokio runtime.
    pub fn start(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
    ) -> (Bridge, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(BridgeState::Idle);
        let state = Arc::new(StateCell::new(BridgeState::Idle));

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let controller = Controller {
            backoff: Backoff::from_config(&config.reconnect),
            health: ChannelHealthMonitor::new(config.health.clone()),
            config: Arc::new(config),
            connector,
            state: Arc::clone(&state),
            state_tx,
            events: event_tx,
            link_tx,
            attempt_tx,
            server_id: None,
            next_epoch: 1,
            session: None,
            pending: None,
            retry_at: None,
            next_tick: None,
            attempts: 0,
            stale_events: 0,
        };
        tokio::spawn(controller.run(cmd_rx, link_rx, attempt_rx));

        let bridge = Bridge {
            commands: cmd_tx,
            state,
            state_rx,
        };
        (bridge, event_rx)
    }

    /// Build a session to `server_id`. Returns once it is established, or
    /// with the error that stopped the first attempt.
    pub async fn connect(&self, server_id: &str) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            server_id: server_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    /// Tear everything down and go Idle. Idempotent.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn send(&self, channel: Channel, payload: impl Into<Payload>) -> Result<Dispatch, SendError> {
        self.send_outbound(channel, Outbound::normal(payload)).await
    }

    /// Like [`Self::send`], but evicted last when the queue overruns.
    pub async fn send_critical(
        &self,
        channel: Channel,
        payload: impl Into<Payload>,
    ) -> Result<Dispatch, SendError> {
        self.send_outbound(channel, Outbound::critical(payload)).await
    }

    async fn send_outbound(&self, channel: Channel, msg: Outbound) -> Result<Dispatch, SendError> {
        if self.state() != BridgeState::Connected {
            return Err(SendError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { channel, msg, reply })
            .await
            .map_err(|_| SendError::NotConnected)?;
        rx.await.map_err(|_| SendError::NotConnected)?
    }

    pub fn state(&self) -> BridgeState {
        self.state.load()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state_rx.clone()
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Diagnostics { reply }).await?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    async fn command(&self, cmd: Command) -> Result<(), BridgeError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| BridgeError::Shutdown)
    }
}

struct AttemptOutcome {
    epoch: Epoch,
    result: Result<Box<dyn Link>, BridgeError>,
}

/// An attempt in flight. Its events are held until it lands.
struct PendingAttempt {
    epoch: Epoch,
    sink: EventSink,
    task: JoinHandle<()>,
    waiter: Option<oneshot::Sender<Result<(), BridgeError>>>,
    held: Vec<LinkEvent>,
}

struct Controller {
    config: Arc<BridgeConfig>,
    connector: Arc<dyn Connector>,
    state: Arc<StateCell>,
    state_tx: watch::Sender<BridgeState>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    attempt_tx: mpsc::UnboundedSender<AttemptOutcome>,
    server_id: Option<String>,
    next_epoch: Epoch,
    session: Option<ConnectionSession>,
    pending: Option<PendingAttempt>,
    retry_at: Option<Instant>,
    next_tick: Option<Instant>,
    attempts: u32,
    backoff: Backoff,
    health: ChannelHealthMonitor,
    /// Events dropped because their epoch was not current
    stale_events: u64,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut attempt_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("All bridge handles dropped, shutting down");
                        self.reset().await;
                        self.set_state(BridgeState::Idle);
                        break;
                    }
                },
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
                Some(outcome) = attempt_rx.recv() => self.on_attempt_outcome(outcome).await,
                _ = sleep_until(self.retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.spawn_attempt(None);
                }
                _ = sleep_until(self.next_tick), if self.next_tick.is_some() => self.on_tick().await,
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { server_id, reply } => {
                self.reset().await;
                info!(server_id, "Connecting");
                self.server_id = Some(server_id);
                self.attempts = 0;
                self.set_state(BridgeState::Connecting);
                self.spawn_attempt(Some(reply));
            }
            Command::Disconnect { reply } => {
                if self.state.load() != BridgeState::Idle || self.session.is_some() {
                    info!("Disconnecting");
                }
                self.reset().await;
                self.server_id = None;
                self.set_state(BridgeState::Idle);
                let _ = reply.send(());
            }
            Command::Send { channel, msg, reply } => {
                let result = match (self.state.load(), self.session.as_mut()) {
                    (BridgeState::Connected, Some(session)) => session.send(channel, msg).await,
                    _ => Err(SendError::NotConnected),
                };
                if let Ok(Dispatch {
                    overrun: Some(overrun),
                    ..
                }) = &result
                {
                    self.emit(BridgeEvent::FlowOverrun(*overrun));
                }
                let _ = reply.send(result);
            }
            Command::Diagnostics { reply } => {
                let (epoch, session_id, channels) = match self.session.as_mut() {
                    Some(session) => (
                        Some(session.epoch()),
                        Some(session.id()),
                        session.diagnostics().await,
                    ),
                    None => (None, None, Vec::new()),
                };
                let _ = reply.send(Diagnostics {
                    state: self.state.load(),
                    epoch,
                    session_id,
                    attempts: self.attempts,
                    stale_events_ignored: self.stale_events,
                    channels,
                });
            }
        }
    }

    /// Cancel timers and any pending attempt, then tear down the session.
    async fn reset(&mut self) {
        self.retry_at = None;
        self.next_tick = None;
        self.health.disarm();
        if let Some(pending) = self.pending.take() {
            debug!(epoch = pending.epoch, "Cancelling pending attempt");
            pending.sink.detach();
            pending.task.abort();
            if let Some(waiter) = pending.waiter {
                let _ = waiter.send(Err(BridgeError::Cancelled));
            }
        }
        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
    }

    fn spawn_attempt(&mut self, waiter: Option<oneshot::Sender<Result<(), BridgeError>>>) {
        let Some(server_id) = self.server_id.clone() else {
            return;
        };
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let sink = EventSink::new(epoch, self.link_tx.clone());
        let connector = Arc::clone(&self.connector);
        let results = self.attempt_tx.clone();
        let timeout = self.config.reconnect.connect_timeout();
        let task_sink = sink.clone();
        info!(epoch, attempt = self.attempts, "Starting session attempt");

        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.establish(&server_id, task_sink)).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ConnectTimeout(timeout)),
            };
            if let Err(mpsc::error::SendError(AttemptOutcome {
                result: Ok(link), ..
            })) = results.send(AttemptOutcome { epoch, result })
            {
                link.detach();
                link.close().await;
            }
        });

        self.pending = Some(PendingAttempt {
            epoch,
            sink,
            task,
            waiter,
            held: Vec::new(),
        });
    }

    async fn on_attempt_outcome(&mut self, outcome: AttemptOutcome) {
        let current = self.pending.as_ref().map(|p| p.epoch);
        if current != Some(outcome.epoch) {
            debug!(epoch = outcome.epoch, "Discarding outcome of a superseded attempt");
            if let Ok(link) = outcome.result {
                link.detach();
                link.close().await;
            }
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        match outcome.result {
            Ok(link) => {
                let session = ConnectionSession::new(link, pending.sink, &self.config);
                let (epoch, session_id) = (session.epoch(), session.id());
                self.session = Some(session);
                if self.attempts > 0 {
                    info!(epoch, attempts = self.attempts, "Reconnected");
                }
                self.attempts = 0;
                self.health.arm();
                self.next_tick = Some(Instant::now() + self.health.tick_interval());
                self.set_state(BridgeState::Connected);
                self.emit(BridgeEvent::SessionEstablished { epoch, session_id });
                if let Some(waiter) = pending.waiter {
                    let _ = waiter.send(Ok(()));
                }
                for event in pending.held {
                    self.on_link_event(event).await;
                }
            }
            Err(e) => match pending.waiter {
                Some(waiter) => {
                    warn!(epoch = outcome.epoch, "Connect failed: {e}");
                    self.server_id = None;
                    self.set_state(BridgeState::Idle);
                    let _ = waiter.send(Err(e));
                }
                None => {
                    warn!(epoch = outcome.epoch, attempt = self.attempts, "Reconnection attempt failed: {e}");
                    self.emit(BridgeEvent::AttemptFailed {
                        attempt: self.attempts,
                        reason: e.to_string(),
                    });
                    self.schedule_retry();
                }
            },
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        if let Some(pending) = self.pending.as_mut()
            && pending.epoch == event.epoch
        {
            pending.held.push(event);
            return;
        }
        let Some(session) = self.session.as_mut().filter(|s| s.epoch() == event.epoch) else {
            self.stale_events += 1;
            debug!(epoch = event.epoch, ignored = self.stale_events, "Ignoring event from a stale session");
            return;
        };

        match event.kind {
            LinkEventKind::Message { channel, payload } => {
                if let Some((channel, payload)) = session.record_inbound(channel, payload) {
                    self.emit(BridgeEvent::Message { channel, payload });
                }
            }
            LinkEventKind::BufferedAmountLow { channel } => {
                if let Err(e) = session.drain(channel).await {
                    warn!(%channel, "Drain failed: {e}");
                }
            }
            LinkEventKind::ChannelClosed { channel } => {
                self.begin_reconnect(SessionLoss::ChannelClosed(channel)).await;
            }
            LinkEventKind::SignalingDisconnected(d) => {
                self.begin_reconnect(SessionLoss::Signaling(d)).await;
            }
            LinkEventKind::TransportFailed { reason } => {
                self.begin_reconnect(SessionLoss::Transport(reason)).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            self.next_tick = None;
            return;
        };
        let verdict = self.health.evaluate(&session.counters(Instant::now()));
        if let Some(failure) = verdict.failure {
            self.begin_reconnect(SessionLoss::Channel(failure)).await;
            return;
        }

        let mut overruns = Vec::new();
        for channel in verdict.keepalive {
            let ping = Outbound::normal(self.health.keepalive_message());
            match session.send(channel, ping).await {
                Ok(dispatch) => overruns.extend(dispatch.overrun),
                Err(e) => debug!(%channel, "Keepalive not sent: {e}"),
            }
        }
        session.drain_ready().await;
        for overrun in overruns {
            self.emit(BridgeEvent::FlowOverrun(overrun));
        }
        self.next_tick = Some(Instant::now() + self.health.tick_interval());
    }

    /// Leave Connected for Reconnecting. Only the first caller per session
    /// gets past the compare-and-swap.
    async fn begin_reconnect(&mut self, cause: SessionLoss) {
        if !self
            .state
            .transition(BridgeState::Connected, BridgeState::Reconnecting)
        {
            debug!(?cause, "Reconnection already in progress, ignoring trigger");
            return;
        }
        self.publish(BridgeState::Reconnecting);

        self.next_tick = None;
        self.health.disarm();
        let Some(session) = self.session.take() else {
            self.schedule_retry();
            return;
        };
        let epoch = session.epoch();
        warn!(epoch, ?cause, "Session lost, reconnecting");
        self.emit(BridgeEvent::SessionLost { epoch, cause });
        session.teardown().await;
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.attempts >= self.config.reconnect.max_attempts {
            warn!(attempts = self.attempts, "Reconnection attempts exhausted");
            self.retry_at = None;
            self.set_state(BridgeState::Failed);
            self.emit(BridgeEvent::ReconnectExhausted {
                attempts: self.attempts,
            });
            return;
        }
        self.attempts += 1;
        let backoff = self.backoff.next_delay(self.attempts);
        let scheduled_at = Instant::now() + backoff;
        self.retry_at = Some(scheduled_at);
        info!(
            attempt = self.attempts,
            delay_ms = backoff.as_millis() as u64,
            "Reconnection scheduled"
        );
        self.emit(BridgeEvent::ReconnectScheduled(ReconnectAttempt {
            number: self.attempts,
            scheduled_at,
            backoff,
        }));
    }

    fn set_state(&mut self, state: BridgeState) {
        if self.state.load() == state {
            return;
        }
        self.state.store(state);
        self.publish(state);
    }

    fn publish(&self, state: BridgeState) {
        info!(%state, "Bridge state changed");
        self.state_tx.send_replace(state);
        self.emit(BridgeEvent::StateChanged(state));
    }

    fn emit(&self, event: BridgeEvent) {
        // Inbound payloads are never shed; a dropped receiver just means nobody listens
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}
