#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tether_bridge::{
    BridgeError, BridgeEvent, Connector, DataSink, EventSink, Link, LinkEventKind, Payload,
    SendError, SignalingError,
};
use tether_protocol::{BridgeConfig, Channel, SignalingConfig, SignalingMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

/// Data sink that records what it was asked to send.
#[derive(Default)]
pub struct FakeSink {
    pub sent: Mutex<Vec<Payload>>,
    pub buffered: AtomicUsize,
}

impl FakeSink {
    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSink for FakeSink {
    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Test-side view of one established fake session.
#[derive(Clone)]
pub struct LinkHandle {
    pub events: EventSink,
    pub sinks: Vec<(Channel, Arc<FakeSink>)>,
    pub closes: Arc<AtomicUsize>,
    pub detaches: Arc<AtomicUsize>,
}

impl LinkHandle {
    pub fn epoch(&self) -> u64 {
        self.events.epoch()
    }

    pub fn sink(&self, channel: Channel) -> Arc<FakeSink> {
        self.sinks
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, s)| Arc::clone(s))
            .expect("no such channel")
    }

    /// Simulate the remote side sending us a message.
    pub fn inbound(&self, channel: Channel, payload: impl Into<Payload>) -> bool {
        self.events.emit(LinkEventKind::Message {
            channel,
            payload: payload.into(),
        })
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.events.emit(LinkEventKind::TransportFailed {
            reason: reason.to_string(),
        })
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct FakeLink {
    handle: LinkHandle,
}

#[async_trait]
impl Link for FakeLink {
    fn channels(&self) -> Vec<(Channel, Arc<dyn DataSink>)> {
        self.handle
            .sinks
            .iter()
            .map(|(c, s)| (*c, Arc::clone(s) as Arc<dyn DataSink>))
            .collect()
    }

    fn detach(&self) {
        self.handle.detaches.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.handle.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Succeed,
    /// Signaling socket closes this long after opening
    ClosedEarly(Duration),
    Hang,
}

/// Connector driven by a script of outcomes; the last step repeats.
pub struct FakeConnector {
    channels: Vec<Channel>,
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    establishes: AtomicUsize,
    links: Mutex<Vec<LinkHandle>>,
}

impl FakeConnector {
    pub fn new(config: &BridgeConfig, script: Vec<Step>) -> Arc<Self> {
        let fallback = script.last().copied().unwrap_or(Step::Succeed);
        Arc::new(Self {
            channels: config.channels.physical_channels().to_vec(),
            script: Mutex::new(script.into()),
            fallback: Mutex::new(fallback),
            establishes: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn establishes(&self) -> usize {
        self.establishes.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<LinkHandle> {
        self.links.lock().unwrap().clone()
    }

    pub fn link(&self, index: usize) -> LinkHandle {
        self.links.lock().unwrap()[index].clone()
    }

    /// Replace the remaining script.
    pub fn set_script(&self, script: Vec<Step>) {
        if let Some(last) = script.last() {
            *self.fallback.lock().unwrap() = *last;
        }
        *self.script.lock().unwrap() = script.into();
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn establish(
        &self,
        _server_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn Link>, BridgeError> {
        self.establishes.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().unwrap();
            script
                .pop_front()
                .unwrap_or_else(|| *self.fallback.lock().unwrap())
        };
        match step {
            Step::Succeed => {
                let handle = LinkHandle {
                    events,
                    sinks: self
                        .channels
                        .iter()
                        .map(|c| (*c, Arc::new(FakeSink::default())))
                        .collect(),
                    closes: Arc::new(AtomicUsize::new(0)),
                    detaches: Arc::new(AtomicUsize::new(0)),
                };
                self.links.lock().unwrap().push(handle.clone());
                Ok(Box::new(FakeLink { handle }))
            }
            Step::ClosedEarly(after) => {
                tokio::time::sleep(after).await;
                Err(BridgeError::Signaling(SignalingError::ClosedEarly {
                    code: Some(1006),
                    reason: "abnormal closure".to_string(),
                    after,
                }))
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Wait for the first event matching `pred`, collecting everything seen.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<BridgeEvent>,
    within: Duration,
    seen: &mut Vec<BridgeEvent>,
    pred: impl Fn(&BridgeEvent) -> bool,
) -> BridgeEvent {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .unwrap_or_else(|_| panic!("no matching event within {within:?}, saw {seen:#?}"))
            .expect("bridge shut down");
        seen.push(event.clone());
        if pred(&event) {
            return event;
        }
    }
}

/// Everything already queued, without waiting.
pub fn drain(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.signaling.url = "ws://127.0.0.1:9/ws".to_string();
    config
}

pub type ServerSocket = WebSocketStream<TcpStream>;

/// One-shot rendezvous service on a loopback port. `script` runs after the
/// connect-request has been read.
pub async fn serve<F, Fut>(script: F) -> SignalingConfig
where
    F: FnOnce(ServerSocket, String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let request = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            other => panic!("expected connect-request, got {other:?}"),
        };
        script(ws, request).await;
    });

    SignalingConfig {
        url: format!("ws://{addr}/ws"),
        ..SignalingConfig::default()
    }
}

pub async fn send_signal(ws: &mut ServerSocket, msg: &SignalingMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next signaling message from the client; None once the socket is gone.
pub async fn next_signal(ws: &mut ServerSocket) -> Option<SignalingMessage> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                Ok(msg) => return Some(msg),
                Err(e) => panic!("client sent invalid signaling JSON: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

pub fn ack() -> SignalingMessage {
    SignalingMessage::Connected {
        session_id: None,
        ice_servers: Vec::new(),
    }
}
