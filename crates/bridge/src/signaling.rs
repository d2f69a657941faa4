//! Websocket client for the rendezvous service.
//!
//! One [`SignalingClient`] per socket. It never retries: a failed or closed
//! socket is reported once and the owner decides what happens next.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_protocol::{IceCandidate, IceServerInfo, SignalingConfig, SignalingMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message, protocol::WebSocketConfig};
use tracing::{debug, info, warn};

use crate::error::SignalingError;

/// How long `close()` waits for the socket task to say goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Emitted exactly once per socket when it goes away, for whatever reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingDisconnected {
    pub code: Option<u16>,
    pub reason: String,
    /// Time between the socket opening and closing
    pub lifetime: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    Error { message: String },
    PeerDisconnected,
    Disconnected(SignalingDisconnected),
}

/// What the rendezvous service handed back with its acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_id: Option<String>,
    pub ice_servers: Vec<IceServerInfo>,
}

enum Outgoing {
    Message(SignalingMessage),
    Close,
}

pub struct SignalingClient {
    out_tx: mpsc::UnboundedSender<Outgoing>,
    task: Mutex<Option<JoinHandle<()>>>,
    opened_at: Instant,
}

impl SignalingClient {
    /// Open the socket, send the connect-request and wait for the
    /// acknowledgment. Returns the client, its event stream and the grant.
    pub async fn connect(
        config: &SignalingConfig,
        server_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>, SessionGrant), SignalingError>
    {
        let url = signaling_url(&config.url, config.token.as_deref())?;
        let connector = if url.starts_with("wss://") {
            Some(build_tls_connector(config.tls_ca.as_deref())?)
        } else {
            None
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);

        info!(url = %config.url, server_id, "Connecting to signaling service");
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_tls_with_config(&url, Some(ws_config), false, connector)
                .await
                .map_err(|e| match e {
                    tungstenite::Error::Url(reason) => SignalingError::InvalidUrl {
                        url: config.url.clone(),
                        reason: reason.to_string(),
                    },
                    tungstenite::Error::Http(response)
                        if matches!(response.status().as_u16(), 401 | 403 | 404) =>
                    {
                        SignalingError::Rejected(format!("HTTP {}", response.status()))
                    }
                    other => SignalingError::Unreachable {
                        url: config.url.clone(),
                        source: Box::new(other),
                    },
                })?;
        let opened_at = Instant::now();
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let request = SignalingMessage::ConnectRequest {
            server_id: server_id.to_string(),
        };
        let text = serde_json::to_string(&request)
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;
        ws_tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SignalingError::ClosedEarly {
                code: None,
                reason: e.to_string(),
                after: opened_at.elapsed(),
            })?;

        // Anything the service relays before the ack is replayed afterwards
        let mut early = Vec::new();
        let ack_timeout = config.ack_timeout();
        let deadline = opened_at + ack_timeout;
        let grant = loop {
            let next = match tokio::time::timeout_at(deadline, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => return Err(SignalingError::AckTimeout(ack_timeout)),
            };
            match next {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(SignalingMessage::Connected {
                        session_id,
                        ice_servers,
                    }) => {
                        break SessionGrant {
                            session_id,
                            ice_servers,
                        };
                    }
                    Ok(SignalingMessage::Error { message }) => {
                        return Err(SignalingError::Rejected(message));
                    }
                    Ok(other) => match into_event(other) {
                        Some(event) => early.push(event),
                        None => debug!("Ignoring unexpected message before ack"),
                    },
                    Err(e) => warn!("Invalid message from signaling service: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = close_details(frame.as_ref());
                    return Err(SignalingError::ClosedEarly {
                        code,
                        reason,
                        after: opened_at.elapsed(),
                    });
                }
                Some(Err(e)) => {
                    return Err(SignalingError::ClosedEarly {
                        code: None,
                        reason: e.to_string(),
                        after: opened_at.elapsed(),
                    });
                }
                None => {
                    return Err(SignalingError::ClosedEarly {
                        code: None,
                        reason: "stream ended".to_string(),
                        after: opened_at.elapsed(),
                    });
                }
                Some(Ok(_)) => {}
            }
        };
        info!(session_id = ?grant.session_id, "Signaling acknowledged");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        for event in early {
            let _ = event_tx.send(event);
        }
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

        let task = tokio::spawn(async move {
            let (code, reason) = loop {
                tokio::select! {
                    msg = ws_rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalingMessage>(&text) {
                                Ok(msg) => match into_event(msg) {
                                    Some(event) => {
                                        let _ = event_tx.send(event);
                                    }
                                    None => debug!("Unhandled signaling message"),
                                },
                                Err(e) => warn!("Invalid message from signaling service: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => break close_details(frame.as_ref()),
                        Some(Err(e)) => break (None, e.to_string()),
                        None => break (None, "stream ended".to_string()),
                        Some(Ok(_)) => {}
                    },
                    out = out_rx.recv() => match out {
                        Some(Outgoing::Message(msg)) => {
                            let text = match serde_json::to_string(&msg) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("Failed to encode signaling message: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                                break (None, e.to_string());
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            let _ = ws_tx.close().await;
                            break (None, "closed locally".to_string());
                        }
                    },
                }
            };
            let lifetime = opened_at.elapsed();
            info!(?code, %reason, ?lifetime, "Signaling socket closed");
            let _ = event_tx.send(SignalingEvent::Disconnected(SignalingDisconnected {
                code,
                reason,
                lifetime,
            }));
        });

        let client = SignalingClient {
            out_tx,
            task: Mutex::new(Some(task)),
            opened_at,
        };
        Ok((client, event_rx, grant))
    }

    pub fn send_offer(&self, sdp: String) -> Result<(), SignalingError> {
        self.send(SignalingMessage::Offer { sdp })
    }

    pub fn send_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.send(SignalingMessage::IceCandidate { candidate })
    }

    fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.out_tx
            .send(Outgoing::Message(msg))
            .map_err(|_| SignalingError::Closed)
    }

    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Close the socket. Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.out_tx.send(Outgoing::Close);
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut task) = task
            && tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err()
        {
            task.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }
}

fn into_event(msg: SignalingMessage) -> Option<SignalingEvent> {
    match msg {
        SignalingMessage::Answer { sdp } => Some(SignalingEvent::Answer { sdp }),
        SignalingMessage::IceCandidate { candidate } => Some(SignalingEvent::IceCandidate(candidate)),
        SignalingMessage::Error { message } => Some(SignalingEvent::Error { message }),
        SignalingMessage::PeerDisconnected => Some(SignalingEvent::PeerDisconnected),
        _ => None,
    }
}

fn close_details(
    frame: Option<&tungstenite::protocol::CloseFrame>,
) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
        None => (None, String::new()),
    }
}

/// Append the auth token as a query parameter.
fn signaling_url(base: &str, token: Option<&str>) -> Result<String, SignalingError> {
    if !(base.starts_with("ws://") || base.starts_with("wss://")) {
        return Err(SignalingError::InvalidUrl {
            url: base.to_string(),
            reason: "scheme must be ws:// or wss://".to_string(),
        });
    }
    Ok(match token {
        Some(token) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{base}{sep}token={}", urlencoding::encode(token))
        }
        None => base.to_string(),
    })
}

/// System roots plus an optional pinned CA.
fn build_tls_connector(
    tls_ca: Option<&str>,
) -> Result<tokio_tungstenite::Connector, SignalingError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        debug!("Skipping platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(path) = tls_ca {
        let pem_data = std::fs::read(path)
            .map_err(|e| SignalingError::Tls(format!("failed to read {path}: {e}")))?;
        let mut pinned = 0;
        for cert in rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()) {
            match root_store.add(cert) {
                Ok(()) => pinned += 1,
                Err(e) => warn!("Failed to add pinned cert to root store: {e}"),
            }
        }
        if pinned == 0 {
            return Err(SignalingError::Tls(format!("no usable certificates in {path}")));
        }
        info!("Pinned {pinned} CA certificate(s) from {path}");
    }

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| SignalingError::Tls(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_url_encoded() {
        let url = signaling_url("wss://relay.example.com/ws", Some("a b&c")).unwrap();
        assert_eq!(url, "wss://relay.example.com/ws?token=a%20b%26c");
    }

    #[test]
    fn token_appends_to_existing_query() {
        let url = signaling_url("ws://localhost:9000/ws?v=2", Some("t")).unwrap();
        assert_eq!(url, "ws://localhost:9000/ws?v=2&token=t");
    }

    #[test]
    fn non_websocket_scheme_rejected() {
        let err = signaling_url("https://relay.example.com", None).unwrap_err();
        assert!(matches!(err, SignalingError::InvalidUrl { .. }));
    }

    #[test]
    fn only_remote_messages_become_events() {
        assert_eq!(
            into_event(SignalingMessage::Answer { sdp: "x".into() }),
            Some(SignalingEvent::Answer { sdp: "x".into() })
        );
        assert_eq!(
            into_event(SignalingMessage::PeerDisconnected),
            Some(SignalingEvent::PeerDisconnected)
        );
        assert_eq!(
            into_event(SignalingMessage::ConnectRequest {
                server_id: "s".into()
            }),
            None
        );
    }

    #[test]
    fn missing_pinned_ca_is_an_error() {
        let err = build_tls_connector(Some("/nonexistent/ca.pem")).err().unwrap();
        assert!(matches!(err, SignalingError::Tls(_)));
    }
}
