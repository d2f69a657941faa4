mod common;

use std::time::Duration;

use common::{ack, send_signal as send, serve};
use futures_util::StreamExt;
use tether_bridge::SignalingError;
use tether_bridge::signaling::{SignalingClient, SignalingEvent};
use tether_protocol::{SignalingConfig, SignalingMessage};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[tokio::test]
async fn ack_returns_grant_and_relays_messages() {
    let config = serve(|mut ws, request| async move {
        let parsed: SignalingMessage = serde_json::from_str(&request).unwrap();
        assert_eq!(
            parsed,
            SignalingMessage::ConnectRequest {
                server_id: "server-A".to_string()
            }
        );
        send(
            &mut ws,
            &SignalingMessage::Connected {
                session_id: Some("s-1".to_string()),
                ice_servers: Vec::new(),
            },
        )
        .await;

        // Echo the offer back as an answer
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            if let Ok(SignalingMessage::Offer { sdp }) = serde_json::from_str(&text) {
                send(&mut ws, &SignalingMessage::Answer { sdp }).await;
            }
        }
    })
    .await;

    let (client, mut events, grant) = SignalingClient::connect(&config, "server-A").await.unwrap();
    assert_eq!(grant.session_id.as_deref(), Some("s-1"));

    client.send_offer("v=0 offer".to_string()).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        SignalingEvent::Answer {
            sdp: "v=0 offer".to_string()
        }
    );
    client.close().await;
}

#[tokio::test]
async fn close_before_ack_reports_lifetime() {
    let config = serve(|mut ws, _request| async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "server restarting".into(),
            }))
            .await;
    })
    .await;

    let err = SignalingClient::connect(&config, "server-A")
        .await
        .err()
        .expect("connect should fail");
    match err {
        SignalingError::ClosedEarly {
            code,
            reason,
            after,
        } => {
            assert_eq!(code, Some(1001));
            assert_eq!(reason, "server restarting");
            assert!(after >= Duration::from_millis(120), "after {after:?}");
        }
        other => panic!("expected ClosedEarly, got {other:?}"),
    }
}

#[tokio::test]
async fn error_before_ack_is_rejection() {
    let config = serve(|mut ws, _request| async move {
        send(
            &mut ws,
            &SignalingMessage::Error {
                message: "unknown server id".to_string(),
            },
        )
        .await;
        let _ = ws.next().await;
    })
    .await;

    let err = SignalingClient::connect(&config, "server-Z")
        .await
        .err()
        .expect("connect should fail");
    assert!(
        matches!(&err, SignalingError::Rejected(msg) if msg == "unknown server id"),
        "{err:?}"
    );
}

#[tokio::test]
async fn refused_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = SignalingConfig {
        url: format!("ws://{addr}/ws"),
        ..SignalingConfig::default()
    };
    let err = SignalingClient::connect(&config, "server-A")
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, SignalingError::Unreachable { .. }), "{err:?}");
}

#[tokio::test]
async fn server_close_after_ack_emits_one_disconnect() {
    let config = serve(|mut ws, _request| async move {
        send(&mut ws, &ack()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await;
    })
    .await;

    let (client, mut events, _grant) = SignalingClient::connect(&config, "server-A").await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        SignalingEvent::Disconnected(d) => {
            assert_eq!(d.code, Some(1000));
            assert_eq!(d.reason, "bye");
            assert!(d.lifetime >= Duration::from_millis(50));
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    // The stream ends after exactly one disconnect
    let rest = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert!(rest.is_none());

    client.close().await;
    client.close().await;
}

#[tokio::test]
async fn early_relay_before_ack_is_replayed() {
    let config = serve(|mut ws, _request| async move {
        send(&mut ws, &SignalingMessage::PeerDisconnected).await;
        send(&mut ws, &ack()).await;
        let _ = ws.next().await;
    })
    .await;

    let (client, mut events, _grant) = SignalingClient::connect(&config, "server-A").await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, SignalingEvent::PeerDisconnected);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn missing_ack_times_out() {
    let config = serve(|mut ws, _request| async move {
        // Never acknowledge; just hold the socket open
        let _ = ws.next().await;
    })
    .await;

    let started = tokio::time::Instant::now();
    let err = SignalingClient::connect(&config, "server-A")
        .await
        .err()
        .expect("connect should fail");
    assert!(
        matches!(err, SignalingError::AckTimeout(d) if d == Duration::from_secs(3)),
        "{err:?}"
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
}
