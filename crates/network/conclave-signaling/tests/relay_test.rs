//! Integration tests for the signaling relay

use conclave_core::rbac::{AllowAllGuard, StaticRbacGuard};
use conclave_signaling::{
    BearerTokenValidator, SignalingClient, SignalingConfig, SignalingMessage,
    SignalingServer, SignalingServerConfig,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(max_participants: usize, heartbeat: Duration) -> (Arc<SignalingServer>, String) {
    let config = SignalingServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        max_participants_per_session: max_participants,
        heartbeat_interval: heartbeat,
        max_protocol_errors: 3,
    };
    let server = Arc::new(
        SignalingServer::bind(config, Arc::new(AllowAllGuard), Arc::new(BearerTokenValidator))
            .await
            .unwrap(),
    );
    let url = format!("ws://{}", server.local_addr());
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (server, url)
}

async fn raw_connect(url: &str, participant_id: &str, session_id: &str) -> Socket {
    let (ws, _) = connect_async(format!(
        "{url}/?participantId={participant_id}&sessionId={session_id}"
    ))
    .await
    .unwrap();
    ws
}

async fn send_frame(ws: &mut Socket, frame: &SignalingMessage) {
    ws.send(Message::Text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

/// Next non-heartbeat frame, or `None` when the socket closes
async fn next_frame(ws: &mut Socket) -> Option<SignalingMessage> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame: SignalingMessage = serde_json::from_str(&text).unwrap();
                if !matches!(frame, SignalingMessage::Heartbeat { .. }) {
                    return Some(frame);
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

async fn join(ws: &mut Socket, session_id: &str, token: &str) -> SignalingMessage {
    send_frame(ws, &SignalingMessage::join_request(session_id, token)).await;
    next_frame(ws).await.expect("join response")
}

fn assert_join_ack(frame: &SignalingMessage) {
    match frame {
        SignalingMessage::Join { from, payload, .. } => {
            assert_eq!(from.as_deref(), Some("server"));
            let payload = payload.as_ref().unwrap();
            assert_eq!(payload["success"], true);
        }
        other => panic!("expected join ack, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_token_is_rejected_without_a_room() {
    let (server, url) = start_server(8, Duration::from_secs(30)).await;
    let mut ws = raw_connect(&url, "u2", "s1").await;

    let response = join(&mut ws, "s1", "bogus").await;
    match response {
        SignalingMessage::Error { error, .. } => {
            assert_eq!(error, "Invalid authentication token");
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    // Socket closes and no room was created
    assert!(next_frame(&mut ws).await.is_none());
    assert_eq!(server.room_count(), 0);
}

#[tokio::test]
async fn join_acks_sender_and_notifies_room() {
    let (server, url) = start_server(8, Duration::from_secs(30)).await;

    let mut alice = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut alice, "s1", "user-u1").await);

    let mut bob = raw_connect(&url, "u2", "s1").await;
    assert_join_ack(&join(&mut bob, "s1", "user-u2").await);

    // Existing members learn about the newcomer
    match next_frame(&mut alice).await.unwrap() {
        SignalingMessage::Join { payload, .. } => {
            assert_eq!(payload.unwrap()["participantId"], "u2");
        }
        other => panic!("expected join broadcast, got {other:?}"),
    }

    let mut members = server.room_members("s1");
    members.sort();
    assert_eq!(members, vec!["u1".to_string(), "u2".to_string()]);
}

#[tokio::test]
async fn offers_are_forwarded_with_sender_rewritten() {
    let (_server, url) = start_server(8, Duration::from_secs(30)).await;

    let mut alice = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut alice, "s1", "user-u1").await);
    let mut bob = raw_connect(&url, "u2", "s1").await;
    assert_join_ack(&join(&mut bob, "s1", "user-u2").await);

    send_frame(
        &mut alice,
        &SignalingMessage::SdpOffer {
            // A spoofed sender must be rewritten by the relay
            from: Some("mallory".into()),
            to: "u2".into(),
            session_id: Some("s1".into()),
            payload: serde_json::json!({ "sdp": "v=0 offer-from-u1" }),
            timestamp: conclave_core::types::now_millis(),
        },
    )
    .await;

    match next_frame(&mut bob).await.unwrap() {
        SignalingMessage::SdpOffer { from, payload, .. } => {
            assert_eq!(from.as_deref(), Some("u1"));
            assert_eq!(payload["sdp"], "v=0 offer-from-u1");
        }
        other => panic!("expected forwarded offer, got {other:?}"),
    }
}

#[tokio::test]
async fn frames_never_route_to_self_or_across_sessions() {
    let (_server, url) = start_server(8, Duration::from_secs(30)).await;

    let mut alice = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut alice, "s1", "user-u1").await);
    let mut carol = raw_connect(&url, "u3", "s2").await;
    assert_join_ack(&join(&mut carol, "s2", "user-u3").await);

    // Self-routing is a protocol error
    send_frame(
        &mut alice,
        &SignalingMessage::SdpOffer {
            from: None,
            to: "u1".into(),
            session_id: Some("s1".into()),
            payload: serde_json::json!({ "sdp": "v=0" }),
            timestamp: conclave_core::types::now_millis(),
        },
    )
    .await;
    match next_frame(&mut alice).await.unwrap() {
        SignalingMessage::Error { error, .. } => assert!(error.contains("sender")),
        other => panic!("expected error, got {other:?}"),
    }

    // A member of another session is unreachable
    send_frame(
        &mut alice,
        &SignalingMessage::SdpOffer {
            from: None,
            to: "u3".into(),
            session_id: Some("s1".into()),
            payload: serde_json::json!({ "sdp": "v=0" }),
            timestamp: conclave_core::types::now_millis(),
        },
    )
    .await;
    match next_frame(&mut alice).await.unwrap() {
        SignalingMessage::Error { error, .. } => assert!(error.contains("not reachable")),
        other => panic!("expected error, got {other:?}"),
    }

    // And the frame never arrives there
    let leaked = tokio::time::timeout(Duration::from_millis(300), next_frame(&mut carol)).await;
    assert!(leaked.is_err(), "frame leaked across sessions: {leaked:?}");
}

#[tokio::test]
async fn room_capacity_is_enforced() {
    let (server, url) = start_server(2, Duration::from_secs(30)).await;

    let mut alice = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut alice, "s1", "user-u1").await);
    let mut bob = raw_connect(&url, "u2", "s1").await;
    assert_join_ack(&join(&mut bob, "s1", "user-u2").await);

    let mut carol = raw_connect(&url, "u3", "s1").await;
    match join(&mut carol, "s1", "user-u3").await {
        SignalingMessage::Error { error, .. } => assert!(error.contains("full")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(server.room_members("s1").len(), 2);
}

#[tokio::test]
async fn duplicate_participant_ids_are_rejected() {
    let (_server, url) = start_server(8, Duration::from_secs(30)).await;

    let mut first = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut first, "s1", "user-u1").await);

    let mut second = raw_connect(&url, "u1", "s1").await;
    match join(&mut second, "s1", "user-u1").await {
        SignalingMessage::Error { error, .. } => assert!(error.contains("already connected")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_heartbeats_are_echoed() {
    // Long server interval so the only heartbeat we see is the echo
    let (_server, url) = start_server(8, Duration::from_secs(600)).await;

    let mut ws = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut ws, "s1", "user-u1").await);

    send_frame(&mut ws, &SignalingMessage::heartbeat()).await;

    let echoed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(message) = ws.next().await {
            if let Ok(Message::Text(text)) = message {
                if let Ok(SignalingMessage::Heartbeat { .. }) = serde_json::from_str(&text) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(echoed);
}

#[tokio::test]
async fn leave_is_broadcast_and_empty_rooms_are_destroyed() {
    let (server, url) = start_server(8, Duration::from_secs(30)).await;

    let mut alice = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut alice, "s1", "user-u1").await);
    let mut bob = raw_connect(&url, "u2", "s1").await;
    assert_join_ack(&join(&mut bob, "s1", "user-u2").await);
    // Consume the join broadcast about bob
    next_frame(&mut alice).await.unwrap();

    send_frame(
        &mut bob,
        &SignalingMessage::Leave {
            from: None,
            session_id: Some("s1".into()),
            payload: None,
            timestamp: conclave_core::types::now_millis(),
        },
    )
    .await;

    match next_frame(&mut alice).await.unwrap() {
        SignalingMessage::Leave { payload, .. } => {
            assert_eq!(payload.unwrap()["participantId"], "u2");
        }
        other => panic!("expected leave broadcast, got {other:?}"),
    }
    assert_eq!(server.room_members("s1"), vec!["u1".to_string()]);

    // Last member out destroys the room
    drop(alice);
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.room_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn silent_sockets_are_reaped() {
    let (server, url) = start_server(8, Duration::from_millis(200)).await;

    let mut ws = raw_connect(&url, "u1", "s1").await;
    assert_join_ack(&join(&mut ws, "s1", "user-u1").await);
    assert_eq!(server.room_members("s1").len(), 1);

    // Send nothing; after two intervals the server reaps the socket
    tokio::time::timeout(Duration::from_secs(3), async {
        while !server.room_members("s1").is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn client_joins_and_routes_offers() {
    let (_server, url) = start_server(8, Duration::from_secs(30)).await;

    let config = SignalingConfig {
        server_url: url.clone(),
        heartbeat_interval: Duration::from_millis(100),
        ..SignalingConfig::default()
    };

    let alice = SignalingClient::new(config.clone(), "u1", "s1", "user-u1");
    let bob = SignalingClient::new(config, "u2", "s1", "user-u2");

    let (offer_tx, mut offer_rx) = tokio::sync::mpsc::unbounded_channel();
    bob.on_offer(move |from, sdp| {
        let _ = offer_tx.send((from, sdp));
    })
    .await;

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert!(alice.is_connected().await);

    alice.send_offer("u2", "v=0 from-alice").await.unwrap();

    let (from, sdp) = tokio::time::timeout(Duration::from_secs(2), offer_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, "u1");
    assert_eq!(sdp, "v=0 from-alice");

    alice.leave().await.unwrap();
    bob.disconnect().await.unwrap();
}

#[tokio::test]
async fn denied_join_reports_the_guard_reason() {
    let guard = Arc::new(StaticRbacGuard::new());
    // u1 may join but nobody may create the room
    let config = SignalingServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..SignalingServerConfig::default()
    };
    let server = Arc::new(
        SignalingServer::bind(config, guard, Arc::new(BearerTokenValidator))
            .await
            .unwrap(),
    );
    let url = format!("ws://{}", server.local_addr());
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let client = SignalingClient::new(
        SignalingConfig {
            server_url: url,
            ..SignalingConfig::default()
        },
        "u1",
        "s1",
        "user-u1",
    );

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), conclave_core::ErrorKind::PermissionDenied);
    assert!(err.to_string().contains("u1"));
}
