//! Signaling client
//!
//! Connects a participant to the relay, performs the authenticated join,
//! and dispatches inbound frames to registered handlers. A background task
//! heartbeats the socket so the server's idle reaper leaves it alone.

use crate::config::SignalingConfig;
use crate::message::{SignalingMessage, SERVER_SENDER};
use conclave_core::types::{now_millis, SessionId, UserId};
use conclave_core::{ConclaveError, ConclaveResult};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Handler callbacks for inbound frames
#[derive(Default)]
struct SignalingHandlers {
    offer: Option<Box<dyn Fn(UserId, String) + Send + Sync>>,
    answer: Option<Box<dyn Fn(UserId, String) + Send + Sync>>,
    ice_candidate: Option<Box<dyn Fn(UserId, String) + Send + Sync>>,
    peer_joined: Option<Box<dyn Fn(UserId) + Send + Sync>>,
    peer_left: Option<Box<dyn Fn(UserId) + Send + Sync>>,
}

/// Live connection state
struct SignalingConnection {
    tx: mpsc::Sender<SignalingMessage>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

/// Client side of the signaling relay.
#[derive(Clone)]
pub struct SignalingClient {
    config: SignalingConfig,
    participant_id: UserId,
    session_id: SessionId,
    auth_token: String,
    handlers: Arc<RwLock<SignalingHandlers>>,
    connection: Arc<Mutex<Option<SignalingConnection>>>,
}

impl SignalingClient {
    /// Create a client for one participant in one session
    pub fn new(
        config: SignalingConfig,
        participant_id: impl Into<UserId>,
        session_id: impl Into<SessionId>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            config,
            participant_id: participant_id.into(),
            session_id: session_id.into(),
            auth_token: auth_token.into(),
            handlers: Arc::new(RwLock::new(SignalingHandlers::default())),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect, authenticate, and join the session room.
    ///
    /// Fails `Timeout` when the relay does not answer within the configured
    /// connect deadline, `Unavailable` when it cannot be reached at all,
    /// and `PermissionDenied` carrying the server's reason verbatim when
    /// the join is rejected.
    pub async fn connect(&self) -> ConclaveResult<()> {
        let url = format!(
            "{}/?participantId={}&sessionId={}",
            self.config.server_url.trim_end_matches('/'),
            self.participant_id,
            self.session_id,
        );

        let connected = tokio::time::timeout(self.config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                ConclaveError::timeout(format!(
                    "signaling connect to {} exceeded {:?}",
                    self.config.server_url, self.config.connect_timeout
                ))
            })?;
        let (ws, _) = connected.map_err(|e| {
            ConclaveError::unavailable(format!(
                "signaling server {} unreachable: {e}",
                self.config.server_url
            ))
        })?;

        let (mut ws_sink, mut ws_stream) = ws.split();

        let join = SignalingMessage::join_request(self.session_id.clone(), self.auth_token.clone());
        let json = serde_json::to_string(&join)?;
        ws_sink
            .send(Message::Text(json))
            .await
            .map_err(|e| ConclaveError::unavailable(format!("join send failed: {e}")))?;

        // The first meaningful frame is our own ack or a rejection.
        let ack_deadline = self.config.connect_timeout;
        tokio::time::timeout(ack_deadline, async {
            while let Some(message) = ws_stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        return Err(ConclaveError::permission_denied(
                            frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "join rejected".to_string()),
                        ));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(ConclaveError::unavailable(format!("socket error: {e}")))
                    }
                };
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(SignalingMessage::Heartbeat { .. }) => continue,
                    Ok(SignalingMessage::Join { from, payload, .. })
                        if from.as_deref() == Some(SERVER_SENDER)
                            && payload
                                .as_ref()
                                .and_then(|p| p.get("success"))
                                .and_then(|s| s.as_bool())
                                .unwrap_or(false) =>
                    {
                        return Ok(());
                    }
                    Ok(SignalingMessage::Error { error, .. }) => {
                        return Err(ConclaveError::permission_denied(error));
                    }
                    Ok(other) => {
                        debug!("frame before join ack: {other:?}");
                        continue;
                    }
                    Err(e) => {
                        return Err(ConclaveError::internal(format!("malformed frame: {e}")))
                    }
                }
            }
            Err(ConclaveError::unavailable("socket closed before join ack"))
        })
        .await
        .map_err(|_| ConclaveError::timeout("join ack not received in time"))??;

        let (tx, mut rx) = mpsc::channel::<SignalingMessage>(32);

        // Writer task owns the sink
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to serialize signaling frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(Message::Text(json)).await {
                    error!("failed to send signaling frame: {e}");
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        // Reader task dispatches to handlers
        let handlers = self.handlers.clone();
        let own_id = self.participant_id.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = ws_stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalingMessage>(&text)
                    {
                        Ok(frame) => dispatch_frame(&handlers, &own_id, frame).await,
                        Err(e) => warn!("failed to parse signaling frame: {e}"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("signaling server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("signaling socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Periodic heartbeat keeps the socket out of the idle reaper
        let heartbeat_tx = tx.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if heartbeat_tx
                    .send(SignalingMessage::heartbeat())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.connection.lock().await = Some(SignalingConnection {
            tx,
            reader_task,
            writer_task,
            heartbeat_task,
        });

        info!(
            participant_id = %self.participant_id,
            session_id = %self.session_id,
            "joined signaling room"
        );
        Ok(())
    }

    /// Connect with jittered exponential backoff between attempts.
    ///
    /// Only `Unavailable`/`Timeout` failures are retried; rejections are
    /// final.
    pub async fn connect_with_backoff(&self, max_attempts: u32) -> ConclaveResult<()> {
        let mut delay = Duration::from_millis(250);
        let mut last_err = ConclaveError::unavailable("no connection attempts made");

        for attempt in 1..=max_attempts.max(1) {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        conclave_core::ErrorKind::Unavailable | conclave_core::ErrorKind::Timeout
                    ) =>
                {
                    debug!(attempt, "signaling connect failed, backing off: {e}");
                    last_err = e;
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tokio::time::sleep(delay + jitter).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Send a connection offer to a peer
    pub async fn send_offer(&self, to: impl Into<UserId>, sdp: impl Into<String>) -> ConclaveResult<()> {
        self.send(SignalingMessage::SdpOffer {
            from: None,
            to: to.into(),
            session_id: Some(self.session_id.clone()),
            payload: serde_json::json!({ "sdp": sdp.into() }),
            timestamp: now_millis(),
        })
        .await
    }

    /// Send a connection answer to a peer
    pub async fn send_answer(&self, to: impl Into<UserId>, sdp: impl Into<String>) -> ConclaveResult<()> {
        self.send(SignalingMessage::SdpAnswer {
            from: None,
            to: to.into(),
            session_id: Some(self.session_id.clone()),
            payload: serde_json::json!({ "sdp": sdp.into() }),
            timestamp: now_millis(),
        })
        .await
    }

    /// Send an ICE candidate to a peer
    pub async fn send_ice_candidate(
        &self,
        to: impl Into<UserId>,
        candidate: impl Into<String>,
    ) -> ConclaveResult<()> {
        self.send(SignalingMessage::IceCandidate {
            from: None,
            to: to.into(),
            session_id: Some(self.session_id.clone()),
            payload: serde_json::json!({ "candidate": candidate.into() }),
            timestamp: now_millis(),
        })
        .await
    }

    /// Send a heartbeat now, in addition to the periodic one
    pub async fn send_heartbeat(&self) -> ConclaveResult<()> {
        self.send(SignalingMessage::heartbeat()).await
    }

    /// Sets the offer handler
    pub async fn on_offer<F>(&self, handler: F)
    where
        F: Fn(UserId, String) + Send + Sync + 'static,
    {
        self.handlers.write().await.offer = Some(Box::new(handler));
    }

    /// Sets the answer handler
    pub async fn on_answer<F>(&self, handler: F)
    where
        F: Fn(UserId, String) + Send + Sync + 'static,
    {
        self.handlers.write().await.answer = Some(Box::new(handler));
    }

    /// Sets the ICE candidate handler
    pub async fn on_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(UserId, String) + Send + Sync + 'static,
    {
        self.handlers.write().await.ice_candidate = Some(Box::new(handler));
    }

    /// Sets the handler invoked when another participant joins the room
    pub async fn on_peer_joined<F>(&self, handler: F)
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.handlers.write().await.peer_joined = Some(Box::new(handler));
    }

    /// Sets the handler invoked when a participant leaves the room
    pub async fn on_peer_left<F>(&self, handler: F)
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.handlers.write().await.peer_left = Some(Box::new(handler));
    }

    /// Whether a live connection is held
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Announce departure and tear the connection down
    pub async fn leave(&self) -> ConclaveResult<()> {
        let _ = self
            .send(SignalingMessage::Leave {
                from: None,
                session_id: Some(self.session_id.clone()),
                payload: None,
                timestamp: now_millis(),
            })
            .await;
        self.disconnect().await
    }

    /// Tear the connection down without announcing
    pub async fn disconnect(&self) -> ConclaveResult<()> {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.heartbeat_task.abort();
            conn.reader_task.abort();
            drop(conn.tx);
            // Writer drains and closes once every sender is gone
            let _ = conn.writer_task.await;
        }
        Ok(())
    }

    async fn send(&self, frame: SignalingMessage) -> ConclaveResult<()> {
        let conn = self.connection.lock().await;
        let conn = conn
            .as_ref()
            .ok_or_else(|| ConclaveError::unavailable("not connected to signaling server"))?;
        conn.tx
            .send(frame)
            .await
            .map_err(|_| ConclaveError::unavailable("signaling connection closed"))
    }
}

/// Dispatch one inbound frame to the registered handlers. Total match.
async fn dispatch_frame(
    handlers: &Arc<RwLock<SignalingHandlers>>,
    own_id: &str,
    frame: SignalingMessage,
) {
    let handlers = handlers.read().await;
    match frame {
        SignalingMessage::SdpOffer { from, payload, .. } => {
            if let (Some(from), Some(handler)) = (from, &handlers.offer) {
                if let Some(sdp) = payload.get("sdp").and_then(|s| s.as_str()) {
                    handler(from, sdp.to_string());
                }
            }
        }
        SignalingMessage::SdpAnswer { from, payload, .. } => {
            if let (Some(from), Some(handler)) = (from, &handlers.answer) {
                if let Some(sdp) = payload.get("sdp").and_then(|s| s.as_str()) {
                    handler(from, sdp.to_string());
                }
            }
        }
        SignalingMessage::IceCandidate { from, payload, .. } => {
            if let (Some(from), Some(handler)) = (from, &handlers.ice_candidate) {
                if let Some(candidate) = payload.get("candidate").and_then(|c| c.as_str()) {
                    handler(from, candidate.to_string());
                }
            }
        }
        SignalingMessage::Join { payload, .. } => {
            let joined = payload
                .as_ref()
                .and_then(|p| p.get("participantId"))
                .and_then(|p| p.as_str());
            if let (Some(peer), Some(handler)) = (joined, &handlers.peer_joined) {
                if peer != own_id {
                    handler(peer.to_string());
                }
            }
        }
        SignalingMessage::Leave { payload, .. } => {
            let left = payload
                .as_ref()
                .and_then(|p| p.get("participantId"))
                .and_then(|p| p.as_str());
            if let (Some(peer), Some(handler)) = (left, &handlers.peer_left) {
                if peer != own_id {
                    handler(peer.to_string());
                }
            }
        }
        SignalingMessage::Heartbeat { .. } => {}
        SignalingMessage::Error { error, .. } => {
            warn!("signaling server error: {error}");
        }
    }
}
