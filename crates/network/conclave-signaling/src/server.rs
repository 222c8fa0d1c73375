//! Session-scoped signaling relay
//!
//! One task per socket: the read loop drives a small per-socket state
//! machine while a writer task drains a bounded outbox, so a slow peer
//! never blocks the room. Membership lives in a concurrent room map; the
//! heartbeat task probes every member and signals silent sockets to close.

use crate::auth::TokenValidator;
use crate::config::SignalingServerConfig;
use crate::message::SignalingMessage;
use conclave_core::rbac::{RbacGuard, ResourceAction};
use conclave_core::types::{SessionId, UserId};
use conclave_core::{ConclaveError, ConclaveResult};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Outbox capacity per socket; overflow drops the peer
const OUTBOX_CAPACITY: usize = 64;

/// Frames queued to a socket's writer task
enum Outbound {
    Frame(SignalingMessage),
    Close(Option<CloseFrame<'static>>),
}

/// A connected room member
struct Member {
    user_id: UserId,
    outbox: mpsc::Sender<Outbound>,
    last_seen: Instant,
    close: watch::Sender<bool>,
}

/// A session room
#[derive(Default)]
struct Room {
    members: HashMap<UserId, Member>,
}

/// Per-socket protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    New,
    Authenticated,
    Joined,
    Active,
    Leaving,
    Closed,
}

/// Shared state handed to every socket task
#[derive(Clone)]
struct ServerContext {
    config: SignalingServerConfig,
    guard: Arc<dyn RbacGuard>,
    validator: Arc<dyn TokenValidator>,
    rooms: Arc<DashMap<SessionId, Room>>,
}

/// The signaling relay.
pub struct SignalingServer {
    context: ServerContext,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl SignalingServer {
    /// Bind the relay to its configured address.
    pub async fn bind(
        config: SignalingServerConfig,
        guard: Arc<dyn RbacGuard>,
        validator: Arc<dyn TokenValidator>,
    ) -> ConclaveResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ConclaveError::unavailable(format!("bind failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ConclaveError::internal(format!("local_addr: {e}")))?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            context: ServerContext {
                config,
                guard,
                validator,
                rooms: Arc::new(DashMap::new()),
            },
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown,
        })
    }

    /// Address the relay actually listens on (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live session rooms
    pub fn room_count(&self) -> usize {
        self.context.rooms.len()
    }

    /// Current members of a session room
    pub fn room_members(&self, session_id: &str) -> Vec<UserId> {
        self.context
            .rooms
            .get(session_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Request shutdown of the accept loop and heartbeat task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Serve until shutdown. Call once.
    pub async fn run(&self) -> ConclaveResult<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| ConclaveError::invalid_state("signaling server already running"))?;

        info!(addr = %self.local_addr, "signaling server listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.context.clone(),
            self.shutdown.subscribe(),
        ));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socket(stream, addr, context).await {
                            debug!(%addr, "socket closed with error: {e}");
                        }
                    });
                }
            }
        }

        heartbeat.abort();
        info!("signaling server stopped");
        Ok(())
    }
}

/// Emits a heartbeat to every member each interval and signals sockets that
/// have produced no traffic for two intervals to close.
async fn heartbeat_loop(context: ServerContext, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = context.config.heartbeat_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for mut entry in context.rooms.iter_mut() {
            for member in entry.value_mut().members.values() {
                if now.duration_since(member.last_seen) > interval * 2 {
                    debug!(user_id = %member.user_id, "reaping silent signaling socket");
                    let _ = member.close.send(true);
                } else {
                    let _ = member
                        .outbox
                        .try_send(Outbound::Frame(SignalingMessage::heartbeat()));
                }
            }
        }
    }
}

/// `participantId` and `sessionId` from the connection URL query string
fn parse_query(query: &str) -> (Option<String>, Option<String>) {
    let mut participant = None;
    let mut session = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("participantId", value)) if !value.is_empty() => {
                participant = Some(value.to_string());
            }
            Some(("sessionId", value)) if !value.is_empty() => {
                session = Some(value.to_string());
            }
            _ => {}
        }
    }
    (participant, session)
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    context: ServerContext,
) -> ConclaveResult<()> {
    let mut query: Option<String> = None;
    let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        query = request.uri().query().map(|q| q.to_string());
        Ok(response)
    })
    .await
    .map_err(|e| ConclaveError::unavailable(format!("websocket handshake failed: {e}")))?;

    let (mut ws_sink, mut ws_stream) = ws.split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Outbound>(OUTBOX_CAPACITY);

    // Writer task: the only owner of the sink. Ends on a Close frame or
    // when every outbox handle is gone.
    let writer = tokio::spawn(async move {
        while let Some(out) = outbox_rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to serialize signaling frame: {e}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(frame) => {
                    let _ = ws_sink.send(Message::Close(frame)).await;
                    break;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut state = SocketState::New;
    let (participant_id, session_id) = match query.as_deref().map(parse_query) {
        Some((Some(p), Some(s))) => (p, s),
        _ => {
            send_fatal(
                &outbox_tx,
                "connection URL must carry participantId and sessionId",
                CloseCode::Policy,
            )
            .await;
            let _ = writer.await;
            return Ok(());
        }
    };

    debug!(%addr, participant_id, session_id, "signaling socket open");

    // First frame must be Join; a socket gets one shot at it.
    let join_deadline = context.config.heartbeat_interval * 2;
    let first = tokio::time::timeout(join_deadline, ws_stream.next()).await;
    let first = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
            let _ = outbox_tx.send(Outbound::Close(None)).await;
            let _ = writer.await;
            return Ok(());
        }
        Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {
            send_fatal(&outbox_tx, "expected a Join frame", CloseCode::Protocol).await;
            let _ = writer.await;
            return Ok(());
        }
        Err(_) => {
            send_fatal(&outbox_tx, "join deadline expired", CloseCode::Protocol).await;
            let _ = writer.await;
            return Ok(());
        }
    };

    let (mut close_rx, joined) = match admit(
        &context,
        &outbox_tx,
        &participant_id,
        &session_id,
        &first,
        &mut state,
    )
    .await
    {
        Ok(close_rx) => (close_rx, true),
        Err(reason) => {
            debug!(participant_id, session_id, "join rejected: {reason}");
            (watch::channel(false).1, false)
        }
    };

    if !joined {
        drop(outbox_tx);
        let _ = writer.await;
        return Ok(());
    }

    state = SocketState::Active;
    let mut protocol_errors = 0u32;

    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                // Reaped by the heartbeat task (or the sender vanished)
                if changed.is_ok() && *close_rx.borrow() {
                    state = SocketState::Closed;
                }
                break;
            }
            inbound = ws_stream.next() => {
                let message = match inbound {
                    None => break,
                    Some(Err(e)) => {
                        debug!(participant_id, "websocket error: {e}");
                        break;
                    }
                    Some(Ok(message)) => message,
                };

                touch(&context, &session_id, &participant_id);

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    // Transport-level frames count as traffic only
                    _ => continue,
                };

                let frame = match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        protocol_errors += 1;
                        let _ = outbox_tx
                            .send(Outbound::Frame(SignalingMessage::server_error(format!(
                                "malformed frame: {e}"
                            ))))
                            .await;
                        if protocol_errors >= context.config.max_protocol_errors {
                            state = SocketState::Closed;
                            break;
                        }
                        continue;
                    }
                };

                match dispatch(&context, &outbox_tx, &participant_id, &session_id, frame).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::ProtocolError => {
                        protocol_errors += 1;
                        if protocol_errors >= context.config.max_protocol_errors {
                            state = SocketState::Closed;
                            break;
                        }
                    }
                    FrameOutcome::Leave => {
                        state = SocketState::Leaving;
                        break;
                    }
                }
            }
        }
    }

    // Departure: drop membership, tell the room, destroy it when empty.
    debug!(participant_id, session_id, ?state, "socket leaving");
    remove_member(&context, &session_id, &participant_id);
    broadcast_to_room(
        &context,
        &session_id,
        None,
        SignalingMessage::leave_broadcast(session_id.clone(), &participant_id),
    );

    let _ = outbox_tx.send(Outbound::Close(None)).await;
    drop(outbox_tx);
    let _ = writer.await;
    debug!(participant_id, session_id, "signaling socket closed");
    Ok(())
}

/// Authenticate, authorize, and admit the socket into its room.
///
/// Returns the close-signal receiver stored with the membership; any error
/// string means the socket was told why and must not be admitted.
async fn admit(
    context: &ServerContext,
    outbox_tx: &mpsc::Sender<Outbound>,
    participant_id: &str,
    session_id: &str,
    first_frame: &str,
    state: &mut SocketState,
) -> Result<watch::Receiver<bool>, String> {
    let frame = match serde_json::from_str::<SignalingMessage>(first_frame) {
        Ok(frame) => frame,
        Err(e) => {
            send_fatal(
                outbox_tx,
                format!("malformed Join frame: {e}"),
                CloseCode::Protocol,
            )
            .await;
            return Err(format!("malformed Join frame: {e}"));
        }
    };

    let payload = match frame {
        SignalingMessage::Join { payload, .. } => payload,
        _ => {
            send_fatal(outbox_tx, "expected a Join frame", CloseCode::Protocol).await;
            return Err("first frame was not Join".to_string());
        }
    };

    let token = payload
        .as_ref()
        .and_then(|p| p.get("authToken"))
        .and_then(|t| t.as_str())
        .unwrap_or_default();

    let user_id = match context.validator.validate(token).await {
        Some(user_id) => user_id,
        None => {
            send_fatal(
                outbox_tx,
                "Invalid authentication token",
                CloseCode::Protocol,
            )
            .await;
            return Err("invalid token".to_string());
        }
    };
    *state = SocketState::Authenticated;

    // Creating the room is itself a privileged act.
    if !context.rooms.contains_key(session_id) {
        match context
            .guard
            .check(&user_id, session_id, "session", ResourceAction::SessionCreate)
            .await
        {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => {
                send_fatal(outbox_tx, decision.reason.clone(), CloseCode::Policy).await;
                return Err(decision.reason);
            }
            Err(e) => {
                send_fatal(outbox_tx, "authorization unavailable", CloseCode::Away).await;
                return Err(format!("guard failure: {e}"));
            }
        }
    }
    match context
        .guard
        .check(&user_id, session_id, "session", ResourceAction::SessionJoin)
        .await
    {
        Ok(decision) if decision.allowed => {}
        Ok(decision) => {
            send_fatal(outbox_tx, decision.reason.clone(), CloseCode::Policy).await;
            return Err(decision.reason);
        }
        Err(e) => {
            send_fatal(outbox_tx, "authorization unavailable", CloseCode::Away).await;
            return Err(format!("guard failure: {e}"));
        }
    }

    let (close_tx, close_rx) = watch::channel(false);
    let created;
    {
        let mut room = context.rooms.entry(session_id.to_string()).or_default();
        created = room.members.is_empty();

        if room.members.len() >= context.config.max_participants_per_session {
            drop(room);
            if created {
                context
                    .rooms
                    .remove_if(session_id, |_, room| room.members.is_empty());
            }
            send_fatal(
                outbox_tx,
                format!("session {session_id} is full"),
                CloseCode::Again,
            )
            .await;
            return Err("room full".to_string());
        }
        if room.members.contains_key(participant_id) {
            drop(room);
            if created {
                context
                    .rooms
                    .remove_if(session_id, |_, room| room.members.is_empty());
            }
            send_fatal(
                outbox_tx,
                format!("participant {participant_id} is already connected"),
                CloseCode::Policy,
            )
            .await;
            return Err("duplicate participant id".to_string());
        }

        room.members.insert(
            participant_id.to_string(),
            Member {
                user_id,
                outbox: outbox_tx.clone(),
                last_seen: Instant::now(),
                close: close_tx,
            },
        );
    }
    *state = SocketState::Joined;

    let _ = outbox_tx
        .send(Outbound::Frame(SignalingMessage::join_ack(
            session_id.to_string(),
            participant_id,
        )))
        .await;
    broadcast_to_room(
        context,
        session_id,
        Some(participant_id),
        SignalingMessage::join_broadcast(session_id.to_string(), participant_id),
    );

    info!(participant_id, session_id, "participant joined signaling room");
    Ok(close_rx)
}

enum FrameOutcome {
    Continue,
    ProtocolError,
    Leave,
}

/// Handle one frame from a joined socket. Total match on the tag.
async fn dispatch(
    context: &ServerContext,
    outbox_tx: &mpsc::Sender<Outbound>,
    participant_id: &str,
    session_id: &str,
    frame: SignalingMessage,
) -> FrameOutcome {
    match frame {
        SignalingMessage::Join { .. } => {
            let _ = outbox_tx
                .send(Outbound::Frame(SignalingMessage::server_error(
                    "already joined",
                )))
                .await;
            FrameOutcome::ProtocolError
        }
        SignalingMessage::Leave { .. } => FrameOutcome::Leave,
        SignalingMessage::Heartbeat { .. } => {
            let _ = outbox_tx
                .send(Outbound::Frame(SignalingMessage::heartbeat()))
                .await;
            FrameOutcome::Continue
        }
        SignalingMessage::Error { error, .. } => {
            warn!(participant_id, "client reported error: {error}");
            FrameOutcome::Continue
        }
        frame @ (SignalingMessage::SdpOffer { .. }
        | SignalingMessage::SdpAnswer { .. }
        | SignalingMessage::IceCandidate { .. }) => {
            let to = match &frame {
                SignalingMessage::SdpOffer { to, .. }
                | SignalingMessage::SdpAnswer { to, .. }
                | SignalingMessage::IceCandidate { to, .. } => to.clone(),
                _ => unreachable!(),
            };

            if to == participant_id {
                let _ = outbox_tx
                    .send(Outbound::Frame(SignalingMessage::server_error(
                        "cannot route a frame to its sender",
                    )))
                    .await;
                return FrameOutcome::ProtocolError;
            }

            let forwarded = frame.with_from(participant_id);
            let delivered = context
                .rooms
                .get(session_id)
                .and_then(|room| {
                    room.members
                        .get(&to)
                        .map(|member| member.outbox.try_send(Outbound::Frame(forwarded)).is_ok())
                })
                .unwrap_or(false);

            if !delivered {
                let _ = outbox_tx
                    .send(Outbound::Frame(SignalingMessage::server_error(format!(
                        "participant {to} is not reachable in session {session_id}"
                    ))))
                    .await;
            }
            FrameOutcome::Continue
        }
    }
}

/// Record inbound traffic for the idle reaper
fn touch(context: &ServerContext, session_id: &str, participant_id: &str) {
    if let Some(mut room) = context.rooms.get_mut(session_id) {
        if let Some(member) = room.members.get_mut(participant_id) {
            member.last_seen = Instant::now();
        }
    }
}

/// Queue a frame to every room member except `skip`.
///
/// Uses `try_send`: a member whose outbox is full simply misses the frame
/// and will be reaped if it stays silent; the room is never blocked.
fn broadcast_to_room(
    context: &ServerContext,
    session_id: &str,
    skip: Option<&str>,
    frame: SignalingMessage,
) {
    if let Some(room) = context.rooms.get(session_id) {
        for (member_id, member) in &room.members {
            if Some(member_id.as_str()) == skip {
                continue;
            }
            if member
                .outbox
                .try_send(Outbound::Frame(frame.clone()))
                .is_err()
            {
                debug!(member_id, "dropping frame for slow signaling socket");
            }
        }
    }
}

fn remove_member(context: &ServerContext, session_id: &str, participant_id: &str) {
    if let Some(mut room) = context.rooms.get_mut(session_id) {
        room.members.remove(participant_id);
    }
    context
        .rooms
        .remove_if(session_id, |_, room| room.members.is_empty());
}

/// Send an error frame followed by a close with the given code.
async fn send_fatal(outbox_tx: &mpsc::Sender<Outbound>, reason: impl Into<String>, code: CloseCode) {
    let reason = reason.into();
    let _ = outbox_tx
        .send(Outbound::Frame(SignalingMessage::server_error(
            reason.clone(),
        )))
        .await;
    let _ = outbox_tx
        .send(Outbound::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_extracts_ids() {
        let (p, s) = parse_query("participantId=u2&sessionId=s1");
        assert_eq!(p.as_deref(), Some("u2"));
        assert_eq!(s.as_deref(), Some("s1"));
    }

    #[test]
    fn query_parsing_rejects_empty_values() {
        let (p, s) = parse_query("participantId=&sessionId=s1");
        assert!(p.is_none());
        assert_eq!(s.as_deref(), Some("s1"));
    }

    #[test]
    fn unknown_query_params_are_ignored() {
        let (p, s) = parse_query("participantId=u2&sessionId=s1&extra=1");
        assert_eq!(p.as_deref(), Some("u2"));
        assert_eq!(s.as_deref(), Some("s1"));
    }
}
