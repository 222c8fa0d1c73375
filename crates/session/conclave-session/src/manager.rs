//! Session manager
//!
//! The coordinator of the fabric. Every session is a map entry guarded by
//! its own async mutex: all mutations of one session are serialized, while
//! distinct sessions proceed concurrently. The access guard is consulted at
//! every privileged boundary, every mutation bumps `last_activity` and is
//! snapshotted, and restore happens purely by subscribing to recreate
//! events on the shared bus.

use crate::handoff::HandoffManager;
use crate::message::{A2aFrame, HandoffAction, SessionMessage, StateSync, TaskAction, VetoNotice};
use crate::peer::{ChannelSendError, DataChannel, PeerConnector, SyntheticSdpConnector};
use crate::persistence::{SessionSnapshot, SessionStore};
use crate::policy::{A2aMediator, LenientVetoPolicy, LoopbackMediator, VetoBallot, VetoPolicy};
use crate::types::{
    agent_pair_key, ConnectionState, HandshakeRecord, HandshakeState, Participant, Session,
    SessionConfig, SessionStatus, Task,
};
use chrono::{DateTime, Utc};
use conclave_consensus::{ConsensusEngine, ConsensusResult, VoteOption, VoterProfile, VotingAlgorithm};
use conclave_core::events::{ConclaveEvent, EventBus};
use conclave_core::rbac::{RbacGuard, ResourceAction};
use conclave_core::types::{now_millis, AgentId, SessionId, TaskId, UserId, VotingSessionId};
use conclave_core::{ConclaveError, ConclaveResult};
use conclave_signaling::SignalingClient;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A join request
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Joining user
    pub user_id: UserId,
    /// Agent paired with the user, if any
    pub agent_id: Option<AgentId>,
    /// Display name
    pub display_name: String,
    /// Capability strings
    pub capabilities: BTreeSet<String>,
    /// Credential for the signaling relay; defaults to the reference
    /// bearer form
    pub auth_token: Option<String>,
}

impl JoinRequest {
    /// Request with defaults derived from the user id
    pub fn new(user_id: impl Into<UserId>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            agent_id: None,
            capabilities: BTreeSet::new(),
            auth_token: None,
        }
    }

    /// Pair an agent with the joining user
    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Declare capabilities
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Present an explicit credential
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Outcome of a veto request
#[derive(Debug, Clone)]
pub struct VetoResponse {
    /// Whether the veto was accepted and the task removed
    pub accepted: bool,
    /// The vote that decided it
    pub voting_session_id: VotingSessionId,
    /// Human-readable verdict
    pub message: String,
    /// Full vote outcome including the distribution
    pub result: ConsensusResult,
}

/// Live, non-serialized state of one participant
struct ParticipantRuntime {
    channel: DataChannel,
    inbox: Option<mpsc::Receiver<SessionMessage>>,
    signaling: Option<SignalingClient>,
}

/// One session plus its runtime, guarded by a single mutex
struct SessionEntry {
    session: Session,
    runtime: HashMap<UserId, ParticipantRuntime>,
    /// Last writer per task id, for state-sync conflict resolution
    task_meta: HashMap<TaskId, (i64, UserId)>,
}

/// The session coordinator.
pub struct SessionManager {
    guard: Arc<dyn RbacGuard>,
    bus: EventBus,
    store: Arc<dyn SessionStore>,
    consensus: Arc<ConsensusEngine>,
    handoffs: Arc<HandoffManager>,
    veto_policy: Arc<dyn VetoPolicy>,
    mediator: Arc<dyn A2aMediator>,
    connector: Arc<dyn PeerConnector>,
    sessions: DashMap<SessionId, Arc<Mutex<SessionEntry>>>,
}

impl SessionManager {
    /// Create a manager with the default collaborators
    pub fn new(guard: Arc<dyn RbacGuard>, bus: EventBus, store: Arc<dyn SessionStore>) -> Self {
        Self {
            guard,
            bus,
            store,
            consensus: Arc::new(ConsensusEngine::new()),
            handoffs: Arc::new(HandoffManager::new()),
            veto_policy: Arc::new(LenientVetoPolicy),
            mediator: Arc::new(LoopbackMediator),
            connector: Arc::new(SyntheticSdpConnector),
            sessions: DashMap::new(),
        }
    }

    /// Replace the veto policy
    pub fn with_veto_policy(mut self, policy: Arc<dyn VetoPolicy>) -> Self {
        self.veto_policy = policy;
        self
    }

    /// Replace the A2A mediator
    pub fn with_mediator(mut self, mediator: Arc<dyn A2aMediator>) -> Self {
        self.mediator = mediator;
        self
    }

    /// Replace the peer connector
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// The voting engine shared with callers (e.g. the delegate)
    pub fn consensus(&self) -> Arc<ConsensusEngine> {
        self.consensus.clone()
    }

    /// The handoff manager
    pub fn handoffs(&self) -> Arc<HandoffManager> {
        self.handoffs.clone()
    }

    /// The shared event bus
    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// React to `SessionRecreate` events published by the restore manager.
    ///
    /// Restoring a session that is already live is a no-op.
    pub fn spawn_recreate_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConclaveEvent::SessionRecreate {
                        session_id,
                        snapshot,
                        ..
                    }) => {
                        if let Err(e) = manager.recreate_from_snapshot(&session_id, snapshot).await
                        {
                            warn!(session_id, "session recreate failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recreate listener lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn recreate_from_snapshot(
        &self,
        session_id: &str,
        snapshot: serde_json::Value,
    ) -> ConclaveResult<()> {
        if self.sessions.contains_key(session_id) {
            debug!(session_id, "session already live, ignoring recreate");
            return Ok(());
        }

        let snapshot: SessionSnapshot = serde_json::from_value(snapshot)?;
        let mut session = snapshot.session;
        // Participants come back without transports and rejoin over
        // signaling.
        for participant in session.participants.values_mut() {
            participant.connection_state = ConnectionState::Disconnected;
        }
        session.touch(Utc::now());

        info!(session_id = %session.id, participants = session.participants.len(), "session restored");
        self.sessions.insert(
            session.id.clone(),
            Arc::new(Mutex::new(SessionEntry {
                session: session.clone(),
                runtime: HashMap::new(),
                task_meta: HashMap::new(),
            })),
        );
        self.bus.publish(ConclaveEvent::SessionRestored {
            session_id: session.id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Create a session with the caller as host.
    pub async fn create_session(&self, config: SessionConfig) -> ConclaveResult<Session> {
        config.validate()?;
        self.authorize(
            &config.host_user_id,
            &config.session_id,
            ResourceAction::SessionCreate,
        )
        .await?;

        if self.sessions.contains_key(&config.session_id) {
            return Err(ConclaveError::conflict(format!(
                "session {} already exists",
                config.session_id
            )));
        }

        let mut session = Session::new(config.clone());
        let now = Utc::now();
        session.participants.insert(
            config.host_user_id.clone(),
            Participant {
                user_id: config.host_user_id.clone(),
                agent_id: None,
                display_name: config.host_user_id.clone(),
                joined_at: now,
                is_host: true,
                authenticated: true,
                capabilities: BTreeSet::new(),
                connection_state: ConnectionState::Connected,
            },
        );
        session.status = SessionStatus::Active;

        let (channel, inbox) = DataChannel::new();
        let mut runtime = HashMap::new();
        runtime.insert(
            config.host_user_id.clone(),
            ParticipantRuntime {
                channel,
                inbox: Some(inbox),
                signaling: None,
            },
        );

        self.sessions.insert(
            session.id.clone(),
            Arc::new(Mutex::new(SessionEntry {
                session: session.clone(),
                runtime,
                task_meta: HashMap::new(),
            })),
        );

        info!(session_id = %session.id, host = %session.host_user_id, "session created");
        self.bus.publish(ConclaveEvent::SessionCreated {
            session_id: session.id.clone(),
            host_user_id: session.host_user_id.clone(),
            timestamp: Utc::now(),
        });
        self.snapshot(&session).await;
        Ok(session)
    }

    /// Join a session.
    ///
    /// Joining a session one is already a member of succeeds idempotently;
    /// a member left Disconnected by a restore is reconnected instead.
    pub async fn join_session(
        &self,
        session_id: &str,
        request: JoinRequest,
    ) -> ConclaveResult<Session> {
        self.authorize(&request.user_id, session_id, ResourceAction::SessionJoin)
            .await?;

        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;

        if entry.session.status != SessionStatus::Active {
            return Err(ConclaveError::invalid_state(format!(
                "session {session_id} is not active"
            )));
        }

        let reconnect = match entry.session.participants.get(&request.user_id) {
            Some(p) if p.connection_state == ConnectionState::Disconnected => true,
            Some(_) => return Ok(entry.session.clone()),
            None => false,
        };

        if !reconnect && entry.session.participants.len() >= entry.session.config.max_participants
        {
            return Err(ConclaveError::resource_exhausted(format!(
                "session {session_id} is full ({} participants)",
                entry.session.participants.len()
            )));
        }

        let (channel, inbox) = DataChannel::new();
        if reconnect {
            let participant = entry
                .session
                .participants
                .get_mut(&request.user_id)
                .ok_or_else(|| {
                    ConclaveError::internal("participant vanished during reconnect")
                })?;
            participant.connection_state = ConnectionState::Connecting;
        } else {
            entry.session.participants.insert(
                request.user_id.clone(),
                Participant {
                    user_id: request.user_id.clone(),
                    agent_id: request.agent_id.clone(),
                    display_name: request.display_name.clone(),
                    joined_at: Utc::now(),
                    is_host: false,
                    authenticated: true,
                    capabilities: request.capabilities.clone(),
                    connection_state: ConnectionState::Connecting,
                },
            );
        }
        entry.runtime.insert(
            request.user_id.clone(),
            ParticipantRuntime {
                channel,
                inbox: Some(inbox),
                signaling: None,
            },
        );

        // Connection establishment towards every present peer. Any failure
        // rolls the membership back so the session stays consistent.
        if let Err(e) = self.establish_links(&mut entry, &request).await {
            entry.runtime.remove(&request.user_id);
            if reconnect {
                if let Some(p) = entry.session.participants.get_mut(&request.user_id) {
                    p.connection_state = ConnectionState::Disconnected;
                }
            } else {
                entry.session.participants.remove(&request.user_id);
            }
            return Err(e);
        }

        // The in-process data channel is open as soon as it exists.
        if let Some(p) = entry.session.participants.get_mut(&request.user_id) {
            p.connection_state = ConnectionState::Connected;
        }
        self.bus.publish(ConclaveEvent::ConnectionStateChanged {
            session_id: session_id.to_string(),
            user_id: request.user_id.clone(),
            state: "connected".to_string(),
            timestamp: Utc::now(),
        });
        self.bus.publish(ConclaveEvent::ParticipantJoined {
            session_id: session_id.to_string(),
            user_id: request.user_id.clone(),
            timestamp: Utc::now(),
        });

        entry.session.touch(Utc::now());
        info!(session_id, user_id = %request.user_id, "participant joined");
        self.snapshot(&entry.session).await;
        Ok(entry.session.clone())
    }

    /// Send connection offers to every present peer, over the relay when it
    /// is enabled and reachable, otherwise directly over the event bus when
    /// the configuration allows the fallback.
    async fn establish_links(
        &self,
        entry: &mut SessionEntry,
        request: &JoinRequest,
    ) -> ConclaveResult<()> {
        let session_id = entry.session.id.clone();
        let signaling_config = entry.session.config.signaling.clone();
        let peers: Vec<UserId> = {
            let mut peers: Vec<UserId> = entry
                .session
                .participants
                .keys()
                .filter(|id| **id != request.user_id)
                .cloned()
                .collect();
            peers.sort();
            peers
        };

        let mut relay: Option<SignalingClient> = None;
        if signaling_config.enable_signaling {
            let token = request
                .auth_token
                .clone()
                .unwrap_or_else(|| format!("user-{}", request.user_id));
            let client = SignalingClient::new(
                signaling_config.clone(),
                request.user_id.clone(),
                session_id.clone(),
                token,
            );
            match client.connect().await {
                Ok(()) => relay = Some(client),
                Err(e)
                    if signaling_config.fallback_to_direct
                        && matches!(
                            e.kind(),
                            conclave_core::ErrorKind::Unavailable
                                | conclave_core::ErrorKind::Timeout
                        ) =>
                {
                    debug!(session_id = %session_id, "signaling unreachable, using direct fallback: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        for peer in peers {
            let offer = self
                .connector
                .create_offer(&request.user_id, &peer, &session_id)
                .await?;
            match &relay {
                Some(client) => client.send_offer(peer.clone(), offer).await?,
                None => self.bus.publish(ConclaveEvent::SdpOffer {
                    session_id: session_id.clone(),
                    from: request.user_id.clone(),
                    to: peer.clone(),
                    sdp: offer,
                    timestamp: Utc::now(),
                }),
            }
        }

        if let Some(rt) = entry.runtime.get_mut(&request.user_id) {
            rt.signaling = relay;
        }
        Ok(())
    }

    /// Leave a session.
    pub async fn leave_session(&self, session_id: &str, user_id: &str) -> ConclaveResult<()> {
        self.authorize(user_id, session_id, ResourceAction::SessionLeave)
            .await?;

        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;

        let participant = entry
            .session
            .participants
            .remove(user_id)
            .ok_or_else(|| {
                ConclaveError::not_found(format!(
                    "user {user_id} is not a participant of session {session_id}"
                ))
            })?;

        // Removal closes the participant's transports.
        if let Some(runtime) = entry.runtime.remove(user_id) {
            if let Some(client) = runtime.signaling {
                let _ = client.leave().await;
            }
        }

        self.bus.publish(ConclaveEvent::ParticipantLeft {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        });
        info!(session_id, user_id, "participant left");

        if entry.session.participants.is_empty() {
            self.close_locked(&mut entry).await;
            return Ok(());
        }

        if participant.is_host {
            let successor = entry
                .session
                .successor_host(user_id)
                .map(|p| p.user_id.clone())
                .ok_or_else(|| {
                    ConclaveError::internal("non-empty session has no successor host")
                })?;
            entry.session.host_user_id = successor.clone();
            for p in entry.session.participants.values_mut() {
                p.is_host = p.user_id == successor;
            }
            info!(session_id, new_host = %successor, "host transferred");

            let sync = SessionMessage::State {
                from: successor.clone(),
                session_id: session_id.to_string(),
                payload: StateSync::Full {
                    status: entry.session.status,
                    host_user_id: successor,
                    tasks: entry.session.active_tasks.clone(),
                    last_activity: now_millis(),
                },
                timestamp: now_millis(),
            };
            self.broadcast_locked(&mut entry, &sync);
        }

        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(())
    }

    /// Close a session. Idempotent.
    pub async fn close_session(&self, session_id: &str) -> ConclaveResult<()> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;
        if entry.session.status == SessionStatus::Closed {
            return Ok(());
        }
        self.close_locked(&mut entry).await;
        Ok(())
    }

    async fn close_locked(&self, entry: &mut SessionEntry) {
        for (_, runtime) in entry.runtime.drain() {
            if let Some(client) = runtime.signaling {
                let _ = client.disconnect().await;
            }
        }
        entry.session.open_vetoes.clear();
        entry.session.open_handshakes.clear();
        entry.session.status = SessionStatus::Closed;
        entry.session.touch(Utc::now());

        info!(session_id = %entry.session.id, "session closed");
        self.bus.publish(ConclaveEvent::SessionClosed {
            session_id: entry.session.id.clone(),
            timestamp: Utc::now(),
        });
        self.snapshot(&entry.session).await;
    }

    /// Pause an active session.
    pub async fn pause_session(&self, session_id: &str) -> ConclaveResult<()> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;
        if entry.session.status != SessionStatus::Active {
            return Err(ConclaveError::invalid_state(format!(
                "session {session_id} is not active"
            )));
        }
        entry.session.status = SessionStatus::Paused;
        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(())
    }

    /// Resume a paused session.
    pub async fn resume_session(&self, session_id: &str) -> ConclaveResult<()> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;
        if entry.session.status != SessionStatus::Paused {
            return Err(ConclaveError::invalid_state(format!(
                "session {session_id} is not paused"
            )));
        }
        entry.session.status = SessionStatus::Active;
        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(())
    }

    /// Add a task and announce it to every open channel.
    ///
    /// Re-adding a task with an existing id replaces it (last write wins).
    pub async fn add_task(&self, session_id: &str, from_user: &str, task: Task) -> ConclaveResult<()> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;

        if entry.session.status != SessionStatus::Active {
            return Err(ConclaveError::invalid_state(format!(
                "session {session_id} is not active"
            )));
        }
        if !entry.session.participants.contains_key(from_user) {
            return Err(ConclaveError::not_found(format!(
                "user {from_user} is not a participant of session {session_id}"
            )));
        }

        let message = SessionMessage::task(
            from_user,
            session_id,
            TaskAction::Added { task: task.clone() },
        );
        let timestamp = message.timestamp();

        entry
            .task_meta
            .insert(task.id.clone(), (timestamp, from_user.to_string()));
        entry.session.active_tasks.insert(task.id.clone(), task);
        self.broadcast_locked(&mut entry, &message);

        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(())
    }

    /// Request a consensus veto of a task.
    pub async fn request_veto(
        &self,
        session_id: &str,
        requester: &str,
        task_id: &str,
        reason: &str,
    ) -> ConclaveResult<VetoResponse> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;

        if !entry.session.config.enable_vetoes {
            return Err(ConclaveError::invalid_state(format!(
                "vetoes are disabled for session {session_id}"
            )));
        }
        if !entry.session.participants.contains_key(requester) {
            return Err(ConclaveError::not_found(format!(
                "user {requester} is not a participant of session {session_id}"
            )));
        }
        let task = entry
            .session
            .active_tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                ConclaveError::not_found(format!(
                    "task {task_id} does not exist in session {session_id}"
                ))
            })?;
        if entry.session.open_vetoes.contains_key(task_id) {
            return Err(ConclaveError::conflict(format!(
                "a veto is already open for task {task_id}"
            )));
        }
        self.authorize(requester, session_id, ResourceAction::ConsensusVeto)
            .await?;

        let quorum = entry.session.participants.len().div_ceil(2);
        let options = vec![
            VoteOption::new("accept-veto", "Accept veto", serde_json::json!(true)),
            VoteOption::new("reject-veto", "Reject veto", serde_json::json!(false)),
        ];
        let voting_session_id = self
            .consensus
            .create_session(
                format!("veto of task {task_id} in session {session_id}"),
                options,
                Some(quorum),
            )
            .await?;

        entry
            .session
            .open_vetoes
            .insert(task_id.to_string(), voting_session_id);

        let announce = SessionMessage::Veto {
            from: requester.to_string(),
            session_id: session_id.to_string(),
            payload: VetoNotice {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
                voting_session_id,
            },
            timestamp: now_millis(),
        };
        self.broadcast_locked(&mut entry, &announce);

        // Collect ballots and close; the open-veto mapping is released no
        // matter how the vote ends.
        let vote_outcome = self
            .run_veto_vote(&entry, voting_session_id, requester, &task, reason)
            .await;
        entry.session.open_vetoes.remove(task_id);
        let result = vote_outcome?;

        let accepted = result.consensus_reached
            && result
                .winning_option
                .as_ref()
                .map(|o| o.value == serde_json::json!(true))
                .unwrap_or(false);

        if accepted {
            entry.session.active_tasks.remove(task_id);
            entry
                .task_meta
                .insert(task_id.to_string(), (now_millis(), requester.to_string()));
            self.bus.publish(ConclaveEvent::TaskVetoed {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                requested_by: requester.to_string(),
                timestamp: Utc::now(),
            });
            info!(session_id, task_id, requester, "task vetoed");
        }

        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;

        Ok(VetoResponse {
            accepted,
            voting_session_id,
            message: if accepted {
                "Veto accepted by consensus".to_string()
            } else {
                "Veto rejected by consensus".to_string()
            },
            result,
        })
    }

    /// Ballots come from every participant except the requester whose agent
    /// is known; the per-participant policy decides each one.
    async fn run_veto_vote(
        &self,
        entry: &SessionEntry,
        voting_session_id: VotingSessionId,
        requester: &str,
        task: &Task,
        reason: &str,
    ) -> ConclaveResult<ConsensusResult> {
        let mut voters: Vec<&Participant> = entry
            .session
            .participants
            .values()
            .filter(|p| p.user_id != requester && p.agent_id.is_some())
            .collect();
        voters.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        for participant in voters {
            self.consensus
                .register_voter(VoterProfile {
                    id: participant.user_id.clone(),
                    expertise: participant.capabilities.iter().cloned().collect(),
                    weight: None,
                })
                .await?;

            let ballot = self.veto_policy.decide(participant, task, reason).await;
            let option = match ballot {
                VetoBallot::Accept => "accept-veto",
                VetoBallot::Reject => "reject-veto",
                VetoBallot::Abstain => continue,
            };
            self.consensus
                .cast_vote(voting_session_id, &participant.user_id, option, None)
                .await?;
        }

        self.consensus
            .close_session(voting_session_id, VotingAlgorithm::SimpleMajority, None)
            .await
    }

    /// Start an agent-to-agent handshake between two member agents.
    pub async fn initiate_a2a_handshake(
        &self,
        session_id: &str,
        source_agent: &str,
        target_agent: &str,
        task_id: &str,
        capabilities: Vec<String>,
    ) -> ConclaveResult<HandshakeRecord> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;

        if !entry.session.config.enable_a2a {
            return Err(ConclaveError::invalid_state(format!(
                "A2A handshakes are disabled for session {session_id}"
            )));
        }

        let source_user = participant_for_agent(&entry.session, source_agent)?;
        participant_for_agent(&entry.session, target_agent)?;

        let pair = agent_pair_key(source_agent, target_agent);
        if entry.session.open_handshakes.contains_key(&pair) {
            return Err(ConclaveError::conflict(format!(
                "a handshake between {source_agent} and {target_agent} is already open"
            )));
        }

        let mut record = HandshakeRecord {
            id: Uuid::new_v4(),
            source_agent: source_agent.to_string(),
            target_agent: target_agent.to_string(),
            protocol_version: conclave_core::PROTOCOL_VERSION.to_string(),
            capabilities,
            task_id: task_id.to_string(),
            state: HandshakeState::Proposed,
        };
        entry.session.open_handshakes.insert(pair.clone(), record.id);

        let request_msg = SessionMessage::A2A {
            from: source_user.clone(),
            to: None,
            session_id: session_id.to_string(),
            payload: A2aFrame::Request {
                handshake: record.clone(),
            },
            timestamp: now_millis(),
        };
        self.broadcast_locked(&mut entry, &request_msg);

        // The mediator is an external collaborator; a failure surfaces after
        // the pair mapping is released.
        let reply = match self.mediator.negotiate(&record).await {
            Ok(reply) => reply,
            Err(e) => {
                entry.session.open_handshakes.remove(&pair);
                return Err(e);
            }
        };

        let next = if reply.accepted {
            HandshakeState::Accepted
        } else {
            HandshakeState::Rejected
        };
        debug_assert!(record.state.can_transition_to(next));
        record.state = next;
        if !reply.accepted {
            entry.session.open_handshakes.remove(&pair);
        }

        let response_msg = SessionMessage::A2A {
            from: source_user,
            to: None,
            session_id: session_id.to_string(),
            payload: A2aFrame::Response {
                handshake_id: record.id,
                accepted: reply.accepted,
                capabilities: reply.capabilities,
            },
            timestamp: now_millis(),
        };
        self.broadcast_locked(&mut entry, &response_msg);
        self.bus.publish(ConclaveEvent::HandshakeResponse {
            session_id: session_id.to_string(),
            handshake_id: record.id,
            source_agent: record.source_agent.clone(),
            target_agent: record.target_agent.clone(),
            accepted: reply.accepted,
            timestamp: Utc::now(),
        });

        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(record)
    }

    /// A snapshot of a session
    pub async fn get_session(&self, session_id: &str) -> ConclaveResult<Session> {
        let entry = self.entry(session_id)?;
        let entry = entry.lock().await;
        Ok(entry.session.clone())
    }

    /// Ids of live sessions
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Take a participant's inbound message stream.
    ///
    /// Each participant's receiver can be taken once; messages from a given
    /// sender arrive in send order.
    pub async fn take_message_receiver(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> ConclaveResult<mpsc::Receiver<SessionMessage>> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;
        let runtime = entry.runtime.get_mut(user_id).ok_or_else(|| {
            ConclaveError::not_found(format!(
                "user {user_id} has no live channel in session {session_id}"
            ))
        })?;
        runtime.inbox.take().ok_or_else(|| {
            ConclaveError::invalid_state(format!(
                "the message receiver for {user_id} was already taken"
            ))
        })
    }

    /// Pair (or re-pair) an agent with an existing participant.
    pub async fn set_participant_agent(
        &self,
        session_id: &str,
        user_id: &str,
        agent_id: impl Into<AgentId>,
    ) -> ConclaveResult<()> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;
        let participant = entry.session.participants.get_mut(user_id).ok_or_else(|| {
            ConclaveError::not_found(format!(
                "user {user_id} is not a participant of session {session_id}"
            ))
        })?;
        participant.agent_id = Some(agent_id.into());
        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(())
    }

    /// Apply an inbound data-channel message. Total match over the tag.
    pub async fn handle_message(&self, message: SessionMessage) -> ConclaveResult<()> {
        let session_id = message.session_id().to_string();
        let entry = self.entry(&session_id)?;
        let mut entry = entry.lock().await;

        let observed = DateTime::<Utc>::from_timestamp_millis(message.timestamp())
            .unwrap_or_else(Utc::now);

        match message {
            SessionMessage::Task {
                from,
                payload: action,
                timestamp,
                ..
            } => match action {
                TaskAction::Added { task } | TaskAction::Updated { task } => {
                    entry
                        .task_meta
                        .insert(task.id.clone(), (timestamp, from.clone()));
                    entry.session.active_tasks.insert(task.id.clone(), task);
                }
                TaskAction::Removed { task_id } => {
                    entry.task_meta.insert(task_id.clone(), (timestamp, from));
                    entry.session.active_tasks.remove(&task_id);
                }
                TaskAction::Completed { task_id } => {
                    entry
                        .task_meta
                        .insert(task_id.clone(), (timestamp, from.clone()));
                    entry.session.active_tasks.remove(&task_id);
                    self.bus.publish(ConclaveEvent::TaskCompleted {
                        session_id: session_id.clone(),
                        task_id,
                        timestamp: Utc::now(),
                    });
                }
            },
            SessionMessage::Veto { payload, .. } => {
                // Already-open vetoes make repeated requests idempotent.
                if entry.session.active_tasks.contains_key(&payload.task_id)
                    && !entry.session.open_vetoes.contains_key(&payload.task_id)
                {
                    entry
                        .session
                        .open_vetoes
                        .insert(payload.task_id, payload.voting_session_id);
                } else {
                    debug!(task_id = %payload.task_id, "ignoring veto frame for handled task");
                }
            }
            SessionMessage::A2A { from, payload, .. } => {
                self.apply_a2a_frame(&mut entry, &session_id, from, payload)
                    .await;
            }
            SessionMessage::State {
                from,
                payload,
                timestamp,
                ..
            } => {
                apply_state_sync(&mut entry, &from, payload, timestamp);
            }
            SessionMessage::Handoff { payload: action, .. } => match action {
                HandoffAction::Initiate { request } => {
                    let outcome = self.handoffs.initiate(request);
                    if !outcome.success {
                        warn!(
                            session_id,
                            "inbound handoff initiation failed: {:?}", outcome.error
                        );
                    }
                }
                HandoffAction::Complete {
                    handoff_id,
                    accepting_agent_id,
                } => {
                    if let Err(e) = self.handoffs.complete(handoff_id, &accepting_agent_id) {
                        warn!(session_id, %handoff_id, "inbound handoff completion failed: {e}");
                    }
                }
                HandoffAction::Cancel { handoff_id } => {
                    if let Err(e) = self.handoffs.cancel(handoff_id) {
                        warn!(session_id, %handoff_id, "inbound handoff cancel failed: {e}");
                    }
                }
            },
            SessionMessage::Heartbeat { .. } => {}
        }

        entry.session.touch(observed);
        entry.session.touch(Utc::now());
        self.snapshot(&entry.session).await;
        Ok(())
    }

    async fn apply_a2a_frame(
        &self,
        entry: &mut SessionEntry,
        session_id: &str,
        from: UserId,
        frame: A2aFrame,
    ) {
        match frame {
            A2aFrame::Request { handshake } => {
                let pair = agent_pair_key(&handshake.source_agent, &handshake.target_agent);
                if entry.session.open_handshakes.contains_key(&pair) {
                    debug!(session_id, "ignoring duplicate handshake request");
                    return;
                }
                entry
                    .session
                    .open_handshakes
                    .insert(pair.clone(), handshake.id);

                // Answer on behalf of a locally present target agent.
                let target_is_member = entry
                    .session
                    .participants
                    .values()
                    .any(|p| p.agent_id.as_deref() == Some(handshake.target_agent.as_str()));
                if !target_is_member {
                    return;
                }
                match self.mediator.negotiate(&handshake).await {
                    Ok(reply) => {
                        if !reply.accepted {
                            entry.session.open_handshakes.remove(&pair);
                        }
                        let response = SessionMessage::A2A {
                            from,
                            to: None,
                            session_id: session_id.to_string(),
                            payload: A2aFrame::Response {
                                handshake_id: handshake.id,
                                accepted: reply.accepted,
                                capabilities: reply.capabilities,
                            },
                            timestamp: now_millis(),
                        };
                        self.broadcast_locked(entry, &response);
                        self.bus.publish(ConclaveEvent::HandshakeResponse {
                            session_id: session_id.to_string(),
                            handshake_id: handshake.id,
                            source_agent: handshake.source_agent,
                            target_agent: handshake.target_agent,
                            accepted: reply.accepted,
                            timestamp: Utc::now(),
                        });
                    }
                    Err(e) => {
                        entry.session.open_handshakes.remove(&pair);
                        warn!(session_id, "mediator failed on inbound handshake: {e}");
                    }
                }
            }
            A2aFrame::Response {
                handshake_id,
                accepted,
                ..
            } => {
                let pair = entry
                    .session
                    .open_handshakes
                    .iter()
                    .find(|(_, id)| **id == handshake_id)
                    .map(|(pair, _)| pair.clone());
                let Some(pair) = pair else {
                    debug!(session_id, %handshake_id, "response for unknown handshake");
                    return;
                };
                if !accepted {
                    entry.session.open_handshakes.remove(&pair);
                }
                let (source_agent, target_agent) = pair
                    .split_once("->")
                    .map(|(s, t)| (s.to_string(), t.to_string()))
                    .unwrap_or_default();
                self.bus.publish(ConclaveEvent::HandshakeResponse {
                    session_id: session_id.to_string(),
                    handshake_id,
                    source_agent,
                    target_agent,
                    accepted,
                    timestamp: Utc::now(),
                });
            }
            A2aFrame::Negotiation { handshake_id, note } => {
                debug!(session_id, %handshake_id, note, "handshake negotiation note");
            }
        }
    }

    /// Queue a message to every participant channel.
    ///
    /// Enqueue-and-forget: a peer that overflows its bounded buffer is
    /// marked Failed and the broadcast carries on.
    fn broadcast_locked(&self, entry: &mut SessionEntry, message: &SessionMessage) {
        let mut failed: Vec<UserId> = Vec::new();
        for (user_id, runtime) in &entry.runtime {
            match runtime.channel.try_send(message.clone()) {
                Ok(()) => {}
                Err(ChannelSendError::Overflow) | Err(ChannelSendError::Closed) => {
                    failed.push(user_id.clone());
                }
            }
        }
        for user_id in failed {
            warn!(session_id = %entry.session.id, user_id = %user_id, "peer channel failed during broadcast");
            if let Some(p) = entry.session.participants.get_mut(&user_id) {
                p.connection_state = ConnectionState::Failed;
            }
            self.bus.publish(ConclaveEvent::ConnectionStateChanged {
                session_id: entry.session.id.clone(),
                user_id,
                state: "failed".to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    async fn authorize(
        &self,
        user_id: &str,
        session_id: &str,
        action: ResourceAction,
    ) -> ConclaveResult<()> {
        let decision = self
            .guard
            .check(user_id, session_id, "session", action)
            .await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(ConclaveError::permission_denied(decision.reason))
        }
    }

    fn entry(&self, session_id: &str) -> ConclaveResult<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| ConclaveError::not_found(format!("session {session_id} does not exist")))
    }

    async fn snapshot(&self, session: &Session) {
        if let Err(e) = self.store.save_snapshot(session).await {
            warn!(session_id = %session.id, "snapshot failed: {e}");
        }
    }
}

/// Resolve the user id carrying a given agent
fn participant_for_agent(session: &Session, agent_id: &str) -> ConclaveResult<UserId> {
    session
        .participants
        .values()
        .find(|p| p.agent_id.as_deref() == Some(agent_id))
        .map(|p| p.user_id.clone())
        .ok_or_else(|| {
            ConclaveError::not_found(format!(
                "agent {agent_id} is not a member of session {}",
                session.id
            ))
        })
}

/// Merge a state-sync payload.
///
/// Incremental task deltas resolve conflicts last-writer-wins on the
/// message timestamp; equal timestamps fall back to the lexicographically
/// smaller sender id, matching the fabric's other tie-breaks.
fn apply_state_sync(entry: &mut SessionEntry, from: &str, sync: StateSync, timestamp: i64) {
    match sync {
        StateSync::Full {
            status,
            host_user_id,
            tasks,
            last_activity,
        } => {
            entry.session.status = status;
            entry.session.host_user_id = host_user_id.clone();
            for p in entry.session.participants.values_mut() {
                p.is_host = p.user_id == host_user_id;
            }
            entry.task_meta = tasks
                .keys()
                .map(|id| (id.clone(), (timestamp, from.to_string())))
                .collect();
            entry.session.active_tasks = tasks;
            if let Some(at) = DateTime::<Utc>::from_timestamp_millis(last_activity) {
                entry.session.touch(at);
            }
        }
        StateSync::Incremental {
            upserts,
            removals,
            last_activity,
        } => {
            for task in upserts {
                if wins(entry, &task.id, timestamp, from) {
                    entry
                        .task_meta
                        .insert(task.id.clone(), (timestamp, from.to_string()));
                    entry.session.active_tasks.insert(task.id.clone(), task);
                }
            }
            for task_id in removals {
                if wins(entry, &task_id, timestamp, from) {
                    entry
                        .task_meta
                        .insert(task_id.clone(), (timestamp, from.to_string()));
                    entry.session.active_tasks.remove(&task_id);
                }
            }
            if let Some(at) = DateTime::<Utc>::from_timestamp_millis(last_activity) {
                entry.session.touch(at);
            }
        }
    }
}

fn wins(entry: &SessionEntry, task_id: &str, timestamp: i64, sender: &str) -> bool {
    match entry.task_meta.get(task_id) {
        None => true,
        Some((existing_ts, existing_sender)) => {
            timestamp > *existing_ts
                || (timestamp == *existing_ts && sender < existing_sender.as_str())
        }
    }
}
