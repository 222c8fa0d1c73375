//! Session data model

use chrono::{DateTime, Utc};
use conclave_core::types::{AgentId, HandoffId, SessionId, TaskId, UserId, VotingSessionId};
use conclave_core::{ConclaveError, ConclaveResult};
use conclave_signaling::SignalingConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Being set up; not yet accepting joins
    Initializing,
    /// Accepting joins and traffic
    Active,
    /// Temporarily suspended
    Paused,
    /// Terminal
    Closed,
}

/// Per-peer transport condition of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Connection establishment in flight
    Connecting,
    /// Data channel open
    Connected,
    /// No live transport (e.g. after restore)
    Disconnected,
    /// Transport gave up or the peer overflowed its buffers
    Failed,
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

/// A unit of work tracked by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id, unique within the session
    pub id: TaskId,
    /// Human description
    pub description: String,
    /// Priority
    pub priority: TaskPriority,
    /// Opaque payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    /// Create a task with an empty payload
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            priority,
            payload: serde_json::Value::Null,
        }
    }
}

/// A member of a session.
///
/// Live transport handles are deliberately not part of this struct; they
/// belong to the session manager's runtime state so that participants
/// serialize cleanly into snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// User id
    pub user_id: UserId,
    /// Paired agent, if any
    pub agent_id: Option<AgentId>,
    /// Display name
    pub display_name: String,
    /// Join time
    pub joined_at: DateTime<Utc>,
    /// Whether this participant hosts the session
    pub is_host: bool,
    /// Whether the participant presented a valid credential
    pub authenticated: bool,
    /// Capability strings, ordered for stable snapshots
    pub capabilities: BTreeSet<String>,
    /// Per-peer transport condition
    pub connection_state: ConnectionState,
}

/// A2A handshake lifecycle; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    Proposed,
    Accepted,
    Rejected,
    Completed,
}

impl HandshakeState {
    /// Whether `next` is a legal forward transition from `self`
    pub fn can_transition_to(&self, next: HandshakeState) -> bool {
        matches!(
            (self, next),
            (HandshakeState::Proposed, HandshakeState::Accepted)
                | (HandshakeState::Proposed, HandshakeState::Rejected)
                | (HandshakeState::Accepted, HandshakeState::Completed)
        )
    }
}

/// A negotiated agent-to-agent collaboration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRecord {
    /// Handshake id
    pub id: HandoffId,
    /// Initiating agent
    pub source_agent: AgentId,
    /// Target agent
    pub target_agent: AgentId,
    /// Protocol version offered
    pub protocol_version: String,
    /// Capabilities offered by the source
    pub capabilities: Vec<String>,
    /// Task under negotiation
    pub task_id: TaskId,
    /// Current state
    pub state: HandshakeState,
}

/// ICE server entry for the peer transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs
    pub urls: Vec<String>,
    /// Optional username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// Peer transport configuration handed to the (external) transport layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcConfig {
    /// ICE servers
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
    /// Optional transport policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<IceTransportPolicy>,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session id
    pub session_id: SessionId,
    /// Host user
    pub host_user_id: UserId,
    /// Participant cap, within `2..=50`
    pub max_participants: usize,
    /// Whether veto votes are available
    pub enable_vetoes: bool,
    /// Whether A2A handshakes are available
    pub enable_a2a: bool,
    /// Peer transport configuration
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingConfig,
}

impl SessionConfig {
    /// Configuration with defaults for everything but the identifiers
    pub fn new(session_id: impl Into<SessionId>, host_user_id: impl Into<UserId>) -> Self {
        Self {
            session_id: session_id.into(),
            host_user_id: host_user_id.into(),
            max_participants: 10,
            enable_vetoes: true,
            enable_a2a: true,
            webrtc: WebRtcConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }

    /// Schema-level validation
    pub fn validate(&self) -> ConclaveResult<()> {
        if self.session_id.is_empty() {
            return Err(ConclaveError::invalid_argument("sessionId must be non-empty"));
        }
        if self.host_user_id.is_empty() {
            return Err(ConclaveError::invalid_argument("hostUserId must be non-empty"));
        }
        if !(crate::MIN_PARTICIPANTS..=crate::MAX_PARTICIPANTS).contains(&self.max_participants) {
            return Err(ConclaveError::invalid_argument(format!(
                "maxParticipants must be within {}..={}, got {}",
                crate::MIN_PARTICIPANTS,
                crate::MAX_PARTICIPANTS,
                self.max_participants
            )));
        }
        Ok(())
    }
}

/// Key for the ordered-agent-pair handshake mapping
pub fn agent_pair_key(source: &str, target: &str) -> String {
    format!("{source}->{target}")
}

/// A collaborative session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Current host; always a member while the session is Active or Paused
    pub host_user_id: UserId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last observed activity; monotonically non-decreasing
    pub last_activity: DateTime<Utc>,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Configuration
    pub config: SessionConfig,
    /// Members keyed by user id
    pub participants: HashMap<UserId, Participant>,
    /// Active tasks keyed by task id
    pub active_tasks: HashMap<TaskId, Task>,
    /// Open veto votes, task id → voting session
    pub open_vetoes: HashMap<TaskId, VotingSessionId>,
    /// Open handshakes, ordered agent pair → handshake id
    pub open_handshakes: HashMap<String, HandoffId>,
}

impl Session {
    /// Create a session in `Initializing` state with no members
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: config.session_id.clone(),
            host_user_id: config.host_user_id.clone(),
            created_at: now,
            last_activity: now,
            status: SessionStatus::Initializing,
            config,
            participants: HashMap::new(),
            active_tasks: HashMap::new(),
            open_vetoes: HashMap::new(),
            open_handshakes: HashMap::new(),
        }
    }

    /// Bump `last_activity`, keeping it monotonic
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// The member that would inherit host-ship: earliest joined, ties broken
    /// by lexicographic user id
    pub fn successor_host(&self, excluding: &str) -> Option<&Participant> {
        self.participants
            .values()
            .filter(|p| p.user_id != excluding)
            .min_by(|a, b| {
                a.joined_at
                    .cmp(&b.joined_at)
                    .then_with(|| a.user_id.cmp(&b.user_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_enforces_bounds() {
        assert!(SessionConfig::new("s1", "u1").validate().is_ok());

        let mut config = SessionConfig::new("", "u1");
        assert!(config.validate().is_err());

        config = SessionConfig::new("s1", "u1");
        config.max_participants = 1;
        assert!(config.validate().is_err());
        config.max_participants = 51;
        assert!(config.validate().is_err());
        config.max_participants = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn successor_prefers_earliest_join_then_smallest_id() {
        let mut session = Session::new(SessionConfig::new("s1", "u1"));
        let base = Utc::now();
        for (user, offset_ms, host) in [("u1", 0, true), ("u3", 50, false), ("u2", 50, false)] {
            session.participants.insert(
                user.to_string(),
                Participant {
                    user_id: user.to_string(),
                    agent_id: None,
                    display_name: user.to_string(),
                    joined_at: base + chrono::Duration::milliseconds(offset_ms),
                    is_host: host,
                    authenticated: true,
                    capabilities: BTreeSet::new(),
                    connection_state: ConnectionState::Connected,
                },
            );
        }

        let successor = session.successor_host("u1").unwrap();
        assert_eq!(successor.user_id, "u2");
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut session = Session::new(SessionConfig::new("s1", "u1"));
        let now = session.last_activity;
        session.touch(now - chrono::Duration::seconds(10));
        assert_eq!(session.last_activity, now);
        let later = now + chrono::Duration::seconds(10);
        session.touch(later);
        assert_eq!(session.last_activity, later);
    }
}
