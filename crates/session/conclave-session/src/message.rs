//! Typed messages carried over the session data channels
//!
//! One variant per wire type, each with the envelope fields (`from`,
//! optional `to`, `sessionId`, `timestamp`) and its exact typed payload.
//! Dispatch in the session manager is a total match over the tag, so there
//! is no "unknown type" path.

use crate::handoff::HandoffRequest;
use crate::types::{HandshakeRecord, SessionStatus, Task};
use conclave_core::types::{now_millis, HandoffId, SessionId, TaskId, UserId, VotingSessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mutation applied to a session's task map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TaskAction {
    /// A task was added
    Added { task: Task },
    /// A task was replaced
    Updated { task: Task },
    /// A task was removed without completing
    Removed { task_id: TaskId },
    /// A task finished
    Completed { task_id: TaskId },
}

/// Payload of a veto announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VetoNotice {
    /// Task under dispute
    pub task_id: TaskId,
    /// Why the requester wants it cancelled
    pub reason: String,
    /// The vote deciding it
    pub voting_session_id: VotingSessionId,
}

/// State synchronization payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StateSync {
    /// Authoritative replacement of session state
    Full {
        status: SessionStatus,
        host_user_id: UserId,
        tasks: HashMap<TaskId, Task>,
        last_activity: i64,
    },
    /// Task-map deltas merged with last-writer-wins
    Incremental {
        upserts: Vec<Task>,
        removals: Vec<TaskId>,
        last_activity: i64,
    },
}

/// Agent-to-agent negotiation frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum A2aFrame {
    /// A handshake proposal
    Request { handshake: HandshakeRecord },
    /// The target agent's answer
    Response {
        handshake_id: HandoffId,
        accepted: bool,
        capabilities: Vec<String>,
    },
    /// Mid-negotiation note
    Negotiation {
        handshake_id: HandoffId,
        note: String,
    },
}

/// Context handoff control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HandoffAction {
    /// Start a handoff
    Initiate { request: HandoffRequest },
    /// Accept a proposed handoff
    Complete {
        handoff_id: HandoffId,
        accepting_agent_id: String,
    },
    /// Abandon a proposed handoff
    Cancel { handoff_id: HandoffId },
}

/// A message on a session's data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionMessage {
    /// Task map mutation
    Task {
        from: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: TaskAction,
        timestamp: i64,
    },
    /// A participant requests cancellation of a task
    Veto {
        from: UserId,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: VetoNotice,
        timestamp: i64,
    },
    /// Agent-to-agent negotiation
    A2A {
        from: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: A2aFrame,
        timestamp: i64,
    },
    /// Full or incremental state sync
    State {
        from: UserId,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: StateSync,
        timestamp: i64,
    },
    /// Context handoff control
    Handoff {
        from: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: HandoffAction,
        timestamp: i64,
    },
    /// Liveness signal
    Heartbeat {
        from: UserId,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        timestamp: i64,
    },
}

impl SessionMessage {
    /// Sender of this message
    pub fn from(&self) -> &str {
        match self {
            Self::Task { from, .. }
            | Self::Veto { from, .. }
            | Self::A2A { from, .. }
            | Self::State { from, .. }
            | Self::Handoff { from, .. }
            | Self::Heartbeat { from, .. } => from,
        }
    }

    /// Session this message belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Self::Task { session_id, .. }
            | Self::Veto { session_id, .. }
            | Self::A2A { session_id, .. }
            | Self::State { session_id, .. }
            | Self::Handoff { session_id, .. }
            | Self::Heartbeat { session_id, .. } => session_id,
        }
    }

    /// Message timestamp in milliseconds since the epoch
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Task { timestamp, .. }
            | Self::Veto { timestamp, .. }
            | Self::A2A { timestamp, .. }
            | Self::State { timestamp, .. }
            | Self::Handoff { timestamp, .. }
            | Self::Heartbeat { timestamp, .. } => *timestamp,
        }
    }

    /// Task mutation message
    pub fn task(
        from: impl Into<UserId>,
        session_id: impl Into<SessionId>,
        payload: TaskAction,
    ) -> Self {
        Self::Task {
            from: from.into(),
            to: None,
            session_id: session_id.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    /// Heartbeat message
    pub fn heartbeat(from: impl Into<UserId>, session_id: impl Into<SessionId>) -> Self {
        Self::Heartbeat {
            from: from.into(),
            session_id: session_id.into(),
            timestamp: now_millis(),
        }
    }
}
