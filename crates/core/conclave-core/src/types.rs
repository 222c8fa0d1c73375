//! Common identifier types for the Conclave fabric
//!
//! User-facing identifiers (sessions, users, agents, tasks, vote options)
//! are strings: the fabric orders them lexicographically to break ties, and
//! callers supply them. Engine-generated identifiers (voting sessions,
//! handoffs) are UUIDs.

use uuid::Uuid;

/// Identifier of a collaborative session
pub type SessionId = String;

/// Identifier of a user
pub type UserId = String;

/// Identifier of an agent paired with a participant
pub type AgentId = String;

/// Identifier of a task inside a session
pub type TaskId = String;

/// Identifier of a vote option
pub type OptionId = String;

/// Identifier of a voting session
pub type VotingSessionId = Uuid;

/// Identifier of a context handoff
pub type HandoffId = Uuid;

/// Milliseconds since the Unix epoch, the timestamp unit of every wire frame.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
