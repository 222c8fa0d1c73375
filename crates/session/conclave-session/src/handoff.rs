//! Context handoff between agents
//!
//! A handoff packages a task's context and transfers it from one agent to
//! another with an explicit acknowledgement. Completion is idempotent: the
//! first acknowledgement decides the outcome and later ones see the cached
//! result.

use crate::types::TaskPriority;
use chrono::{DateTime, Utc};
use conclave_core::types::{AgentId, HandoffId, TaskId};
use conclave_core::{ConclaveError, ConclaveResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// What a handoff transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    /// Agent giving up the task
    pub source: AgentId,
    /// Agent meant to take it over
    pub target: AgentId,
    /// Task whose context moves
    pub task_id: TaskId,
    /// Opaque context blob
    pub context: serde_json::Value,
    /// Priority of the transfer
    pub priority: TaskPriority,
}

/// Lifecycle of a handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffState {
    /// Waiting for the target's acknowledgement
    Proposed,
    /// Acknowledged by the target
    Completed,
    /// Abandoned before acknowledgement
    Cancelled,
}

/// A tracked handoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHandoff {
    /// Handoff id
    pub id: HandoffId,
    /// The transfer being made
    pub request: HandoffRequest,
    /// Current state
    pub state: HandoffState,
    /// When the handoff was proposed
    pub created_at: DateTime<Utc>,
    /// When it reached a terminal state
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome returned to initiators and acceptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffOutcome {
    /// Handoff id
    pub handoff_id: HandoffId,
    /// Whether the operation took effect
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
}

/// Tracks handoffs and their acknowledgements.
pub struct HandoffManager {
    handoffs: DashMap<HandoffId, ContextHandoff>,
    completions: DashMap<HandoffId, HandoffOutcome>,
}

impl HandoffManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            handoffs: DashMap::new(),
            completions: DashMap::new(),
        }
    }

    /// Propose a handoff.
    pub fn initiate(&self, request: HandoffRequest) -> HandoffOutcome {
        if request.source == request.target {
            return HandoffOutcome {
                handoff_id: Uuid::nil(),
                success: false,
                error: Some("handoff source and target must differ".to_string()),
            };
        }
        if request.target.is_empty() {
            return HandoffOutcome {
                handoff_id: Uuid::nil(),
                success: false,
                error: Some("handoff target must be non-empty".to_string()),
            };
        }

        let id = Uuid::new_v4();
        self.handoffs.insert(
            id,
            ContextHandoff {
                id,
                request,
                state: HandoffState::Proposed,
                created_at: Utc::now(),
                resolved_at: None,
            },
        );
        debug!(handoff_id = %id, "handoff proposed");
        HandoffOutcome {
            handoff_id: id,
            success: true,
            error: None,
        }
    }

    /// Acknowledge a proposed handoff.
    ///
    /// Succeeds only when the acceptor is the proposed target; repeated
    /// acknowledgements return the cached outcome.
    pub fn complete(
        &self,
        handoff_id: HandoffId,
        accepting_agent_id: &str,
    ) -> ConclaveResult<HandoffOutcome> {
        if let Some(cached) = self.completions.get(&handoff_id) {
            return Ok(cached.clone());
        }

        let mut handoff = self.handoffs.get_mut(&handoff_id).ok_or_else(|| {
            ConclaveError::not_found(format!("handoff {handoff_id} does not exist"))
        })?;

        match handoff.state {
            HandoffState::Proposed => {}
            HandoffState::Cancelled => {
                return Err(ConclaveError::invalid_state(format!(
                    "handoff {handoff_id} was cancelled"
                )))
            }
            HandoffState::Completed => {
                // Completed but not yet cached; fall through to the cache
                // below once released
                drop(handoff);
                return self
                    .completions
                    .get(&handoff_id)
                    .map(|c| c.clone())
                    .ok_or_else(|| {
                        ConclaveError::internal(format!(
                            "handoff {handoff_id} completed without outcome"
                        ))
                    });
            }
        }

        if handoff.request.target != accepting_agent_id {
            return Err(ConclaveError::invalid_argument(format!(
                "agent {accepting_agent_id} is not the target of handoff {handoff_id}"
            )));
        }

        handoff.state = HandoffState::Completed;
        handoff.resolved_at = Some(Utc::now());
        drop(handoff);

        let outcome = HandoffOutcome {
            handoff_id,
            success: true,
            error: None,
        };
        self.completions.insert(handoff_id, outcome.clone());
        info!(handoff_id = %handoff_id, acceptor = accepting_agent_id, "handoff completed");
        Ok(outcome)
    }

    /// Abandon a handoff; only legal while it is still proposed.
    pub fn cancel(&self, handoff_id: HandoffId) -> ConclaveResult<()> {
        let mut handoff = self.handoffs.get_mut(&handoff_id).ok_or_else(|| {
            ConclaveError::not_found(format!("handoff {handoff_id} does not exist"))
        })?;

        if handoff.state != HandoffState::Proposed {
            return Err(ConclaveError::invalid_state(format!(
                "handoff {handoff_id} is not proposed"
            )));
        }

        handoff.state = HandoffState::Cancelled;
        handoff.resolved_at = Some(Utc::now());
        debug!(handoff_id = %handoff_id, "handoff cancelled");
        Ok(())
    }

    /// Look up a handoff
    pub fn get(&self, handoff_id: HandoffId) -> Option<ContextHandoff> {
        self.handoffs.get(&handoff_id).map(|h| h.clone())
    }
}

impl Default for HandoffManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HandoffRequest {
        HandoffRequest {
            source: "agent-a".into(),
            target: "agent-b".into(),
            task_id: "t1".into(),
            context: serde_json::json!({ "notes": "halfway done" }),
            priority: TaskPriority::Medium,
        }
    }

    #[test]
    fn initiate_then_complete() {
        let manager = HandoffManager::new();
        let outcome = manager.initiate(request());
        assert!(outcome.success);

        let completed = manager.complete(outcome.handoff_id, "agent-b").unwrap();
        assert!(completed.success);
        assert_eq!(
            manager.get(outcome.handoff_id).unwrap().state,
            HandoffState::Completed
        );
    }

    #[test]
    fn complete_by_wrong_agent_is_rejected() {
        let manager = HandoffManager::new();
        let outcome = manager.initiate(request());

        let err = manager.complete(outcome.handoff_id, "agent-c").unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::InvalidArgument);
        assert_eq!(
            manager.get(outcome.handoff_id).unwrap().state,
            HandoffState::Proposed
        );
    }

    #[test]
    fn repeated_complete_returns_cached_outcome() {
        let manager = HandoffManager::new();
        let outcome = manager.initiate(request());

        let first = manager.complete(outcome.handoff_id, "agent-b").unwrap();
        let second = manager.complete(outcome.handoff_id, "agent-b").unwrap();
        assert_eq!(first, second);
        // Even a wrong acceptor sees the cached outcome once completed
        let third = manager.complete(outcome.handoff_id, "agent-z").unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn cancel_only_from_proposed() {
        let manager = HandoffManager::new();
        let outcome = manager.initiate(request());

        manager.cancel(outcome.handoff_id).unwrap();
        let err = manager.cancel(outcome.handoff_id).unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::InvalidState);

        let err = manager.complete(outcome.handoff_id, "agent-b").unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::InvalidState);
    }

    #[test]
    fn self_handoff_is_rejected() {
        let manager = HandoffManager::new();
        let mut bad = request();
        bad.target = bad.source.clone();
        let outcome = manager.initiate(bad);
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("differ"));
    }
}
