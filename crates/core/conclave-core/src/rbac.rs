//! Capability guard consulted at every privileged boundary
//!
//! The guard is the sole authority on whether a user may perform an action;
//! callers surface denials as `PermissionDenied` carrying the guard's
//! reason verbatim and never bypass it.

use crate::error::ConclaveResult;
use crate::types::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Actions checked by the fabric core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceAction {
    /// Create a new session
    SessionCreate,
    /// Join an existing session
    SessionJoin,
    /// Leave a session
    SessionLeave,
    /// Request a veto vote on a task
    ConsensusVeto,
}

impl ResourceAction {
    /// Canonical dotted action name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreate => "session.create",
            Self::SessionJoin => "session.join",
            Self::SessionLeave => "session.leave",
            Self::ConsensusVeto => "consensus.veto",
        }
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guard check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    /// Whether the action is allowed
    pub allowed: bool,
    /// Human-readable reason, surfaced verbatim on denial
    pub reason: String,
}

impl AccessDecision {
    /// An allowing decision
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    /// A denying decision
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Access-control guard.
///
/// `resource_id`/`resource_type` identify the target (e.g. a session id and
/// `"session"`); implementations may ignore them for coarse-grained
/// policies.
#[async_trait]
pub trait RbacGuard: Send + Sync {
    /// Decide whether `user_id` may perform `action` on the resource
    async fn check(
        &self,
        user_id: &str,
        resource_id: &str,
        resource_type: &str,
        action: ResourceAction,
    ) -> ConclaveResult<AccessDecision>;
}

/// Guard that allows everything. Development and test use only.
#[derive(Debug, Default, Clone)]
pub struct AllowAllGuard;

#[async_trait]
impl RbacGuard for AllowAllGuard {
    async fn check(
        &self,
        user_id: &str,
        _resource_id: &str,
        _resource_type: &str,
        action: ResourceAction,
    ) -> ConclaveResult<AccessDecision> {
        Ok(AccessDecision::allow(format!(
            "user {user_id} allowed {action} by permissive policy"
        )))
    }
}

/// Guard backed by an explicit user → action grant table, deny by default.
#[derive(Debug, Default)]
pub struct StaticRbacGuard {
    grants: DashMap<UserId, HashSet<ResourceAction>>,
}

impl StaticRbacGuard {
    /// Create an empty guard denying every action
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant an action to a user
    pub fn grant(&self, user_id: impl Into<UserId>, action: ResourceAction) {
        self.grants.entry(user_id.into()).or_default().insert(action);
    }

    /// Revoke a previously granted action
    pub fn revoke(&self, user_id: &str, action: ResourceAction) {
        if let Some(mut actions) = self.grants.get_mut(user_id) {
            actions.remove(&action);
        }
    }

    /// Grant all core actions to a user
    pub fn grant_all(&self, user_id: impl Into<UserId>) {
        let user_id = user_id.into();
        for action in [
            ResourceAction::SessionCreate,
            ResourceAction::SessionJoin,
            ResourceAction::SessionLeave,
            ResourceAction::ConsensusVeto,
        ] {
            self.grant(user_id.clone(), action);
        }
    }
}

#[async_trait]
impl RbacGuard for StaticRbacGuard {
    async fn check(
        &self,
        user_id: &str,
        resource_id: &str,
        resource_type: &str,
        action: ResourceAction,
    ) -> ConclaveResult<AccessDecision> {
        let allowed = self
            .grants
            .get(user_id)
            .map(|actions| actions.contains(&action))
            .unwrap_or(false);

        if allowed {
            Ok(AccessDecision::allow(format!(
                "user {user_id} granted {action}"
            )))
        } else {
            Ok(AccessDecision::deny(format!(
                "user {user_id} is not permitted to {action} on {resource_type} {resource_id}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_guard_denies_by_default() {
        let guard = StaticRbacGuard::new();
        let decision = guard
            .check("u1", "s1", "session", ResourceAction::SessionCreate)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.contains("u1"));
    }

    #[tokio::test]
    async fn grant_and_revoke() {
        let guard = StaticRbacGuard::new();
        guard.grant("u1", ResourceAction::SessionJoin);

        let decision = guard
            .check("u1", "s1", "session", ResourceAction::SessionJoin)
            .await
            .unwrap();
        assert!(decision.allowed);

        guard.revoke("u1", ResourceAction::SessionJoin);
        let decision = guard
            .check("u1", "s1", "session", ResourceAction::SessionJoin)
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[test]
    fn action_names_are_dotted() {
        assert_eq!(ResourceAction::SessionCreate.as_str(), "session.create");
        assert_eq!(ResourceAction::ConsensusVeto.as_str(), "consensus.veto");
    }
}
