//! Pluggable decision seams
//!
//! Veto ballots and A2A answers come from collaborators behind traits so a
//! deployment can wire in real agent runtimes while tests inject
//! deterministic stubs. The shipped defaults are deterministic; randomness
//! never decides a vote.

use crate::types::{HandshakeRecord, Participant, Task};
use async_trait::async_trait;

/// A participant's ballot on a veto request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VetoBallot {
    /// Cancel the task
    Accept,
    /// Keep the task
    Reject,
    /// Cast no vote
    Abstain,
}

/// Produces a participant's ballot when a veto vote runs.
///
/// The reference semantics are "the participant's agent decides"; the
/// fabric only requires that the decision is a pure function of what it is
/// shown.
#[async_trait]
pub trait VetoPolicy: Send + Sync {
    /// Decide the ballot for one participant
    async fn decide(&self, participant: &Participant, task: &Task, reason: &str) -> VetoBallot;
}

/// Default policy: keep the task unless a human or agent explicitly says
/// otherwise.
#[derive(Debug, Default, Clone)]
pub struct LenientVetoPolicy;

#[async_trait]
impl VetoPolicy for LenientVetoPolicy {
    async fn decide(&self, _participant: &Participant, _task: &Task, _reason: &str) -> VetoBallot {
        VetoBallot::Reject
    }
}

/// The target agent's answer to a handshake proposal
#[derive(Debug, Clone, PartialEq)]
pub struct A2aReply {
    /// Whether the target agrees to collaborate
    pub accepted: bool,
    /// Capabilities the target brings
    pub capabilities: Vec<String>,
}

/// Forwards handshake proposals to the target agent's runtime.
#[async_trait]
pub trait A2aMediator: Send + Sync {
    /// Negotiate a proposed handshake with the target agent
    async fn negotiate(&self, handshake: &HandshakeRecord) -> conclave_core::ConclaveResult<A2aReply>;
}

/// Reference mediator: accepts every proposal and mirrors the offered
/// capabilities back.
#[derive(Debug, Default, Clone)]
pub struct LoopbackMediator;

#[async_trait]
impl A2aMediator for LoopbackMediator {
    async fn negotiate(&self, handshake: &HandshakeRecord) -> conclave_core::ConclaveResult<A2aReply> {
        Ok(A2aReply {
            accepted: true,
            capabilities: handshake.capabilities.clone(),
        })
    }
}
