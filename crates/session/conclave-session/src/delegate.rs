//! Local-first task dispatch with consensus fallback
//!
//! The delegate tries a registered local agent first and measures the
//! attempt against the latency target; when the local path is unavailable
//! or fails, the registered agents vote for themselves weighted by how well
//! their capabilities match the task, and the winner receives a context
//! handoff. The public entry point never returns an error: every failure is
//! folded into the structured result.

use crate::handoff::{HandoffManager, HandoffOutcome, HandoffRequest};
use crate::types::Task;
use async_trait::async_trait;
use conclave_consensus::{ConsensusEngine, ConsensusResult, VoteOption, VoterProfile, VotingAlgorithm};
use conclave_core::types::{AgentId, TaskId};
use conclave_core::{ConclaveError, ConclaveResult, ErrorKind};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source id used for handoffs the delegate itself initiates
const DELEGATE_AGENT_ID: &str = "swarm-delegate";

/// An agent the delegate can dispatch to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Agent id
    pub agent_id: AgentId,
    /// Capability strings matched against task descriptions
    pub capabilities: Vec<String>,
    /// Whether the agent runs in-process (fast path)
    pub is_local: bool,
}

/// Delegate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateConfig {
    /// Try a local agent before voting
    pub enable_local_inference: bool,
    /// Latency budget the local path is measured against, in milliseconds
    pub latency_target_ms: u64,
    /// In-flight delegation cap
    pub max_concurrent_delegations: usize,
    /// Fall back to a consensus vote when the local path fails
    pub enable_consensus_voting: bool,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            enable_local_inference: true,
            latency_target_ms: 2000,
            max_concurrent_delegations: 10,
            enable_consensus_voting: true,
        }
    }
}

/// How a delegation was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationMethod {
    /// Executed by a local agent
    Local,
    /// Assigned by a weighted vote
    Consensus,
}

/// Structured outcome of a delegation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResult {
    /// Task that was delegated
    pub task_id: TaskId,
    /// Whether an agent ended up with the task
    pub success: bool,
    /// The agent the task went to
    pub assigned_agent: Option<AgentId>,
    /// Path that produced the assignment
    pub method: Option<DelegationMethod>,
    /// Output of a successful local execution
    pub output: Option<serde_json::Value>,
    /// Wall-clock duration of the whole attempt
    pub latency_ms: u64,
    /// Whether the attempt stayed within the latency target
    pub latency_within_target: bool,
    /// Vote outcome when the consensus path ran
    pub consensus: Option<ConsensusResult>,
    /// Context handoff to the vote winner
    pub handoff: Option<HandoffOutcome>,
    /// Error classification for failures
    pub error_kind: Option<ErrorKind>,
    /// Failure detail
    pub error: Option<String>,
}

/// External runtime that executes a task on a local agent.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Run the task; an `Err` or negative acknowledgement falls through to
    /// the consensus path
    async fn execute(
        &self,
        agent: &AgentProfile,
        task: &Task,
        context: &serde_json::Value,
    ) -> ConclaveResult<serde_json::Value>;
}

/// Scores how well a capability set fits a task description.
pub trait CapabilityScorer: Send + Sync {
    /// Ballot weight for an agent with `capabilities` on this description
    fn score(&self, capabilities: &[String], description: &str) -> f64;
}

/// Default scorer: any capability appearing (case-insensitively) in the
/// description doubles the agent's ballot weight.
#[derive(Debug, Default, Clone)]
pub struct SubstringScorer;

impl CapabilityScorer for SubstringScorer {
    fn score(&self, capabilities: &[String], description: &str) -> f64 {
        let description = description.to_lowercase();
        let matched = capabilities
            .iter()
            .any(|cap| !cap.is_empty() && description.contains(&cap.to_lowercase()));
        if matched {
            2.0
        } else {
            1.0
        }
    }
}

/// The swarm delegate.
pub struct SwarmDelegate {
    config: DelegateConfig,
    agents: DashMap<AgentId, AgentProfile>,
    executor: Option<Arc<dyn LocalExecutor>>,
    scorer: Arc<dyn CapabilityScorer>,
    consensus: Arc<ConsensusEngine>,
    handoffs: Arc<HandoffManager>,
    permits: Arc<Semaphore>,
}

impl SwarmDelegate {
    /// Create a delegate sharing the given voting engine and handoff
    /// manager
    pub fn new(
        config: DelegateConfig,
        consensus: Arc<ConsensusEngine>,
        handoffs: Arc<HandoffManager>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_delegations.max(1)));
        Self {
            config,
            agents: DashMap::new(),
            executor: None,
            scorer: Arc::new(SubstringScorer),
            consensus,
            handoffs,
            permits,
        }
    }

    /// Attach the local execution runtime
    pub fn with_executor(mut self, executor: Arc<dyn LocalExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the capability scorer
    pub fn with_scorer(mut self, scorer: Arc<dyn CapabilityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Register (or replace) an agent
    pub fn register_agent(&self, profile: AgentProfile) {
        debug!(agent_id = %profile.agent_id, local = profile.is_local, "agent registered");
        self.agents.insert(profile.agent_id.clone(), profile);
    }

    /// Remove an agent
    pub fn unregister_agent(&self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    /// Registered agents, ordered by id
    pub fn agents(&self) -> Vec<AgentProfile> {
        let mut agents: Vec<AgentProfile> = self.agents.iter().map(|a| a.clone()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Dispatch a task.
    ///
    /// Never returns an error: failures are structured into the result.
    /// `deadline` bounds the whole call; an expired local attempt falls
    /// through to consensus only if time remains.
    pub async fn delegate_task(
        &self,
        task: &Task,
        context: serde_json::Value,
        deadline: Option<Duration>,
    ) -> DelegationResult {
        let started = Instant::now();

        let _permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                return self.failure(
                    task,
                    started,
                    ConclaveError::resource_exhausted(format!(
                        "delegation cap of {} reached",
                        self.config.max_concurrent_delegations
                    )),
                );
            }
        };

        let deadline_at = deadline.map(|d| started + d);

        match self.try_delegate(task, context, started, deadline_at).await {
            Ok(result) => result,
            Err(e) => self.failure(task, started, e),
        }
    }

    async fn try_delegate(
        &self,
        task: &Task,
        context: serde_json::Value,
        started: Instant,
        deadline_at: Option<Instant>,
    ) -> ConclaveResult<DelegationResult> {
        // Fast path: hand the task to the best-matching local agent.
        if self.config.enable_local_inference {
            if let (Some(executor), Some(agent)) = (&self.executor, self.best_local_agent(task)) {
                let attempt = executor.execute(&agent, task, &context);
                // Under a per-call deadline the local attempt is additionally
                // bounded by the latency target, leaving room for the
                // consensus fallback.
                let outcome = match remaining(deadline_at) {
                    Some(Duration::ZERO) => Err(ConclaveError::timeout(
                        "delegation deadline expired before the local attempt",
                    )),
                    Some(budget) => {
                        let budget = budget.min(Duration::from_millis(self.config.latency_target_ms));
                        match tokio::time::timeout(budget, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(ConclaveError::timeout(format!(
                                "local attempt on {} exceeded its budget",
                                agent.agent_id
                            ))),
                        }
                    }
                    None => attempt.await,
                };

                match outcome {
                    Ok(output) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        info!(
                            task_id = %task.id,
                            agent_id = %agent.agent_id,
                            latency_ms,
                            "task delegated locally"
                        );
                        return Ok(DelegationResult {
                            task_id: task.id.clone(),
                            success: true,
                            assigned_agent: Some(agent.agent_id.clone()),
                            method: Some(DelegationMethod::Local),
                            output: Some(output),
                            latency_ms,
                            latency_within_target: latency_ms <= self.config.latency_target_ms,
                            consensus: None,
                            handoff: None,
                            error_kind: None,
                            error: None,
                        });
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, "local delegation failed, falling back: {e}");
                        if !self.config.enable_consensus_voting {
                            return Err(e);
                        }
                    }
                }
            }
        }

        if !self.config.enable_consensus_voting {
            return Err(ConclaveError::unavailable(
                "no local agent available and consensus voting is disabled",
            ));
        }
        if matches!(remaining(deadline_at), Some(Duration::ZERO)) {
            return Err(ConclaveError::timeout(
                "delegation deadline expired before the consensus fallback",
            ));
        }

        self.delegate_by_consensus(task, context, started).await
    }

    /// Slow path: registered agents vote for themselves, weighted by
    /// capability fit; the winner gets a context handoff.
    async fn delegate_by_consensus(
        &self,
        task: &Task,
        context: serde_json::Value,
        started: Instant,
    ) -> ConclaveResult<DelegationResult> {
        let agents = self.agents();
        if agents.is_empty() {
            return Err(ConclaveError::not_found("no agents registered for delegation"));
        }

        let options: Vec<VoteOption> = agents
            .iter()
            .map(|a| {
                VoteOption::new(
                    a.agent_id.clone(),
                    a.agent_id.clone(),
                    serde_json::json!(a.agent_id),
                )
            })
            .collect();
        let voting_session = self
            .consensus
            .create_session(format!("delegate: {}", task.description), options, None)
            .await?;

        for agent in &agents {
            let weight = self.scorer.score(&agent.capabilities, &task.description);
            self.consensus
                .register_voter(VoterProfile::weighted(agent.agent_id.clone(), weight))
                .await?;
            self.consensus
                .cast_vote(voting_session, &agent.agent_id, &agent.agent_id, None)
                .await?;
        }

        let outcome = self
            .consensus
            .close_session(voting_session, VotingAlgorithm::WeightedMajority, None)
            .await?;

        let winner = outcome
            .winning_option
            .as_ref()
            .map(|o| o.id.clone())
            .ok_or_else(|| ConclaveError::unavailable("no agent won the delegation vote"))?;

        let handoff = self.handoffs.initiate(HandoffRequest {
            source: DELEGATE_AGENT_ID.to_string(),
            target: winner.clone(),
            task_id: task.id.clone(),
            context,
            priority: task.priority,
        });
        if !handoff.success {
            return Err(ConclaveError::internal(
                handoff
                    .error
                    .clone()
                    .unwrap_or_else(|| "handoff initiation failed".to_string()),
            ));
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(task_id = %task.id, winner = %winner, latency_ms, "task delegated by consensus");
        Ok(DelegationResult {
            task_id: task.id.clone(),
            success: true,
            assigned_agent: Some(winner),
            method: Some(DelegationMethod::Consensus),
            output: None,
            latency_ms,
            latency_within_target: latency_ms <= self.config.latency_target_ms,
            consensus: Some(outcome),
            handoff: Some(handoff),
            error_kind: None,
            error: None,
        })
    }

    /// Highest-scoring local agent; ties go to the smallest agent id
    fn best_local_agent(&self, task: &Task) -> Option<AgentProfile> {
        self.agents()
            .into_iter()
            .filter(|a| a.is_local)
            .map(|a| (self.scorer.score(&a.capabilities, &task.description), a))
            .max_by(|(score_a, a), (score_b, b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.agent_id.cmp(&a.agent_id))
            })
            .map(|(_, agent)| agent)
    }

    fn failure(&self, task: &Task, started: Instant, error: ConclaveError) -> DelegationResult {
        let latency_ms = started.elapsed().as_millis() as u64;
        DelegationResult {
            task_id: task.id.clone(),
            success: false,
            assigned_agent: None,
            method: None,
            output: None,
            latency_ms,
            latency_within_target: latency_ms <= self.config.latency_target_ms,
            consensus: None,
            handoff: None,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }
}

fn remaining(deadline_at: Option<Instant>) -> Option<Duration> {
    deadline_at.map(|at| at.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_scorer_is_case_insensitive() {
        let scorer = SubstringScorer;
        assert_eq!(scorer.score(&["Code".to_string()], "write code"), 2.0);
        assert_eq!(scorer.score(&["test".to_string()], "write code"), 1.0);
        assert_eq!(scorer.score(&[], "write code"), 1.0);
    }

    #[test]
    fn best_local_agent_breaks_ties_on_smallest_id() {
        let delegate = SwarmDelegate::new(
            DelegateConfig::default(),
            Arc::new(ConsensusEngine::new()),
            Arc::new(HandoffManager::new()),
        );
        for id in ["b-agent", "a-agent"] {
            delegate.register_agent(AgentProfile {
                agent_id: id.to_string(),
                capabilities: vec![],
                is_local: true,
            });
        }
        let task = Task::new("t1", "anything", crate::types::TaskPriority::Low);
        assert_eq!(
            delegate.best_local_agent(&task).unwrap().agent_id,
            "a-agent"
        );
    }
}
