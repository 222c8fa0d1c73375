//! Swarm delegate integration tests

use async_trait::async_trait;
use conclave_consensus::ConsensusEngine;
use conclave_core::{ConclaveError, ConclaveResult, ErrorKind};
use conclave_session::{
    AgentProfile, DelegateConfig, DelegationMethod, HandoffManager, LocalExecutor, SwarmDelegate,
    Task, TaskPriority,
};
use std::sync::Arc;
use std::time::Duration;

struct OkExecutor;

#[async_trait]
impl LocalExecutor for OkExecutor {
    async fn execute(
        &self,
        agent: &AgentProfile,
        task: &Task,
        _context: &serde_json::Value,
    ) -> ConclaveResult<serde_json::Value> {
        Ok(serde_json::json!({ "agent": agent.agent_id, "task": task.id }))
    }
}

struct FailingExecutor;

#[async_trait]
impl LocalExecutor for FailingExecutor {
    async fn execute(
        &self,
        _agent: &AgentProfile,
        _task: &Task,
        _context: &serde_json::Value,
    ) -> ConclaveResult<serde_json::Value> {
        Err(ConclaveError::internal("local runtime rejected the task"))
    }
}

struct SlowExecutor(Duration);

#[async_trait]
impl LocalExecutor for SlowExecutor {
    async fn execute(
        &self,
        agent: &AgentProfile,
        _task: &Task,
        _context: &serde_json::Value,
    ) -> ConclaveResult<serde_json::Value> {
        tokio::time::sleep(self.0).await;
        Ok(serde_json::json!({ "agent": agent.agent_id }))
    }
}

fn delegate(config: DelegateConfig) -> SwarmDelegate {
    SwarmDelegate::new(
        config,
        Arc::new(ConsensusEngine::new()),
        Arc::new(HandoffManager::new()),
    )
}

fn profile(id: &str, capabilities: &[&str], is_local: bool) -> AgentProfile {
    AgentProfile {
        agent_id: id.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        is_local,
    }
}

#[tokio::test]
async fn weighted_consensus_delegation_prefers_capability_match() {
    // Capability weights: A=2 (matches "code"), B=1, C=2. The tie between
    // A and C resolves to the lexicographically smaller id without
    // consensus.
    let delegate = delegate(DelegateConfig {
        enable_local_inference: false,
        ..DelegateConfig::default()
    });
    delegate.register_agent(profile("A", &["code"], false));
    delegate.register_agent(profile("B", &[], false));
    delegate.register_agent(profile("C", &["code", "test"], false));

    let task = Task::new("t1", "write code", TaskPriority::High);
    let result = delegate
        .delegate_task(&task, serde_json::json!({}), None)
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.method, Some(DelegationMethod::Consensus));
    assert_eq!(result.assigned_agent.as_deref(), Some("A"));

    let consensus = result.consensus.unwrap();
    assert!(!consensus.consensus_reached);
    assert_eq!(consensus.tally["A"], 2.0);
    assert_eq!(consensus.tally["B"], 1.0);
    assert_eq!(consensus.tally["C"], 2.0);

    let handoff = result.handoff.unwrap();
    assert!(handoff.success);
}

#[tokio::test]
async fn local_fast_path_measures_latency() {
    let delegate =
        delegate(DelegateConfig::default()).with_executor(Arc::new(OkExecutor));
    delegate.register_agent(profile("local-1", &["code"], true));

    let task = Task::new("t1", "write code", TaskPriority::Low);
    let result = delegate
        .delegate_task(&task, serde_json::json!({ "cwd": "/tmp" }), None)
        .await;

    assert!(result.success);
    assert_eq!(result.method, Some(DelegationMethod::Local));
    assert_eq!(result.assigned_agent.as_deref(), Some("local-1"));
    assert!(result.latency_within_target);
    assert_eq!(result.output.unwrap()["agent"], "local-1");
    assert!(result.consensus.is_none());
}

#[tokio::test]
async fn local_failure_falls_back_to_consensus() {
    let delegate =
        delegate(DelegateConfig::default()).with_executor(Arc::new(FailingExecutor));
    delegate.register_agent(profile("local-1", &[], true));
    delegate.register_agent(profile("remote-1", &["code"], false));

    let task = Task::new("t1", "write code", TaskPriority::Medium);
    let result = delegate
        .delegate_task(&task, serde_json::json!({}), None)
        .await;

    assert!(result.success);
    assert_eq!(result.method, Some(DelegationMethod::Consensus));
    // remote-1 matches "code" and outweighs the failed local agent
    assert_eq!(result.assigned_agent.as_deref(), Some("remote-1"));
}

#[tokio::test]
async fn deadline_expiry_moves_on_to_consensus() {
    let config = DelegateConfig {
        latency_target_ms: 50,
        ..DelegateConfig::default()
    };
    let delegate = delegate(config).with_executor(Arc::new(SlowExecutor(
        Duration::from_millis(500),
    )));
    delegate.register_agent(profile("local-1", &[], true));
    delegate.register_agent(profile("remote-1", &["code"], false));

    let task = Task::new("t1", "write code", TaskPriority::Medium);
    let result = delegate
        .delegate_task(&task, serde_json::json!({}), Some(Duration::from_secs(2)))
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.method, Some(DelegationMethod::Consensus));
}

#[tokio::test]
async fn deadline_expiry_without_fallback_is_a_timeout() {
    let config = DelegateConfig {
        latency_target_ms: 5_000,
        enable_consensus_voting: false,
        ..DelegateConfig::default()
    };
    let delegate = delegate(config).with_executor(Arc::new(SlowExecutor(
        Duration::from_millis(500),
    )));
    delegate.register_agent(profile("local-1", &[], true));

    let task = Task::new("t1", "slow work", TaskPriority::Low);
    let result = delegate
        .delegate_task(&task, serde_json::json!({}), Some(Duration::from_millis(50)))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn concurrency_cap_is_enforced() {
    let config = DelegateConfig {
        max_concurrent_delegations: 1,
        enable_consensus_voting: false,
        ..DelegateConfig::default()
    };
    let delegate = Arc::new(
        delegate(config).with_executor(Arc::new(SlowExecutor(Duration::from_millis(300)))),
    );
    delegate.register_agent(profile("local-1", &[], true));

    let first = {
        let delegate = delegate.clone();
        tokio::spawn(async move {
            let task = Task::new("t1", "slow work", TaskPriority::Low);
            delegate.delegate_task(&task, serde_json::json!({}), None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = Task::new("t2", "quick ask", TaskPriority::Low);
    let second = delegate.delegate_task(&task, serde_json::json!({}), None).await;
    assert!(!second.success);
    assert_eq!(second.error_kind, Some(ErrorKind::ResourceExhausted));

    let first = first.await.unwrap();
    assert!(first.success);
    assert_eq!(first.method, Some(DelegationMethod::Local));
}

#[tokio::test]
async fn no_agents_means_a_structured_failure() {
    let delegate = delegate(DelegateConfig {
        enable_local_inference: false,
        ..DelegateConfig::default()
    });

    let task = Task::new("t1", "anything", TaskPriority::Low);
    let result = delegate
        .delegate_task(&task, serde_json::json!({}), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
}
