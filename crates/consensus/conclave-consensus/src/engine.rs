//! Voting engine
//!
//! Sessions and results live in concurrent maps; closing a session is the
//! only compound mutation and happens under the session's map entry, so a
//! stored [`ConsensusResult`] never changes once written.

use crate::types::{
    derive_weight, ConsensusResult, Vote, VoteOption, VoterProfile, VotingAlgorithm,
    VotingSession, VotingStatus,
};
use crate::DEFAULT_THRESHOLD;
use chrono::Utc;
use conclave_core::types::VotingSessionId;
use conclave_core::{ConclaveError, ConclaveResult};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters for engine activity
#[derive(Debug, Clone, Default)]
pub struct ConsensusStats {
    /// Voting sessions opened
    pub sessions_opened: u64,
    /// Voting sessions closed
    pub sessions_closed: u64,
    /// Ballots recorded
    pub votes_cast: u64,
    /// Ballots rejected (duplicate voter, unknown option, closed session)
    pub votes_rejected: u64,
    /// Closes that reached consensus
    pub consensus_reached: u64,
}

/// Registered voter with the weight derived at registration time
#[derive(Debug, Clone)]
struct RegisteredVoter {
    profile: VoterProfile,
    weight: f64,
}

/// The voting engine.
///
/// Voters are registered engine-wide; each voting session draws its ballots
/// from that registry. Sessions close exactly once — closing a session
/// again returns the stored result unchanged.
pub struct ConsensusEngine {
    /// Open and closed voting sessions
    sessions: DashMap<VotingSessionId, VotingSession>,
    /// Registered voters keyed by id
    voters: DashMap<String, RegisteredVoter>,
    /// Results of closed sessions
    results: DashMap<VotingSessionId, ConsensusResult>,
    /// Activity counters
    stats: RwLock<ConsensusStats>,
}

impl ConsensusEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            voters: DashMap::new(),
            results: DashMap::new(),
            stats: RwLock::new(ConsensusStats::default()),
        }
    }

    /// Open a voting session over `options`.
    ///
    /// Options must be non-empty with unique ids.
    pub async fn create_session(
        &self,
        topic: impl Into<String>,
        options: Vec<VoteOption>,
        quorum: Option<usize>,
    ) -> ConclaveResult<VotingSessionId> {
        if options.is_empty() {
            return Err(ConclaveError::invalid_argument(
                "voting session needs at least one option",
            ));
        }
        let mut seen = HashSet::new();
        for option in &options {
            if !seen.insert(option.id.as_str()) {
                return Err(ConclaveError::invalid_argument(format!(
                    "duplicate option id {}",
                    option.id
                )));
            }
        }

        let id = Uuid::new_v4();
        let topic = topic.into();
        let session = VotingSession {
            id,
            topic: topic.clone(),
            options,
            votes: HashMap::new(),
            status: VotingStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
            quorum,
        };
        self.sessions.insert(id, session);
        self.stats.write().await.sessions_opened += 1;

        debug!(session_id = %id, topic = %topic, "voting session opened");
        Ok(id)
    }

    /// Register a voter, deriving its ballot weight from the profile.
    ///
    /// Re-registering replaces the previous profile. Returns the derived
    /// weight.
    pub async fn register_voter(&self, profile: VoterProfile) -> ConclaveResult<f64> {
        let weight = derive_weight(&profile);
        debug!(voter_id = %profile.id, weight, "voter registered");
        self.voters
            .insert(profile.id.clone(), RegisteredVoter { profile, weight });
        Ok(weight)
    }

    /// Record one ballot for a registered voter.
    pub async fn cast_vote(
        &self,
        session_id: VotingSessionId,
        voter_id: &str,
        option_id: &str,
        rationale: Option<String>,
    ) -> ConclaveResult<()> {
        let weight = self
            .voters
            .get(voter_id)
            .map(|v| v.weight)
            .ok_or_else(|| {
                ConclaveError::not_found(format!("voter {voter_id} is not registered"))
            })?;

        // All map access happens before the first await so no shard guard
        // is held across a suspension point.
        let recorded: ConclaveResult<()> = {
            let mut session = self.sessions.get_mut(&session_id).ok_or_else(|| {
                ConclaveError::not_found(format!("voting session {session_id} does not exist"))
            })?;

            if session.status != VotingStatus::Open {
                Err(ConclaveError::invalid_state(format!(
                    "voting session {session_id} is not open"
                )))
            } else if !session.has_option(option_id) {
                Err(ConclaveError::invalid_argument(format!(
                    "option {option_id} is not part of voting session {session_id}"
                )))
            } else if session.votes.contains_key(voter_id) {
                Err(ConclaveError::conflict(format!(
                    "voter {voter_id} already voted in session {session_id}"
                )))
            } else {
                session.votes.insert(
                    voter_id.to_string(),
                    Vote {
                        voter_id: voter_id.to_string(),
                        option_id: option_id.to_string(),
                        weight,
                        cast_at: Utc::now(),
                        rationale,
                    },
                );
                Ok(())
            }
        };

        let mut stats = self.stats.write().await;
        match &recorded {
            Ok(()) => stats.votes_cast += 1,
            Err(_) => stats.votes_rejected += 1,
        }
        drop(stats);

        if recorded.is_ok() {
            debug!(session_id = %session_id, voter_id, option_id, "ballot recorded");
        }
        recorded
    }

    /// Close a session and compute its result under `algorithm`.
    ///
    /// Idempotent: closing a closed session returns the stored result.
    /// `threshold` defaults to [`DEFAULT_THRESHOLD`] and is ignored by the
    /// majority algorithms.
    pub async fn close_session(
        &self,
        session_id: VotingSessionId,
        algorithm: VotingAlgorithm,
        threshold: Option<f64>,
    ) -> ConclaveResult<ConsensusResult> {
        if let Some(result) = self.results.get(&session_id) {
            return Ok(result.clone());
        }

        let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
        let result = {
            let mut session = self.sessions.get_mut(&session_id).ok_or_else(|| {
                ConclaveError::not_found(format!("voting session {session_id} does not exist"))
            })?;

            if session.status != VotingStatus::Open {
                // Closed concurrently between the result lookup and here
                drop(session);
                return self
                    .results
                    .get(&session_id)
                    .map(|r| r.clone())
                    .ok_or_else(|| {
                        ConclaveError::invalid_state(format!(
                            "voting session {session_id} closed without a stored result"
                        ))
                    });
            }

            let result = self.compute_result(&session, algorithm, threshold);
            session.status = if result.consensus_reached {
                VotingStatus::Resolved
            } else {
                VotingStatus::Closed
            };
            session.closed_at = Some(Utc::now());
            result
        };

        self.results.insert(session_id, result.clone());

        let mut stats = self.stats.write().await;
        stats.sessions_closed += 1;
        if result.consensus_reached {
            stats.consensus_reached += 1;
        }
        drop(stats);

        info!(
            session_id = %session_id,
            method = %algorithm,
            reached = result.consensus_reached,
            winner = result.winning_option.as_ref().map(|o| o.id.as_str()).unwrap_or("none"),
            "voting session closed"
        );
        Ok(result)
    }

    /// Close a session after `wait`, even if nobody voted.
    ///
    /// A deadline close on a voteless session yields a clean result with
    /// `consensus_reached = false`. Races with a regular close are benign
    /// because closing is idempotent.
    pub async fn close_after(
        &self,
        session_id: VotingSessionId,
        algorithm: VotingAlgorithm,
        threshold: Option<f64>,
        wait: Duration,
    ) -> ConclaveResult<ConsensusResult> {
        tokio::time::sleep(wait).await;
        self.close_session(session_id, algorithm, threshold).await
    }

    /// Stored result of a closed session
    pub fn get_result(&self, session_id: VotingSessionId) -> Option<ConsensusResult> {
        self.results.get(&session_id).map(|r| r.clone())
    }

    /// Snapshot of a voting session
    pub fn get_session(&self, session_id: VotingSessionId) -> Option<VotingSession> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// Activity counters
    pub async fn stats(&self) -> ConsensusStats {
        self.stats.read().await.clone()
    }

    fn compute_result(
        &self,
        session: &VotingSession,
        algorithm: VotingAlgorithm,
        threshold: f64,
    ) -> ConsensusResult {
        let weighted = !matches!(algorithm, VotingAlgorithm::SimpleMajority);

        // Every option appears in the tally, voted or not.
        let mut tally: BTreeMap<String, f64> = session
            .options
            .iter()
            .map(|o| (o.id.clone(), 0.0))
            .collect();
        for vote in session.votes.values() {
            let contribution = if weighted { vote.weight } else { 1.0 };
            *tally.entry(vote.option_id.clone()).or_insert(0.0) += contribution;
        }

        let total: f64 = tally.values().sum();
        let top = tally
            .values()
            .cloned()
            .fold(0.0_f64, |acc, v| if v > acc { v } else { acc });
        // BTreeMap iterates in id order, so the first max is the
        // lexicographically smallest winner.
        let winner_id = if total > 0.0 {
            tally
                .iter()
                .find(|(_, v)| **v == top)
                .map(|(id, _)| id.clone())
        } else {
            None
        };
        let tied = total > 0.0 && tally.values().filter(|v| **v == top).count() > 1;

        let (mut reached, mut detail) = match algorithm {
            VotingAlgorithm::SimpleMajority | VotingAlgorithm::WeightedMajority => {
                let reached = top > total / 2.0;
                let unit = if weighted { "weight" } else { "votes" };
                (
                    reached,
                    format!(
                        "{algorithm}: top tally {top:.2} of {total:.2} total {unit}"
                    ),
                )
            }
            VotingAlgorithm::Supermajority => {
                let bar = threshold * total;
                let reached = if tied { top > bar } else { top >= bar };
                (
                    reached,
                    format!(
                        "{algorithm}: top weight {top:.2} against bar {bar:.2} ({threshold:.2} of {total:.2})"
                    ),
                )
            }
            VotingAlgorithm::ConsensusThreshold => {
                let options_voted = tally.values().filter(|v| **v > 0.0).count();
                let registered: Vec<f64> = self.voters.iter().map(|v| v.weight).collect();
                let registered_count = registered.len();
                let registered_weight: f64 = registered.iter().sum();
                let full_turnout = session.votes.len() == registered_count && registered_count > 0;
                let reached = options_voted == 1
                    && full_turnout
                    && registered_weight > 0.0
                    && total >= threshold * registered_weight;
                (
                    reached,
                    format!(
                        "{algorithm}: {options_voted} option(s) voted, turnout {}/{registered_count}, cast weight {total:.2} of {registered_weight:.2} registered",
                        session.votes.len()
                    ),
                )
            }
        };

        let mut winning_option = winner_id.and_then(|id| session.option(&id).cloned());

        // Quorum shortfall reports the distribution but never a winner.
        if let Some(quorum) = session.quorum {
            if session.distinct_voters() < quorum {
                reached = false;
                winning_option = None;
                detail = format!(
                    "quorum not met: {} distinct voter(s), {quorum} required; {detail}",
                    session.distinct_voters()
                );
            }
        }

        let confidence = match (&winning_option, algorithm) {
            (None, _) => 0.0,
            (Some(_), VotingAlgorithm::ConsensusThreshold) => {
                let registered_weight: f64 = self.voters.iter().map(|v| v.weight).sum();
                if registered_weight > 0.0 {
                    (total / registered_weight).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            (Some(_), _) => {
                if total > 0.0 {
                    (top / total).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
        };

        if session.votes.is_empty() {
            warn!(session_id = %session.id, "closing voting session without ballots");
        }

        ConsensusResult {
            session_id: session.id,
            winning_option,
            confidence,
            tally,
            consensus_reached: reached,
            method: algorithm,
            detail,
        }
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yes_no() -> Vec<VoteOption> {
        vec![
            VoteOption::new("no", "No", serde_json::json!(false)),
            VoteOption::new("yes", "Yes", serde_json::json!(true)),
        ]
    }

    #[tokio::test]
    async fn create_rejects_empty_options() {
        let engine = ConsensusEngine::new();
        let err = engine
            .create_session("t", Vec::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_option_ids() {
        let engine = ConsensusEngine::new();
        let options = vec![
            VoteOption::new("a", "A", serde_json::Value::Null),
            VoteOption::new("a", "A again", serde_json::Value::Null),
        ];
        let err = engine.create_session("t", options, None).await.unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn duplicate_vote_conflicts() {
        let engine = ConsensusEngine::new();
        let id = engine.create_session("t", yes_no(), None).await.unwrap();
        engine
            .register_voter(VoterProfile::plain("u1"))
            .await
            .unwrap();

        engine.cast_vote(id, "u1", "yes", None).await.unwrap();
        let err = engine.cast_vote(id, "u1", "no", None).await.unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn vote_on_unknown_option_is_invalid() {
        let engine = ConsensusEngine::new();
        let id = engine.create_session("t", yes_no(), None).await.unwrap();
        engine
            .register_voter(VoterProfile::plain("u1"))
            .await
            .unwrap();

        let err = engine.cast_vote(id, "u1", "maybe", None).await.unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn unregistered_voter_is_not_found() {
        let engine = ConsensusEngine::new();
        let id = engine.create_session("t", yes_no(), None).await.unwrap();
        let err = engine.cast_vote(id, "ghost", "yes", None).await.unwrap_err();
        assert_eq!(err.kind(), conclave_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn voteless_close_is_clean() {
        let engine = ConsensusEngine::new();
        let id = engine.create_session("t", yes_no(), None).await.unwrap();

        let result = engine
            .close_session(id, VotingAlgorithm::SimpleMajority, None)
            .await
            .unwrap();
        assert!(!result.consensus_reached);
        assert!(result.winning_option.is_none());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.tally.len(), 2);
    }
}
