//! Voting data model

use chrono::{DateTime, Utc};
use conclave_core::types::{OptionId, UserId, VotingSessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An option voters can choose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOption {
    /// Unique option id within the session
    pub id: OptionId,
    /// Human-readable label
    pub label: String,
    /// Opaque value attached to the option
    pub value: serde_json::Value,
}

impl VoteOption {
    /// Create an option
    pub fn new(id: impl Into<OptionId>, label: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            value,
        }
    }
}

/// A recorded ballot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Who cast the ballot
    pub voter_id: UserId,
    /// Chosen option
    pub option_id: OptionId,
    /// Positive weight derived at registration time
    pub weight: f64,
    /// When the ballot was cast
    pub cast_at: DateTime<Utc>,
    /// Optional free-form rationale
    pub rationale: Option<String>,
}

/// Lifecycle of a voting session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingStatus {
    /// Accepting ballots
    Open,
    /// Tallied without reaching consensus
    Closed,
    /// Tallied with consensus reached
    Resolved,
}

/// A voting session over a fixed option list.
///
/// Invariant: every recorded vote references a known option, and each voter
/// appears at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingSession {
    /// Session id
    pub id: VotingSessionId,
    /// What is being decided
    pub topic: String,
    /// Ordered option list
    pub options: Vec<VoteOption>,
    /// Ballots keyed by voter id
    pub votes: HashMap<UserId, Vote>,
    /// Current status
    pub status: VotingStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Close time, set exactly once
    pub closed_at: Option<DateTime<Utc>>,
    /// Minimum distinct voters for a decisive result
    pub quorum: Option<usize>,
}

impl VotingSession {
    /// Whether an option id belongs to this session
    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }

    /// Look up an option by id
    pub fn option(&self, option_id: &str) -> Option<&VoteOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// Number of distinct voters so far
    pub fn distinct_voters(&self) -> usize {
        self.votes.len()
    }
}

/// Attributes a voter registers with; the ballot weight is a pure function
/// of these (see [`derive_weight`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoterProfile {
    /// Voter id
    pub id: UserId,
    /// Declared areas of expertise
    pub expertise: Vec<String>,
    /// Explicit weight, taking precedence over the expertise formula
    pub weight: Option<f64>,
}

impl VoterProfile {
    /// Profile with no declared expertise (weight 1.0)
    pub fn plain(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            expertise: Vec::new(),
            weight: None,
        }
    }

    /// Profile with an explicit weight
    pub fn weighted(id: impl Into<UserId>, weight: f64) -> Self {
        Self {
            id: id.into(),
            expertise: Vec::new(),
            weight: Some(weight),
        }
    }
}

/// Derive a ballot weight from a voter's attributes.
///
/// Pure and deterministic: identical profiles yield identical weights in
/// every process. An explicit weight wins; otherwise half the expertise
/// count, floored at 1.0.
pub fn derive_weight(profile: &VoterProfile) -> f64 {
    match profile.weight {
        Some(w) if w > 0.0 => w,
        _ => (profile.expertise.len() as f64 / 2.0).max(1.0),
    }
}

/// Tallying algorithm applied when a session closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotingAlgorithm {
    /// Unweighted counts, winner needs a strict majority of ballots
    SimpleMajority,
    /// Summed weights, winner needs a strict majority of total weight
    WeightedMajority,
    /// Summed weights, winner needs at least `threshold` of total weight
    Supermajority,
    /// Single option, full turnout, cast weight at least `threshold` of
    /// registered weight
    ConsensusThreshold,
}

impl VotingAlgorithm {
    /// Canonical kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleMajority => "simple-majority",
            Self::WeightedMajority => "weighted-majority",
            Self::Supermajority => "supermajority",
            Self::ConsensusThreshold => "consensus-threshold",
        }
    }
}

impl std::fmt::Display for VotingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of closing a voting session.
///
/// The tally maps every option id to its count (unweighted algorithms) or
/// summed weight (weighted algorithms); a `BTreeMap` keeps serialization
/// stable across repeated closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Voting session this result belongs to
    pub session_id: VotingSessionId,
    /// Winning option, if any
    pub winning_option: Option<VoteOption>,
    /// Winning share in `[0, 1]`
    pub confidence: f64,
    /// Per-option tally
    pub tally: BTreeMap<OptionId, f64>,
    /// Whether the algorithm's bar was met
    pub consensus_reached: bool,
    /// Algorithm that produced this result
    pub method: VotingAlgorithm,
    /// Human-readable summary
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_floors_at_one() {
        assert_eq!(derive_weight(&VoterProfile::plain("u1")), 1.0);
        let profile = VoterProfile {
            id: "u2".into(),
            expertise: vec!["code".into()],
            weight: None,
        };
        assert_eq!(derive_weight(&profile), 1.0);
    }

    #[test]
    fn weight_scales_with_expertise() {
        let profile = VoterProfile {
            id: "u1".into(),
            expertise: vec!["code".into(), "test".into(), "infra".into(), "docs".into()],
            weight: None,
        };
        assert_eq!(derive_weight(&profile), 2.0);
    }

    #[test]
    fn explicit_weight_wins() {
        let profile = VoterProfile::weighted("u1", 2.0);
        assert_eq!(derive_weight(&profile), 2.0);
    }

    #[test]
    fn non_positive_explicit_weight_falls_back() {
        let profile = VoterProfile {
            id: "u1".into(),
            expertise: Vec::new(),
            weight: Some(0.0),
        };
        assert_eq!(derive_weight(&profile), 1.0);
    }
}
