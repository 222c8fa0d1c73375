//! # Conclave Consensus
//!
//! Voting engine behind Conclave's veto decisions and task delegation.
//! Callers open a voting session over a fixed option list, registered
//! voters cast at most one weighted ballot each, and closing the session
//! computes a [`ConsensusResult`] under one of four algorithms:
//!
//! - **SimpleMajority** — unweighted counts, strict majority.
//! - **WeightedMajority** — summed weights, strict weighted majority.
//! - **Supermajority** — weighted, reached at a configurable threshold.
//! - **ConsensusThreshold** — unanimity of options, full turnout, scaled
//!   by threshold.
//!
//! Closing is idempotent: a closed session keeps returning the stored
//! result, byte for byte.

pub mod engine;
pub mod types;

pub use engine::{ConsensusEngine, ConsensusStats};
pub use types::{
    derive_weight, ConsensusResult, Vote, VoteOption, VoterProfile, VotingAlgorithm,
    VotingSession, VotingStatus,
};

pub use conclave_core::{ConclaveError, ConclaveResult};

/// Default supermajority / consensus threshold
pub const DEFAULT_THRESHOLD: f64 = 0.67;
