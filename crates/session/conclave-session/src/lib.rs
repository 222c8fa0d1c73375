//! # Conclave Session
//!
//! The session fabric: named multi-user rooms in which participants (users
//! paired with autonomous agents) exchange typed messages over per-peer
//! channels, cancel tasks through consensus vetoes, negotiate
//! agent-to-agent handshakes, delegate work to the best-fit agent, and
//! survive process restarts through durable snapshots.
//!
//! The [`manager::SessionManager`] is the coordinator; it consults the
//! access guard at every privileged boundary, drives the voting engine for
//! vetoes and delegation, and snapshots every mutation through a
//! [`persistence::SessionStore`]. Components communicate only through the
//! shared event bus.

pub mod delegate;
pub mod handoff;
pub mod manager;
pub mod message;
pub mod peer;
pub mod persistence;
pub mod policy;
pub mod types;

pub use delegate::{
    AgentProfile, CapabilityScorer, DelegateConfig, DelegationMethod, DelegationResult,
    LocalExecutor, SubstringScorer, SwarmDelegate,
};
pub use handoff::{ContextHandoff, HandoffManager, HandoffOutcome, HandoffRequest, HandoffState};
pub use manager::{JoinRequest, SessionManager, VetoResponse};
pub use message::{A2aFrame, HandoffAction, SessionMessage, StateSync, TaskAction, VetoNotice};
pub use peer::{DataChannel, PeerConnector, SyntheticSdpConnector};
pub use persistence::{
    FileSessionStore, InMemorySessionStore, RestoreManager, SessionSnapshot, SessionStore,
    SessionSummary, SqliteSessionStore, StorageHealth,
};
pub use policy::{A2aMediator, A2aReply, LenientVetoPolicy, LoopbackMediator, VetoBallot, VetoPolicy};
pub use types::*;

pub use conclave_core::{ConclaveError, ConclaveResult};

/// Smallest permitted participant cap
pub const MIN_PARTICIPANTS: usize = 2;

/// Largest permitted participant cap
pub const MAX_PARTICIPANTS: usize = 50;
