//! # Conclave Core
//!
//! Shared foundation for the Conclave session fabric: common identifier
//! types, the boundary error model, the process-wide event bus, and the
//! access-control guard consulted at every privileged operation.
//!
//! Every other Conclave crate builds on this one; nothing here depends on
//! the session, consensus, or signaling layers. The event bus is the only
//! collaborator shared across components — higher layers communicate
//! through it instead of importing each other.

pub mod error;
pub mod events;
pub mod rbac;
pub mod types;

pub use error::{ConclaveError, ConclaveResult, ErrorKind};
pub use events::{ConclaveEvent, EventBus};
pub use rbac::{AccessDecision, AllowAllGuard, RbacGuard, ResourceAction, StaticRbacGuard};
pub use types::*;

/// Version of the Conclave coordination protocol.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AccessDecision, AllowAllGuard, ConclaveError, ConclaveEvent, ConclaveResult, ErrorKind,
        EventBus, RbacGuard, ResourceAction, StaticRbacGuard,
    };
    pub use crate::types::*;
}
