//! # Conclave Signaling
//!
//! Session-scoped relay for peer connection establishment. Participants
//! connect over WebSocket, authenticate with a bearer token on their first
//! frame, and join a session room; the server then forwards SDP offers,
//! answers, and ICE candidates verbatim between room members, heartbeats
//! every open socket, and reaps silent ones.
//!
//! The relay never routes between sessions and never routes a frame back
//! to its sender. The concrete peer transport the forwarded payloads set up
//! is outside this crate; only the wire protocol lives here.

pub mod auth;
pub mod client;
pub mod config;
pub mod message;
pub mod server;

pub use auth::{BearerTokenValidator, TokenValidator};
pub use client::SignalingClient;
pub use config::{SignalingConfig, SignalingServerConfig};
pub use message::SignalingMessage;
pub use server::SignalingServer;

pub use conclave_core::{ConclaveError, ConclaveResult};
