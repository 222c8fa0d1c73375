//! Process-wide event bus
//!
//! The bus is the single collaborator shared between the session manager,
//! the persistence layer, and the signaling fallback path. Components react
//! to events as plain subscribers; none of them import each other.

use crate::types::{AgentId, HandoffId, SessionId, TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default buffered capacity of the broadcast channel
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Events published on the fabric-wide bus.
///
/// One variant per emitted topic; [`ConclaveEvent::topic`] returns the
/// dotted topic string consumers know the event by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConclaveEvent {
    /// A session was created
    SessionCreated {
        session_id: SessionId,
        host_user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    /// A participant joined a session
    ParticipantJoined {
        session_id: SessionId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    /// A participant left a session
    ParticipantLeft {
        session_id: SessionId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    /// A session was closed
    SessionClosed {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    /// The restore manager asks for a persisted session to be rebuilt.
    /// The payload is the serialized snapshot; the session layer owns the
    /// concrete schema.
    SessionRecreate {
        session_id: SessionId,
        snapshot: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// A persisted session finished rebuilding
    SessionRestored {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    /// A task was removed by an accepted veto
    TaskVetoed {
        session_id: SessionId,
        task_id: TaskId,
        requested_by: UserId,
        timestamp: DateTime<Utc>,
    },
    /// A task was completed
    TaskCompleted {
        session_id: SessionId,
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    /// Connection offer emitted on the direct (bus) signaling fallback
    SdpOffer {
        session_id: SessionId,
        from: UserId,
        to: UserId,
        sdp: String,
        timestamp: DateTime<Utc>,
    },
    /// Connection answer emitted on the direct (bus) signaling fallback
    SdpAnswer {
        session_id: SessionId,
        from: UserId,
        to: UserId,
        sdp: String,
        timestamp: DateTime<Utc>,
    },
    /// ICE candidate emitted on the direct (bus) signaling fallback
    IceCandidate {
        session_id: SessionId,
        from: UserId,
        to: UserId,
        candidate: String,
        timestamp: DateTime<Utc>,
    },
    /// A peer transport changed state
    ConnectionStateChanged {
        session_id: SessionId,
        user_id: UserId,
        state: String,
        timestamp: DateTime<Utc>,
    },
    /// An agent answered an A2A handshake request
    HandshakeResponse {
        session_id: SessionId,
        handshake_id: HandoffId,
        source_agent: AgentId,
        target_agent: AgentId,
        accepted: bool,
        timestamp: DateTime<Utc>,
    },
}

impl ConclaveEvent {
    /// Dotted topic string this event is published under
    pub fn topic(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "swarm.session.created",
            Self::ParticipantJoined { .. } => "swarm.session.participant.joined",
            Self::ParticipantLeft { .. } => "swarm.session.participant.left",
            Self::SessionClosed { .. } => "swarm.session.closed",
            Self::SessionRecreate { .. } => "swarm.session.recreate",
            Self::SessionRestored { .. } => "swarm.session.restored",
            Self::TaskVetoed { .. } => "swarm.task.vetoed",
            Self::TaskCompleted { .. } => "swarm.task.completed",
            Self::SdpOffer { .. } => "webrtc.sdp-offer",
            Self::SdpAnswer { .. } => "webrtc.sdp-answer",
            Self::IceCandidate { .. } => "webrtc.ice-candidate",
            Self::ConnectionStateChanged { .. } => "webrtc.connection-state",
            Self::HandshakeResponse { .. } => "a2a.handshake.response",
        }
    }
}

/// Broadcast-backed event bus.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and a lagging subscriber loses the oldest buffered events rather
/// than stalling publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConclaveEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with an explicit buffer capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: ConclaveEvent) {
        trace!(topic = event.topic(), "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ConclaveEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(ConclaveEvent::SessionCreated {
            session_id: "s1".into(),
            host_user_id: "u1".into(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "swarm.session.created");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // Must not panic or block
        bus.publish(ConclaveEvent::SessionClosed {
            session_id: "s1".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
