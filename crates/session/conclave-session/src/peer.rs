//! Per-peer transport primitives
//!
//! The concrete media transport is an external collaborator; this module
//! models what the fabric needs from it: offer/answer generation for
//! connection establishment, and a bounded, ordered data channel per peer.

use crate::message::SessionMessage;
use async_trait::async_trait;
use conclave_core::ConclaveResult;
use tokio::sync::mpsc;

/// Bound on queued messages per peer; overflow marks the peer Failed
pub const DATA_CHANNEL_CAPACITY: usize = 128;

/// Generates the connection-establishment payloads exchanged over
/// signaling.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Produce an offer for the `from → to` connection
    async fn create_offer(&self, from: &str, to: &str, session_id: &str) -> ConclaveResult<String>;

    /// Produce an answer to a received offer
    async fn create_answer(&self, from: &str, to: &str, offer: &str) -> ConclaveResult<String>;
}

/// Reference connector emitting synthetic SDP strings.
///
/// A deployment substitutes a connector backed by the real peer transport;
/// the fabric only relays these payloads, it never interprets them.
#[derive(Debug, Default, Clone)]
pub struct SyntheticSdpConnector;

#[async_trait]
impl PeerConnector for SyntheticSdpConnector {
    async fn create_offer(&self, from: &str, to: &str, session_id: &str) -> ConclaveResult<String> {
        Ok(format!("v=0 o={from} s={session_id} t={to} a=offer"))
    }

    async fn create_answer(&self, from: &str, to: &str, offer: &str) -> ConclaveResult<String> {
        Ok(format!("v=0 o={from} t={to} a=answer in-reply-to:{offer}"))
    }
}

/// Sending side of a participant's data channel.
///
/// Enqueue-and-forget with a bounded buffer: a slow peer overflows its own
/// channel instead of blocking the session.
#[derive(Debug, Clone)]
pub struct DataChannel {
    tx: mpsc::Sender<SessionMessage>,
}

/// Why a send did not go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSendError {
    /// Buffer full; the peer is too slow
    Overflow,
    /// Receiving side is gone
    Closed,
}

impl DataChannel {
    /// Create a channel pair with the default capacity
    pub fn new() -> (Self, mpsc::Receiver<SessionMessage>) {
        Self::with_capacity(DATA_CHANNEL_CAPACITY)
    }

    /// Create a channel pair with an explicit capacity
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<SessionMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a message without waiting
    pub fn try_send(&self, message: SessionMessage) -> Result<(), ChannelSendError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelSendError::Overflow,
            mpsc::error::TrySendError::Closed(_) => ChannelSendError::Closed,
        })
    }

    /// Whether the receiving side is still attached
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskAction;
    use crate::types::{Task, TaskPriority};

    fn message(n: usize) -> SessionMessage {
        SessionMessage::task(
            "u1",
            "s1",
            TaskAction::Added {
                task: Task::new(format!("t{n}"), "x", TaskPriority::Low),
            },
        )
    }

    #[tokio::test]
    async fn channel_preserves_sender_order() {
        let (channel, mut rx) = DataChannel::with_capacity(8);
        for n in 0..5 {
            channel.try_send(message(n)).unwrap();
        }
        for n in 0..5 {
            let received = rx.recv().await.unwrap();
            match received {
                SessionMessage::Task {
                    payload: TaskAction::Added { task },
                    ..
                } => assert_eq!(task.id, format!("t{n}")),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn overflow_is_reported_not_blocking() {
        let (channel, _rx) = DataChannel::with_capacity(2);
        channel.try_send(message(0)).unwrap();
        channel.try_send(message(1)).unwrap();
        assert_eq!(
            channel.try_send(message(2)).unwrap_err(),
            ChannelSendError::Overflow
        );
    }

    #[tokio::test]
    async fn dropped_receiver_closes_channel() {
        let (channel, rx) = DataChannel::with_capacity(2);
        drop(rx);
        assert!(!channel.is_open());
        assert_eq!(
            channel.try_send(message(0)).unwrap_err(),
            ChannelSendError::Closed
        );
    }

    #[tokio::test]
    async fn synthetic_connector_mentions_both_ends() {
        let connector = SyntheticSdpConnector;
        let offer = connector.create_offer("u1", "u2", "s1").await.unwrap();
        assert!(offer.contains("u1") && offer.contains("u2"));
        let answer = connector.create_answer("u2", "u1", &offer).await.unwrap();
        assert!(answer.contains("answer"));
    }
}
