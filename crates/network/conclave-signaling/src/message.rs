//! Signaling wire protocol
//!
//! One JSON frame per message, UTF-8, internally tagged on `type`. Every
//! frame carries a millisecond `timestamp`; the remaining fields depend on
//! the variant. Server-originated frames use `from = "server"`.

use conclave_core::types::{now_millis, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// Sender id used by server-originated frames
pub const SERVER_SENDER: &str = "server";

/// A signaling frame.
///
/// Tagged variants make dispatch a total match; there is no "unknown type"
/// path past deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Join a session room. Requests carry `payload.authToken`; the ack and
    /// the broadcast to existing members carry `payload.participantId` (the
    /// ack additionally `payload.success`).
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        timestamp: i64,
    },
    /// Leave a session room; also broadcast when a member disconnects
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        timestamp: i64,
    },
    /// Connection offer, forwarded verbatim to `to`
    SdpOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        to: UserId,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<SessionId>,
        payload: serde_json::Value,
        timestamp: i64,
    },
    /// Connection answer, forwarded verbatim to `to`
    SdpAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        to: UserId,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<SessionId>,
        payload: serde_json::Value,
        timestamp: i64,
    },
    /// ICE candidate, forwarded verbatim to `to`
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        to: UserId,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<SessionId>,
        payload: serde_json::Value,
        timestamp: i64,
    },
    /// Liveness probe; carries only the timestamp
    Heartbeat { timestamp: i64 },
    /// Protocol or authorization failure
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        error: String,
        timestamp: i64,
    },
}

impl SignalingMessage {
    /// Client join request with a bearer credential
    pub fn join_request(session_id: impl Into<SessionId>, auth_token: impl Into<String>) -> Self {
        Self::Join {
            from: None,
            session_id: Some(session_id.into()),
            payload: Some(serde_json::json!({ "authToken": auth_token.into() })),
            timestamp: now_millis(),
        }
    }

    /// Server acknowledgement of a successful join
    pub fn join_ack(session_id: impl Into<SessionId>, participant_id: &str) -> Self {
        Self::Join {
            from: Some(SERVER_SENDER.to_string()),
            session_id: Some(session_id.into()),
            payload: Some(serde_json::json!({
                "success": true,
                "participantId": participant_id,
            })),
            timestamp: now_millis(),
        }
    }

    /// Server broadcast announcing a new room member
    pub fn join_broadcast(session_id: impl Into<SessionId>, participant_id: &str) -> Self {
        Self::Join {
            from: Some(SERVER_SENDER.to_string()),
            session_id: Some(session_id.into()),
            payload: Some(serde_json::json!({ "participantId": participant_id })),
            timestamp: now_millis(),
        }
    }

    /// Server broadcast announcing a departed room member
    pub fn leave_broadcast(session_id: impl Into<SessionId>, participant_id: &str) -> Self {
        Self::Leave {
            from: Some(SERVER_SENDER.to_string()),
            session_id: Some(session_id.into()),
            payload: Some(serde_json::json!({ "participantId": participant_id })),
            timestamp: now_millis(),
        }
    }

    /// Server heartbeat frame
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: now_millis(),
        }
    }

    /// Server error frame
    pub fn server_error(error: impl Into<String>) -> Self {
        Self::Error {
            from: Some(SERVER_SENDER.to_string()),
            error: error.into(),
            timestamp: now_millis(),
        }
    }

    /// Frame timestamp in milliseconds since the epoch
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Join { timestamp, .. }
            | Self::Leave { timestamp, .. }
            | Self::SdpOffer { timestamp, .. }
            | Self::SdpAnswer { timestamp, .. }
            | Self::IceCandidate { timestamp, .. }
            | Self::Heartbeat { timestamp }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Rewrite the sender field to the verified sender id.
    ///
    /// The relay never trusts a client-supplied `from`.
    pub fn with_from(self, sender: &str) -> Self {
        let from = Some(sender.to_string());
        match self {
            Self::Join {
                session_id,
                payload,
                timestamp,
                ..
            } => Self::Join {
                from,
                session_id,
                payload,
                timestamp,
            },
            Self::Leave {
                session_id,
                payload,
                timestamp,
                ..
            } => Self::Leave {
                from,
                session_id,
                payload,
                timestamp,
            },
            Self::SdpOffer {
                to,
                session_id,
                payload,
                timestamp,
                ..
            } => Self::SdpOffer {
                from,
                to,
                session_id,
                payload,
                timestamp,
            },
            Self::SdpAnswer {
                to,
                session_id,
                payload,
                timestamp,
                ..
            } => Self::SdpAnswer {
                from,
                to,
                session_id,
                payload,
                timestamp,
            },
            Self::IceCandidate {
                to,
                session_id,
                payload,
                timestamp,
                ..
            } => Self::IceCandidate {
                from,
                to,
                session_id,
                payload,
                timestamp,
            },
            other @ (Self::Heartbeat { .. } | Self::Error { .. }) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_tag_on_type() {
        let frame = SignalingMessage::heartbeat();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "Heartbeat");
        assert!(json.get("from").is_none());
    }

    #[test]
    fn join_request_round_trips() {
        let frame = SignalingMessage::join_request("s1", "user-u2");
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, parsed);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "Join");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["payload"]["authToken"], "user-u2");
    }

    #[test]
    fn offer_rewrites_from() {
        let frame = SignalingMessage::SdpOffer {
            from: Some("spoofed".into()),
            to: "u2".into(),
            session_id: Some("s1".into()),
            payload: serde_json::json!({"sdp": "v=0"}),
            timestamp: now_millis(),
        };
        let rewritten = frame.with_from("u1");
        match rewritten {
            SignalingMessage::SdpOffer { from, to, .. } => {
                assert_eq!(from.as_deref(), Some("u1"));
                assert_eq!(to, "u2");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
