//! Wire protocol for the support channel.
//!
//! Every signaling and chat event travels as one JSON object tagged by
//! `type`. Field names are camelCase on the wire because that is what the
//! dashboard front-end and the agent console already speak; the legacy
//! doublet event names (`video_call_offer`, `call_ended`) are accepted as
//! aliases on input and never emitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest SDP description accepted by the gateway.
pub const MAX_SDP_BYTES: usize = 32 * 1024;
/// Largest single ICE candidate accepted by the gateway.
pub const MAX_CANDIDATE_BYTES: usize = 4096;
/// Largest chat message body accepted by the gateway.
pub const MAX_CHAT_BODY_BYTES: usize = 8 * 1024;
/// Largest text frame the gateway will read at all.
pub const MAX_TEXT_FRAME_BYTES: usize = 64 * 1024;

/// A participant's online status as tracked by the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

/// Which side of the support channel a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Customer,
    Agent,
}

/// An active support session pairing a user with a counterpart agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    /// `None` until the registry has paired the user with an agent.
    pub counterpart_id: Option<String>,
    pub presence: Presence,
}

/// A chat message exchanged within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
}

impl ChatMessage {
    /// Build an outgoing message: fresh id, sender-assigned timestamp,
    /// not yet delivered.
    pub fn outgoing(
        session_id: Uuid,
        sender_id: impl Into<String>,
        body: impl Into<String>,
        attachment: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            sender_id: sender_id.into(),
            body: body.into(),
            attachment,
            sent_at: Utc::now(),
            delivered: false,
        }
    }
}

/// One event on the support-channel transport.
///
/// Signaling events (offer/answer/candidate/end) carry both participant ids
/// so either side can route; the gateway stamps `user_id` with the
/// authenticated sender before relaying, so a client cannot spoof it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireEvent {
    JoinSupportChat {
        user_id: String,
        user_name: String,
        #[serde(default)]
        role: Role,
    },
    SessionJoined {
        #[serde(flatten)]
        session: Session,
    },
    PresenceUpdate {
        user_id: String,
        state: Presence,
    },
    SupportMessage {
        #[serde(flatten)]
        message: ChatMessage,
    },
    SupportMessageReceived {
        #[serde(flatten)]
        message: ChatMessage,
    },
    MessageAck {
        session_id: Uuid,
        message_id: Uuid,
    },
    AgentTyping {
        session_id: Uuid,
        is_typing: bool,
    },
    #[serde(alias = "video_call_offer")]
    VideoOffer {
        session_id: Uuid,
        offer: String,
        user_id: String,
        agent_id: String,
    },
    VideoAnswer {
        session_id: Uuid,
        answer: String,
        user_id: String,
        agent_id: String,
    },
    IceCandidate {
        session_id: Uuid,
        candidate: String,
        user_id: String,
        agent_id: String,
    },
    #[serde(alias = "call_ended")]
    EndVideoCall {
        session_id: Uuid,
        user_id: String,
        agent_id: String,
    },
    Error {
        message: String,
    },
}

impl WireEvent {
    /// Session this event should be routed within, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::SupportMessage { message } | Self::SupportMessageReceived { message } => {
                Some(message.session_id)
            }
            Self::MessageAck { session_id, .. }
            | Self::AgentTyping { session_id, .. }
            | Self::VideoOffer { session_id, .. }
            | Self::VideoAnswer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::EndVideoCall { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// Whether this is a call-signaling event (offer/answer/candidate/end).
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Self::VideoOffer { .. }
                | Self::VideoAnswer { .. }
                | Self::IceCandidate { .. }
                | Self::EndVideoCall { .. }
        )
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinSupportChat { .. } => "join_support_chat",
            Self::SessionJoined { .. } => "session_joined",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::SupportMessage { .. } => "support_message",
            Self::SupportMessageReceived { .. } => "support_message_received",
            Self::MessageAck { .. } => "message_ack",
            Self::AgentTyping { .. } => "agent_typing",
            Self::VideoOffer { .. } => "video_offer",
            Self::VideoAnswer { .. } => "video_answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::EndVideoCall { .. } => "end_video_call",
            Self::Error { .. } => "error",
        }
    }

    /// Check payload size limits. Returns a description of the violation,
    /// if any; enforced by the gateway before relaying.
    pub fn payload_violation(&self) -> Option<&'static str> {
        match self {
            Self::VideoOffer { offer: sdp, .. } | Self::VideoAnswer { answer: sdp, .. }
                if sdp.len() > MAX_SDP_BYTES =>
            {
                Some("SDP description too large")
            }
            Self::IceCandidate { candidate, .. } if candidate.len() > MAX_CANDIDATE_BYTES => {
                Some("ICE candidate too large")
            }
            Self::SupportMessage { message } | Self::SupportMessageReceived { message }
                if message.body.len() > MAX_CHAT_BODY_BYTES =>
            {
                Some("chat body too large")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_names_match_wire_contract() {
        let offer = WireEvent::VideoOffer {
            session_id: Uuid::nil(),
            offer: "v=0".into(),
            user_id: "u1".into(),
            agent_id: "a1".into(),
        };
        let json = serde_json::to_value(&offer).expect("serialize");
        assert_eq!(json["type"], "video_offer");
        assert_eq!(json["sessionId"], Uuid::nil().to_string());
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["agentId"], "a1");
    }

    #[test]
    fn test_legacy_event_names_are_accepted() {
        let text = format!(
            r#"{{"type":"video_call_offer","sessionId":"{id}","offer":"v=0","userId":"u1","agentId":"a1"}}"#,
            id = Uuid::nil()
        );
        let event: WireEvent = serde_json::from_str(&text).expect("parse alias");
        assert!(matches!(event, WireEvent::VideoOffer { .. }));

        let text = format!(
            r#"{{"type":"call_ended","sessionId":"{id}","userId":"u1","agentId":"a1"}}"#,
            id = Uuid::nil()
        );
        let event: WireEvent = serde_json::from_str(&text).expect("parse alias");
        assert!(matches!(event, WireEvent::EndVideoCall { .. }));
    }

    #[test]
    fn test_join_role_defaults_to_customer() {
        let event: WireEvent = serde_json::from_str(
            r#"{"type":"join_support_chat","userId":"u1","userName":"Ada"}"#,
        )
        .expect("parse");
        match event {
            WireEvent::JoinSupportChat { role, .. } => assert_eq!(role, Role::Customer),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_chat_message_flattens_into_event() {
        let message = ChatMessage::outgoing(Uuid::new_v4(), "u1", "hello", None);
        let event = WireEvent::SupportMessage {
            message: message.clone(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "support_message");
        assert_eq!(json["body"], "hello");
        assert_eq!(json["senderId"], "u1");
        assert_eq!(json["delivered"], false);

        let back: WireEvent = serde_json::from_value(json).expect("round trip");
        assert_eq!(back, event);
    }

    #[test]
    fn test_payload_violation_flags_oversized_sdp() {
        let offer = WireEvent::VideoOffer {
            session_id: Uuid::nil(),
            offer: "x".repeat(MAX_SDP_BYTES + 1),
            user_id: "u1".into(),
            agent_id: "a1".into(),
        };
        assert!(offer.payload_violation().is_some());

        let candidate = WireEvent::IceCandidate {
            session_id: Uuid::nil(),
            candidate: "candidate:1".into(),
            user_id: "u1".into(),
            agent_id: "a1".into(),
        };
        assert!(candidate.payload_violation().is_none());
    }

    #[test]
    fn test_session_round_trip_uses_camel_case() {
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: "u1".into(),
            counterpart_id: Some("a1".into()),
            presence: Presence::Online,
        };
        let json = serde_json::to_value(&session).expect("serialize");
        assert_eq!(json["counterpartId"], "a1");
        assert_eq!(json["presence"], "online");
        let back: Session = serde_json::from_value(json).expect("round trip");
        assert_eq!(back, session);
    }
}
