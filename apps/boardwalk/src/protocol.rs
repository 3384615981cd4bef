use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque display fields a client attaches to its search request.
///
/// Only `username`, `profile_picture` and `tag` are named; anything else the
/// client sends is carried through untouched so the partner sees exactly what
/// was supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Identity snippet handed over at search time. Trusted as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub profile: Option<PeerProfile>,
}

impl Identity {
    pub fn new(user_id: Option<String>, profile: Option<PeerProfile>) -> Self {
        Self { user_id, profile }
    }

    pub fn anonymous(user_id: Option<String>) -> Self {
        Self {
            user_id,
            profile: None,
        }
    }
}

/// Messages sent from a client to the signaling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter the waiting pool, or pair with whoever is waiting
    Search {
        #[serde(rename = "userId", default)]
        user_id: Option<String>,
        #[serde(rename = "userProfile", default)]
        user_profile: Option<PeerProfile>,
    },
    /// Leave the waiting pool
    StopSearch {
        #[serde(rename = "userId", default)]
        user_id: Option<String>,
    },
    /// Drop the current partner and search again
    SkipToNext {
        #[serde(rename = "userId", default)]
        user_id: Option<String>,
    },
    // Negotiation payloads are never inspected; the raw frame is forwarded.
    Offer {},
    Answer {},
    Candidate {},
    /// Heartbeat to keep the connection alive
    Ping,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        match value.get("type") {
            Some(serde_json::Value::String(_)) => {}
            Some(_) | None => return Err(ProtocolError::MissingType),
        }
        serde_json::from_value(value).map_err(ProtocolError::UnsupportedMessage)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Search { .. } => "search",
            ClientMessage::StopSearch { .. } => "stopSearch",
            ClientMessage::SkipToNext { .. } => "skipToNext",
            ClientMessage::Offer {} => "offer",
            ClientMessage::Answer {} => "answer",
            ClientMessage::Candidate {} => "candidate",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from the signaling server to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Enqueued, waiting for a partner
    Searching,
    /// Pairing completed
    Matched(MatchedPeer),
    /// Same as `Matched`, under the name older web clients listen for
    PeerFound(MatchedPeer),
    /// Partner left or skipped
    SkipToNext,
    /// Response to ping
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPeer {
    pub peer_id: Option<String>,
    pub peer_profile: Option<PeerProfile>,
    pub is_initiator: bool,
    /// Mirrors `is_initiator`; the caller creates the WebRTC offer.
    pub is_caller: bool,
}

impl MatchedPeer {
    pub fn new(peer: &Identity, is_initiator: bool) -> Self {
        Self {
            peer_id: peer.user_id.clone(),
            peer_profile: peer.profile.clone(),
            is_initiator,
            is_caller: is_initiator,
        }
    }
}

impl ServerMessage {
    pub fn matched_peer(&self) -> Option<&MatchedPeer> {
        match self {
            ServerMessage::Matched(peer) | ServerMessage::PeerFound(peer) => Some(peer),
            _ => None,
        }
    }
}

/// Which event name announces a completed pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MatchedEvent {
    #[default]
    Matched,
    PeerFound,
}

impl MatchedEvent {
    pub fn message(self, peer: MatchedPeer) -> ServerMessage {
        match self {
            MatchedEvent::Matched => ServerMessage::Matched(peer),
            MatchedEvent::PeerFound => ServerMessage::PeerFound(peer),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unsupported message: {0}")]
    UnsupportedMessage(serde_json::Error),
}

impl ProtocolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnsupportedMessage(_) => "unsupported",
        }
    }
}

/// Process-local connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn search_decodes_identity_and_keeps_unknown_profile_fields() {
        let text = json!({
            "type": "search",
            "userId": "u-1",
            "userProfile": {
                "username": "kai",
                "profile_picture": "kai.png",
                "tag": "Surfer",
                "banner": "waves.png"
            }
        })
        .to_string();

        let ClientMessage::Search {
            user_id,
            user_profile,
        } = ClientMessage::decode(&text).unwrap()
        else {
            panic!("expected search");
        };
        assert_eq!(user_id.as_deref(), Some("u-1"));
        let profile = user_profile.unwrap();
        assert_eq!(profile.username.as_deref(), Some("kai"));
        assert_eq!(profile.extra.get("banner"), Some(&json!("waves.png")));
    }

    #[test_timeout::timeout]
    fn negotiation_payloads_are_not_inspected() {
        let offer = r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0"}}"#;
        let candidate = r#"{"type":"candidate","candidate":null,"seq":7}"#;
        assert_eq!(ClientMessage::decode(offer).unwrap(), ClientMessage::Offer {});
        assert_eq!(
            ClientMessage::decode(candidate).unwrap(),
            ClientMessage::Candidate {}
        );
    }

    #[test_timeout::timeout]
    fn search_without_identity_is_accepted() {
        let msg = ClientMessage::decode(r#"{"type":"search"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Search {
                user_id: None,
                user_profile: None
            }
        );
    }

    #[test_timeout::timeout]
    fn malformed_envelopes_are_classified() {
        assert!(matches!(
            ClientMessage::decode("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"userId":"u"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"type":42}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnsupportedMessage(_))
        ));
    }

    #[test_timeout::timeout]
    fn matched_serializes_with_both_initiator_flags() {
        let peer = Identity::new(Some("u-2".into()), None);
        let value =
            serde_json::to_value(MatchedEvent::Matched.message(MatchedPeer::new(&peer, true)))
                .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "matched",
                "peerId": "u-2",
                "peerProfile": null,
                "isInitiator": true,
                "isCaller": true
            })
        );

        let legacy =
            serde_json::to_value(MatchedEvent::PeerFound.message(MatchedPeer::new(&peer, false)))
                .unwrap();
        assert_eq!(legacy["type"], json!("peerFound"));
        assert_eq!(legacy["isCaller"], json!(false));
    }

    #[test_timeout::timeout]
    fn control_events_use_camel_case_tags() {
        assert_eq!(
            serde_json::to_string(&ServerMessage::SkipToNext).unwrap(),
            r#"{"type":"skipToNext"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::Searching).unwrap(),
            r#"{"type":"searching"}"#
        );
    }
}
