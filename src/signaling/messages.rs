//! Message Types für Presence- und Signaling-Protokoll
//!
//! Diese Strukturen definieren das JSON-Format, das über den SignalBus
//! ausgetauscht wird. Beide Seiten eines Raums müssen exakt dieselbe
//! Darstellung verwenden, daher sind alle Feldnamen explizit festgelegt.

use super::bus::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// PARTICIPANT ID
// ============================================================================

/// Opake, stabile ID einer Benutzer-Session innerhalb eines Raums
///
/// Die Ordnung ist lexikographisch und total; sie entscheidet, welche Seite
/// eines Paares das Offer erstellt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Erzeugt eine zufällige ID (UUID v4)
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// TOPICS
// ============================================================================

/// Topic-Namen pro Raum
pub mod topics {
    /// Presence-Topic eines Raums
    pub fn presence(room: &str) -> String {
        format!("room:{room}:presence")
    }

    /// Signaling-Topic eines Raums (Adressierung erfolgt über `target`)
    pub fn signaling(room: &str) -> String {
        format!("room:{room}:signaling")
    }
}

// ============================================================================
// PRESENCE MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    /// Lebenszeichen bzw. Antwort auf ein Join
    Sync,
    Join,
    Leave,
}

/// Presence-Nachricht: `{type, participantId, metadata?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    #[serde(rename = "type")]
    pub kind: PresenceKind,
    #[serde(rename = "participantId")]
    pub participant_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl PresenceMessage {
    pub fn new(kind: PresenceKind, participant_id: ParticipantId) -> Self {
        Self {
            kind,
            participant_id,
            metadata: None,
        }
    }

    pub fn join(participant_id: ParticipantId) -> Self {
        Self::new(PresenceKind::Join, participant_id)
    }

    pub fn sync(participant_id: ParticipantId) -> Self {
        Self::new(PresenceKind::Sync, participant_id)
    }

    pub fn leave(participant_id: ParticipantId) -> Self {
        Self::new(PresenceKind::Leave, participant_id)
    }

    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::Malformed(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, BusError> {
        serde_json::from_str(raw).map_err(|e| BusError::Malformed(e.to_string()))
    }
}

// ============================================================================
// SIGNALING MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Signaling-Nachricht: `{type, from, target, session, payload}`
///
/// `session` identifiziert einen einzelnen Verhandlungsversuch. Der
/// Initiator vergibt sie beim Offer, alle Answers und Candidates dieses
/// Versuchs tragen dieselbe ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: ParticipantId,
    pub target: ParticipantId,
    pub session: Uuid,
    /// SDP bei Offer/Answer, JSON-kodierter Candidate bei IceCandidate
    pub payload: String,
}

impl SignalMessage {
    pub fn new(
        kind: SignalKind,
        from: ParticipantId,
        target: ParticipantId,
        session: Uuid,
        payload: String,
    ) -> Self {
        Self {
            kind,
            from,
            target,
            session,
            payload,
        }
    }

    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::Malformed(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, BusError> {
        serde_json::from_str(raw).map_err(|e| BusError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ordering_is_lexicographic() {
        let a = ParticipantId::from("alice");
        let b = ParticipantId::from("bob");
        assert!(a < b);
        assert!(ParticipantId::from("b") > ParticipantId::from("abc"));
    }

    #[test]
    fn test_presence_wire_shape() {
        let msg = PresenceMessage::join("alice".into());
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "join");
        assert_eq!(json["participantId"], "alice");
        // metadata wird weggelassen wenn leer
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_presence_metadata_is_optional_on_decode() {
        let msg = PresenceMessage::decode(r#"{"type":"leave","participantId":"bob"}"#).unwrap();
        assert_eq!(msg.kind, PresenceKind::Leave);
        assert_eq!(msg.participant_id, ParticipantId::from("bob"));

        let msg = PresenceMessage::decode(
            r#"{"type":"sync","participantId":"bob","metadata":{"lang":"ru"}}"#,
        )
        .unwrap();
        assert_eq!(msg.metadata.unwrap()["lang"], "ru");
    }

    #[test]
    fn test_signal_wire_shape() {
        let session = Uuid::new_v4();
        let msg = SignalMessage::new(
            SignalKind::IceCandidate,
            "alice".into(),
            "bob".into(),
            session,
            "{}".to_string(),
        );
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["target"], "bob");
        assert_eq!(json["session"], session.to_string());
    }

    #[test]
    fn test_malformed_signal_is_rejected() {
        assert!(matches!(
            SignalMessage::decode(r#"{"type":"bye","from":"a"}"#),
            Err(BusError::Malformed(_))
        ));
    }
}
