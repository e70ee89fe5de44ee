//! Presence records
//!
//! The wire shape delivered by the presence registry: one record per active
//! participant per room, keyed by `(room_id, participant_id)`.

use serde::{Deserialize, Serialize};

use super::{ParticipantId, PeerId};

/// One active participant as seen by the presence registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Participant ID
    pub participant_id: ParticipantId,
    /// Display name shown to other participants
    pub display_name: String,
    /// Transport peer-id other members dial to reach this participant
    pub peer_id: PeerId,
    /// Timestamp when the participant registered
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl PresenceRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        participant_id: ParticipantId,
        display_name: impl Into<String>,
        peer_id: PeerId,
    ) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            peer_id,
            joined_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let record = PresenceRecord::new(
            ParticipantId::from("alice"),
            "Alice",
            PeerId::from("room-1:alice"),
        );

        let json = serde_json::to_string(&record).expect("record should serialize");
        assert!(json.contains("\"participant_id\":\"alice\""));
        assert!(json.contains("\"peer_id\":\"room-1:alice\""));

        let back: PresenceRecord = serde_json::from_str(&json).expect("record should deserialize");
        assert_eq!(back, record);
    }
}
