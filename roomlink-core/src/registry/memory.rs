//! In-process presence registry
//!
//! Single-node registry used by tests and single-process deployments.
//! Keeps one record per `(room, participant)` and pushes the full member
//! snapshot to every room subscriber on each change.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ParticipantId, PeerId, PresenceRecord, RoomId};
use crate::registry::{PresenceRegistry, PresenceSubscription};

/// Message sender for one room subscriber
type SnapshotSender = mpsc::UnboundedSender<Vec<PresenceRecord>>;

#[derive(Default)]
struct RoomPresence {
    records: HashMap<ParticipantId, PresenceRecord>,
    subscribers: Vec<(u64, SnapshotSender)>,
}

impl RoomPresence {
    /// Current member list, oldest joiner first.
    fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.participant_id.as_str().cmp(b.participant_id.as_str()))
        });
        records
    }

    /// Push the current snapshot to every subscriber, pruning dead ones.
    fn broadcast(&mut self, room_id: &RoomId) {
        let snapshot = self.snapshot();
        self.subscribers.retain(|(id, sender)| {
            if sender.send(snapshot.clone()).is_ok() {
                true
            } else {
                debug!(
                    room_id = %room_id,
                    subscriber_id = id,
                    "Dropping dead presence subscriber"
                );
                false
            }
        });
    }
}

/// In-memory presence registry hub.
#[derive(Clone, Default)]
pub struct MemoryPresenceRegistry {
    rooms: Arc<DashMap<RoomId, RoomPresence>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl MemoryPresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered participants in a room.
    #[must_use]
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |room| room.records.len())
    }

    fn remove_room_if_empty(&self, room_id: &RoomId) {
        self.rooms.remove_if(room_id, |_, room| {
            room.records.is_empty() && room.subscribers.is_empty()
        });
    }
}

#[async_trait]
impl PresenceRegistry for MemoryPresenceRegistry {
    async fn register(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
        display_name: &str,
        peer_id: &PeerId,
    ) -> Result<()> {
        let record = PresenceRecord::new(participant_id.clone(), display_name, peer_id.clone());

        let mut room = self.rooms.entry(room_id.clone()).or_default();
        room.records.insert(participant_id.clone(), record);
        room.broadcast(room_id);

        debug!(
            room_id = %room_id,
            participant_id = %participant_id,
            peer_id = %peer_id,
            members = room.records.len(),
            "Participant registered"
        );

        Ok(())
    }

    async fn unregister(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()> {
        let removed = if let Some(mut room) = self.rooms.get_mut(room_id) {
            let removed = room.records.remove(participant_id).is_some();
            if removed {
                room.broadcast(room_id);
            }
            removed
        } else {
            false
        };

        if removed {
            debug!(
                room_id = %room_id,
                participant_id = %participant_id,
                "Participant unregistered"
            );
            self.remove_room_if_empty(room_id);
        } else {
            warn!(
                room_id = %room_id,
                participant_id = %participant_id,
                "Attempted to unregister unknown participant"
            );
        }

        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<PresenceSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let initial = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            room.subscribers.push((subscriber_id, tx.clone()));
            room.snapshot()
        };

        // Deliver the current membership immediately; later changes follow.
        let _ = tx.send(initial);

        debug!(
            room_id = %room_id,
            subscriber_id,
            "Presence subscription opened"
        );

        let guard = SubscriptionGuard {
            rooms: Arc::clone(&self.rooms),
            room_id: room_id.clone(),
            subscriber_id,
        };

        Ok(PresenceSubscription::new(rx, Box::new(guard)))
    }
}

/// Removes the subscriber entry when the subscription is dropped.
struct SubscriptionGuard {
    rooms: Arc<DashMap<RoomId, RoomPresence>>,
    room_id: RoomId,
    subscriber_id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(mut room) = self.rooms.get_mut(&self.room_id) {
            room.subscribers.retain(|(id, _)| *id != self.subscriber_id);
            debug!(
                room_id = %self.room_id,
                subscriber_id = self.subscriber_id,
                "Presence subscription closed"
            );
        }
        self.rooms.remove_if(&self.room_id, |_, room| {
            room.records.is_empty() && room.subscribers.is_empty()
        });
    }
}
