//! Presence registry contract
//!
//! The registry is an external, eventually-consistent directory of who is
//! currently in a room. The mesh core only ever consumes this interface:
//! register on entry, unregister on exit (best effort), and subscribe to
//! full-snapshot updates which it diffs itself. Registry failures are never
//! fatal to a session; the mesh keeps working on whatever links it already
//! has or can seed out-of-band.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{ParticipantId, PeerId, PresenceRecord, RoomId};

/// Directory of active participants per room.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Announce a participant in a room. Failure is non-fatal to the caller.
    async fn register(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
        display_name: &str,
        peer_id: &PeerId,
    ) -> Result<()>;

    /// Remove a participant's record. Failure during teardown is swallowed
    /// by the caller.
    async fn unregister(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()>;

    /// Subscribe to a room. The subscription delivers the full member
    /// snapshot on every change, starting with the current one.
    async fn subscribe(&self, room_id: &RoomId) -> Result<PresenceSubscription>;
}

/// Live feed of presence snapshots for one room.
///
/// Dropping the subscription unsubscribes.
pub struct PresenceSubscription {
    receiver: mpsc::UnboundedReceiver<Vec<PresenceRecord>>,
    // Held for drop-side cleanup by the registry implementation.
    _unsubscribe: Box<dyn Send + Sync>,
}

impl PresenceSubscription {
    /// Build a subscription from a snapshot receiver and a guard object
    /// whose `Drop` performs the unsubscribe.
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Vec<PresenceRecord>>,
        unsubscribe: Box<dyn Send + Sync>,
    ) -> Self {
        Self {
            receiver,
            _unsubscribe: unsubscribe,
        }
    }

    /// Wait for the next snapshot. Returns `None` once the registry side
    /// has gone away.
    pub async fn next_snapshot(&mut self) -> Option<Vec<PresenceRecord>> {
        self.receiver.recv().await
    }
}

impl std::fmt::Debug for PresenceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSubscription").finish()
    }
}

pub use memory::MemoryPresenceRegistry;
