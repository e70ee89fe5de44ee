//! Connection pool
//!
//! The single owned home of all live and in-flight peer links, keyed by
//! remote peer-id. Check-before-insert is synchronous: a duplicate insert
//! is rejected and the existing entry always wins — the caller closes its
//! superseding attempt, never the pooled one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use roomlink_core::{Error, PeerId, Result};

use crate::connection::RemoteConnection;

/// Pool of peer links, at most one per peer-id.
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<PeerId, Arc<RemoteConnection>>>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a link (in-flight or flowing) exists for this peer.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.connections.read().contains_key(peer_id)
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<RemoteConnection>> {
        self.connections.read().get(peer_id).cloned()
    }

    /// Insert a connection, enforcing the at-most-one-per-peer invariant.
    ///
    /// Rejects when an entry for the peer already exists; the caller must
    /// close the superseding connection it tried to insert.
    pub fn insert(&self, connection: Arc<RemoteConnection>) -> Result<()> {
        let peer_id = connection.peer_id().clone();
        let mut connections = self.connections.write();
        if connections.contains_key(&peer_id) {
            return Err(Error::AlreadyExists(format!(
                "connection for peer {peer_id} already pooled"
            )));
        }
        connections.insert(peer_id.clone(), connection);
        debug!(peer_id = %peer_id, pooled = connections.len(), "Connection pooled");
        Ok(())
    }

    /// Remove and return the entry for a peer, if any.
    pub fn remove(&self, peer_id: &PeerId) -> Option<Arc<RemoteConnection>> {
        let removed = self.connections.write().remove(peer_id);
        if removed.is_some() {
            debug!(peer_id = %peer_id, "Connection removed from pool");
        }
        removed
    }

    /// All pooled connections, for track fan-out and teardown iteration.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<RemoteConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Peer-ids with a pooled entry.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.connections.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Empty the pool, returning every entry for closing.
    pub fn drain(&self) -> Vec<Arc<RemoteConnection>> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::connection::ConnectionEvent;
    use crate::media::{LocalTrack, TrackKind};
    use tokio::sync::mpsc;

    async fn test_connection(peer: &str) -> Arc<RemoteConnection> {
        let (events, _rx): (mpsc::UnboundedSender<ConnectionEvent>, _) = mpsc::unbounded_channel();
        let video = Arc::new(LocalTrack::new(TrackKind::Video, "stream-test"));
        RemoteConnection::connect(
            PeerId::from(peer),
            &MeshConfig::loopback(),
            None,
            &video,
            true,
            events,
        )
        .await
        .expect("connection")
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let pool = ConnectionPool::new();
        let peer = PeerId::from("room:a");
        assert!(!pool.contains(&peer));

        let conn = test_connection("room:a").await;
        pool.insert(Arc::clone(&conn)).expect("insert");

        assert!(pool.contains(&peer));
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&peer).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected_existing_wins() {
        let pool = ConnectionPool::new();
        let first = test_connection("room:a").await;
        let second = test_connection("room:a").await;

        pool.insert(Arc::clone(&first)).expect("first insert");
        let err = pool.insert(Arc::clone(&second)).expect_err("duplicate");
        assert!(matches!(err, Error::AlreadyExists(_)));

        // The pooled entry is still the first connection.
        let pooled = pool.get(&PeerId::from("room:a")).expect("pooled");
        assert!(Arc::ptr_eq(&pooled, &first));
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = ConnectionPool::new();
        let peer = PeerId::from("room:a");
        pool.insert(test_connection("room:a").await).expect("insert");

        assert!(pool.remove(&peer).is_some());
        assert!(pool.remove(&peer).is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties_the_pool() {
        let pool = ConnectionPool::new();
        pool.insert(test_connection("room:a").await).expect("insert a");
        pool.insert(test_connection("room:b").await).expect("insert b");

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
    }
}
