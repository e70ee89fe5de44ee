//! Signaling wire shapes and transport seam
//!
//! Peers exchange offers, answers and trickled ICE candidates through an
//! external signaling channel. The engine only consumes this seam: it sends
//! through a `SignalingTransport` and receives inbound messages on a
//! channel handed to the session at join time. `MemorySignaling` is the
//! in-process router used by tests and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use roomlink_core::{Error, PeerId, Result};

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP mline index
    pub sdp_mline_index: Option<u16>,
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Offer to establish a connection
    Offer {
        from: PeerId,
        to: PeerId,
        sdp: String,
    },
    /// Answer to an offer
    Answer {
        from: PeerId,
        to: PeerId,
        sdp: String,
    },
    /// Trickled ICE candidate
    Candidate {
        from: PeerId,
        to: PeerId,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    /// Sending peer.
    #[must_use]
    pub const fn from_peer(&self) -> &PeerId {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::Candidate { from, .. } => {
                from
            }
        }
    }

    /// Addressed peer.
    #[must_use]
    pub const fn to_peer(&self) -> &PeerId {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => to,
        }
    }
}

/// Outbound half of the signaling channel.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Deliver a message to the peer it is addressed to.
    async fn send(&self, message: SignalMessage) -> Result<()>;
}

/// In-process signaling router: direct per-peer mailboxes, no network.
#[derive(Clone, Default)]
pub struct MemorySignaling {
    mailboxes: Arc<DashMap<PeerId, mpsc::UnboundedSender<SignalMessage>>>,
}

impl MemorySignaling {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer to the router. Returns the transport handle the peer
    /// sends through and the receiver its session drains.
    #[must_use]
    pub fn attach(&self, peer_id: PeerId) -> (Arc<MemorySignalingPeer>, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.insert(peer_id.clone(), tx);
        debug!(peer_id = %peer_id, "Peer attached to signaling router");

        let transport = Arc::new(MemorySignalingPeer {
            mailboxes: Arc::clone(&self.mailboxes),
            peer_id,
        });
        (transport, rx)
    }

    /// Detach a peer; later messages addressed to it fail.
    pub fn detach(&self, peer_id: &PeerId) {
        self.mailboxes.remove(peer_id);
        debug!(peer_id = %peer_id, "Peer detached from signaling router");
    }
}

/// One attached peer's sending handle.
pub struct MemorySignalingPeer {
    mailboxes: Arc<DashMap<PeerId, mpsc::UnboundedSender<SignalMessage>>>,
    peer_id: PeerId,
}

#[async_trait]
impl SignalingTransport for MemorySignalingPeer {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        let to = message.to_peer().clone();
        let Some(mailbox) = self.mailboxes.get(&to) else {
            return Err(Error::Signaling(format!("no route to peer {to}")));
        };
        mailbox
            .send(message)
            .map_err(|_| Error::Signaling(format!("peer {to} stopped receiving")))
    }
}

impl Drop for MemorySignalingPeer {
    fn drop(&mut self) {
        // A re-attach replaces the mailbox; only reap it if it is still
        // the dead one belonging to this handle.
        self.mailboxes
            .remove_if(&self.peer_id, |_, sender| sender.is_closed());
    }
}
