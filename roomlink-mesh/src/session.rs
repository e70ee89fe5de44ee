//! Peer session manager
//!
//! One `RoomSession` per participant per room. The session acquires local
//! media, registers with the presence registry, and drives a single event
//! loop that owns all mutable session state: presence diffing, origination
//! and acceptance of peer links, glare resolution, live track mutation and
//! teardown. Every external signal — presence snapshots, inbound signaling,
//! connection callbacks, user commands, the screen-ended signal — arrives
//! as a message on the loop channel and is handled in delivery order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use roomlink_core::{
    Error, ParticipantId, PeerId, PresenceRecord, PresenceRegistry, Result, RoomId,
};

use crate::config::MeshConfig;
use crate::connection::{ConnectionEvent, LinkState, RemoteConnection, RemoteStream};
use crate::media::{MediaController, MediaSource};
use crate::pool::ConnectionPool;
use crate::signaling::{IceCandidate, SignalMessage, SignalingTransport};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session object created, nothing acquired yet
    Initializing,
    /// Acquiring camera + microphone
    AcquiringMedia,
    /// Announcing ourselves to the presence registry
    Registering,
    /// In the room, mesh converging
    Ready,
    /// Torn down
    Closed,
}

/// Outward notifications: the render-sink contract plus lifecycle edges.
#[derive(Debug)]
pub enum SessionNotification {
    StateChanged(SessionState),
    /// Remote media is flowing; assign the peer's render sink. Emitted
    /// exactly once per peer link.
    PeerLinked {
        peer_id: PeerId,
        stream: Arc<RemoteStream>,
    },
    /// The peer's link closed; clear its render sink. Emitted exactly once
    /// per linked peer.
    PeerLeft { peer_id: PeerId },
    ScreenShareStarted,
    ScreenShareEnded,
}

/// Stream of session notifications for the UI layer.
pub struct SessionEvents {
    receiver: mpsc::UnboundedReceiver<SessionNotification>,
}

impl SessionEvents {
    /// Next notification; `None` once the session is gone.
    pub async fn next(&mut self) -> Option<SessionNotification> {
        self.receiver.recv().await
    }
}

/// Everything a session needs to join a room.
pub struct JoinOptions {
    pub config: MeshConfig,
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub media: Arc<dyn MediaSource>,
    pub registry: Arc<dyn PresenceRegistry>,
    pub transport: Arc<dyn SignalingTransport>,
    /// Inbound signaling addressed to this peer.
    pub signals: mpsc::UnboundedReceiver<SignalMessage>,
}

/// User commands, each mapping 1:1 to a controller or teardown operation.
enum SessionCommand {
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    StartScreenShare(oneshot::Sender<Result<bool>>),
    StopScreenShare(oneshot::Sender<bool>),
    Leave(oneshot::Sender<()>),
}

/// The merged loop event stream.
enum LoopEvent {
    Presence(Vec<PresenceRecord>),
    Signal(SignalMessage),
    Connection(ConnectionEvent),
    ScreenEnded,
    Command(SessionCommand),
}

/// Control surface of a joined session. Cloneable; all mutation is
/// forwarded to the session loop.
#[derive(Clone)]
pub struct RoomSession {
    peer_id: PeerId,
    room_id: RoomId,
    events: mpsc::UnboundedSender<LoopEvent>,
    state: Arc<RwLock<SessionState>>,
    pool: Arc<ConnectionPool>,
}

impl RoomSession {
    /// Join a room: acquire local media (fatal media errors surface here
    /// and the session does not start), register presence (best effort),
    /// subscribe to updates and start the session loop.
    pub async fn join(options: JoinOptions) -> Result<(Self, SessionEvents)> {
        let JoinOptions {
            config,
            room_id,
            participant_id,
            display_name,
            media,
            registry,
            transport,
            signals,
        } = options;

        let peer_id = PeerId::derive(&room_id, &participant_id);
        let state = Arc::new(RwLock::new(SessionState::Initializing));
        info!(room_id = %room_id, peer_id = %peer_id, "Joining room");

        *state.write() = SessionState::AcquiringMedia;
        let media = MediaController::acquire(media).await?;

        *state.write() = SessionState::Registering;
        if let Err(e) = registry
            .register(&room_id, &participant_id, &display_name, &peer_id)
            .await
        {
            warn!(
                room_id = %room_id,
                error = %e,
                "Presence registration failed, continuing without registry"
            );
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

        // Presence snapshots feed the loop until unsubscribed.
        match registry.subscribe(&room_id).await {
            Ok(mut subscription) => {
                let events = events_tx.clone();
                forwarders.push(tokio::spawn(async move {
                    while let Some(snapshot) = subscription.next_snapshot().await {
                        if events.send(LoopEvent::Presence(snapshot)).is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => {
                warn!(
                    room_id = %room_id,
                    error = %e,
                    "Presence subscription failed, peers must dial in directly"
                );
            }
        }

        // Inbound signaling feeds the loop.
        {
            let events = events_tx.clone();
            let mut signals = signals;
            forwarders.push(tokio::spawn(async move {
                while let Some(message) = signals.recv().await {
                    if events.send(LoopEvent::Signal(message)).is_err() {
                        break;
                    }
                }
            }));
        }

        // Connection callbacks feed the loop.
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        {
            let events = events_tx.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(event) = conn_rx.recv().await {
                    if events.send(LoopEvent::Connection(event)).is_err() {
                        break;
                    }
                }
            }));
        }

        let pool = Arc::new(ConnectionPool::new());
        *state.write() = SessionState::Ready;
        let _ = notify_tx.send(SessionNotification::StateChanged(SessionState::Ready));

        let inner = SessionInner {
            config,
            room_id: room_id.clone(),
            participant_id,
            local_peer: peer_id.clone(),
            media,
            pool: Arc::clone(&pool),
            linked: HashSet::new(),
            early_candidates: HashMap::new(),
            registry,
            transport,
            events_tx: events_tx.clone(),
            conn_tx,
            notify_tx,
            state: Arc::clone(&state),
            forwarders,
        };
        tokio::spawn(inner.run(events_rx));

        let session = Self {
            peer_id,
            room_id,
            events: events_tx,
            state,
            pool,
        };
        Ok((session, SessionEvents {
            receiver: notify_rx,
        }))
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Peers with a pooled (in-flight or flowing) link.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.pool.peer_ids()
    }

    /// Read-only view of the pool for introspection; mutation goes through
    /// session commands.
    #[must_use]
    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    /// Flip the microphone gate. Never touches pooled connections.
    pub fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.command(SessionCommand::SetAudioEnabled(enabled))
    }

    /// Flip the camera/screen gate. Never touches pooled connections.
    pub fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.command(SessionCommand::SetVideoEnabled(enabled))
    }

    /// Start sharing the screen. `Ok(false)` when the user dismissed the
    /// picker or a share is already active.
    pub async fn start_screen_share(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::StartScreenShare(reply))?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Stop sharing and restore the camera. `Ok(false)` when no share was
    /// active.
    pub async fn stop_screen_share(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::StopScreenShare(reply))?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Leave the room: stop local media, close every link, best-effort
    /// unregister. Safe to call any number of times.
    pub async fn leave(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(LoopEvent::Command(SessionCommand::Leave(reply)))
            .is_err()
        {
            return;
        }
        // A dropped reply means the loop already tore down.
        let _ = rx.await;
    }

    fn command(&self, command: SessionCommand) -> Result<()> {
        self.events
            .send(LoopEvent::Command(command))
            .map_err(|_| Error::SessionClosed)
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("peer_id", &self.peer_id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .finish()
    }
}

/// State owned exclusively by the session loop.
struct SessionInner {
    config: MeshConfig,
    room_id: RoomId,
    participant_id: ParticipantId,
    local_peer: PeerId,
    media: MediaController,
    pool: Arc<ConnectionPool>,
    /// Peers whose render sink is currently assigned.
    linked: HashSet<PeerId>,
    /// Candidates that arrived before any connection existed for the peer.
    early_candidates: HashMap<PeerId, Vec<IceCandidate>>,
    registry: Arc<dyn PresenceRegistry>,
    transport: Arc<dyn SignalingTransport>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    notify_tx: mpsc::UnboundedSender<SessionNotification>,
    state: Arc<RwLock<SessionState>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SessionInner {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LoopEvent::Presence(snapshot) => self.handle_presence(snapshot).await,
                LoopEvent::Signal(message) => self.handle_signal(message).await,
                LoopEvent::Connection(event) => self.handle_connection_event(event).await,
                LoopEvent::ScreenEnded => {
                    if self.media.stop_screen_share(&self.pool).await {
                        self.notify(SessionNotification::ScreenShareEnded);
                    }
                }
                LoopEvent::Command(command) => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
            }
        }
        debug!(room_id = %self.room_id, "Session loop stopped");
    }

    /// Diff a presence snapshot: originate toward newly present peers.
    /// Peers absent from the snapshot are deliberately left alone — a stale
    /// registry read must not kill a healthy link; departure is acted on
    /// only via connection-close signals.
    async fn handle_presence(&mut self, snapshot: Vec<PresenceRecord>) {
        if *self.state.read() != SessionState::Ready {
            return;
        }
        for record in snapshot {
            let peer = record.peer_id;
            if peer == self.local_peer || self.pool.contains(&peer) {
                continue;
            }
            debug!(peer_id = %peer, "New peer in presence snapshot");
            if let Err(e) = self.originate(peer.clone()).await {
                warn!(peer_id = %peer, error = %e, "Failed to originate connection");
                if let Some(conn) = self.pool.remove(&peer) {
                    conn.close().await;
                }
            }
        }
    }

    /// Dial a newly discovered peer: `NoLink -> Connecting`.
    async fn originate(&mut self, peer: PeerId) -> Result<()> {
        let conn = RemoteConnection::connect(
            peer.clone(),
            &self.config,
            self.media.outgoing_audio().as_ref(),
            &self.media.outgoing_video(),
            true,
            self.conn_tx.clone(),
        )
        .await?;

        if self.pool.insert(Arc::clone(&conn)).is_err() {
            // Pooled entry wins; close the superseding attempt.
            conn.close().await;
            return Ok(());
        }
        self.flush_early_candidates(&conn).await;

        let sdp = conn.offer().await?;
        self.transport
            .send(SignalMessage::Offer {
                from: self.local_peer.clone(),
                to: peer,
                sdp,
            })
            .await?;
        Ok(())
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Offer { from, sdp, .. } => self.handle_offer(from, sdp).await,
            SignalMessage::Answer { from, sdp, .. } => {
                let Some(conn) = self.pool.get(&from) else {
                    debug!(peer_id = %from, "Answer for unknown peer, dropping");
                    return;
                };
                if let Err(e) = conn.apply_answer(sdp).await {
                    warn!(peer_id = %from, error = %e, "Failed to apply answer");
                    self.drop_connection(&from).await;
                }
            }
            SignalMessage::Candidate {
                from, candidate, ..
            } => {
                if let Some(conn) = self.pool.get(&from) {
                    if let Err(e) = conn.add_remote_candidate(candidate).await {
                        warn!(peer_id = %from, error = %e, "Rejected remote candidate");
                    }
                } else {
                    self.early_candidates.entry(from).or_default().push(candidate);
                }
            }
        }
    }

    /// Inbound offer handling with glare resolution.
    ///
    /// A `Linked` entry always wins: the offer is ignored. For a
    /// `Connecting` collision the deterministic tie-break applies — the
    /// lexicographically smaller peer-id is the rightful originator, so
    /// the loser closes its own in-flight attempt and accepts.
    async fn handle_offer(&mut self, from: PeerId, sdp: String) {
        if let Some(existing) = self.pool.get(&from) {
            match existing.state() {
                LinkState::Linked => {
                    debug!(peer_id = %from, "Offer ignored, existing link wins");
                    return;
                }
                LinkState::Connecting => {
                    if existing.is_originated() && from < self.local_peer {
                        debug!(peer_id = %from, "Glare: yielding to remote originator");
                        self.pool.remove(&from);
                        existing.close().await;
                    } else {
                        debug!(peer_id = %from, "Glare: keeping local attempt, offer ignored");
                        return;
                    }
                }
                LinkState::Closed => {
                    self.pool.remove(&from);
                }
            }
        }

        if let Err(e) = self.accept(from.clone(), sdp).await {
            warn!(peer_id = %from, error = %e, "Failed to accept inbound connection");
            if let Some(conn) = self.pool.remove(&from) {
                conn.close().await;
            }
        }
    }

    /// Accept an inbound offer with the current outgoing stream:
    /// `NoLink -> Connecting`.
    async fn accept(&mut self, peer: PeerId, sdp: String) -> Result<()> {
        let conn = RemoteConnection::connect(
            peer.clone(),
            &self.config,
            self.media.outgoing_audio().as_ref(),
            &self.media.outgoing_video(),
            false,
            self.conn_tx.clone(),
        )
        .await?;

        if self.pool.insert(Arc::clone(&conn)).is_err() {
            conn.close().await;
            return Ok(());
        }

        let answer = conn.accept_offer(sdp).await?;
        self.flush_early_candidates(&conn).await;
        self.transport
            .send(SignalMessage::Answer {
                from: self.local_peer.clone(),
                to: peer,
                sdp: answer,
            })
            .await?;
        Ok(())
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate { peer_id, candidate } => {
                if let Err(e) = self
                    .transport
                    .send(SignalMessage::Candidate {
                        from: self.local_peer.clone(),
                        to: peer_id.clone(),
                        candidate,
                    })
                    .await
                {
                    debug!(peer_id = %peer_id, error = %e, "Failed to trickle candidate");
                }
            }
            ConnectionEvent::StreamArrived {
                peer_id,
                connection_id,
            } => {
                let Some(conn) = self.pool.get(&peer_id) else {
                    return;
                };
                if conn.id() != connection_id {
                    debug!(peer_id = %peer_id, "Stream from superseded attempt, ignoring");
                    return;
                }
                if conn.mark_linked() {
                    self.linked.insert(peer_id.clone());
                    info!(peer_id = %peer_id, pooled = self.pool.len(), "Peer linked");
                    self.notify(SessionNotification::PeerLinked {
                        peer_id,
                        stream: conn.remote_stream(),
                    });
                }
            }
            ConnectionEvent::Closed {
                peer_id,
                connection_id,
            } => {
                // A close from a superseded attempt must not tear down the
                // entry that replaced it.
                let Some(pooled) = self.pool.get(&peer_id) else {
                    return;
                };
                if pooled.id() != connection_id {
                    debug!(peer_id = %peer_id, "Close from superseded attempt, ignoring");
                    return;
                }
                self.drop_connection(&peer_id).await;
            }
        }
    }

    /// Hand candidates that arrived before the connection existed over to
    /// it; the connection buffers them until its remote description is set.
    async fn flush_early_candidates(&mut self, conn: &Arc<RemoteConnection>) {
        let Some(candidates) = self.early_candidates.remove(conn.peer_id()) else {
            return;
        };
        for candidate in candidates {
            if let Err(e) = conn.add_remote_candidate(candidate).await {
                warn!(peer_id = %conn.peer_id(), error = %e, "Early candidate rejected");
            }
        }
    }

    /// Remove a peer's entry, close it and clear its render sink.
    async fn drop_connection(&mut self, peer: &PeerId) {
        if let Some(conn) = self.pool.remove(peer) {
            conn.close().await;
            info!(peer_id = %peer, pooled = self.pool.len(), "Peer link closed");
        }
        self.early_candidates.remove(peer);
        if self.linked.remove(peer) {
            self.notify(SessionNotification::PeerLeft {
                peer_id: peer.clone(),
            });
        }
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SetAudioEnabled(enabled) => {
                self.media.set_audio_enabled(enabled);
            }
            SessionCommand::SetVideoEnabled(enabled) => {
                self.media.set_video_enabled(enabled);
            }
            SessionCommand::StartScreenShare(reply) => {
                let result = self.start_screen_share().await;
                let _ = reply.send(result);
            }
            SessionCommand::StopScreenShare(reply) => {
                let stopped = self.media.stop_screen_share(&self.pool).await;
                if stopped {
                    self.notify(SessionNotification::ScreenShareEnded);
                }
                let _ = reply.send(stopped);
            }
            SessionCommand::Leave(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn start_screen_share(&mut self) -> Result<bool> {
        let Some(mut ended) = self.media.start_screen_share(&self.pool).await? else {
            return Ok(false);
        };

        // Capture-side ended signal (user stopped sharing via OS chrome)
        // funnels into the loop like every other event.
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while ended.changed().await.is_ok() {
                if *ended.borrow() {
                    let _ = events.send(LoopEvent::ScreenEnded);
                    break;
                }
            }
        });

        self.notify(SessionNotification::ScreenShareStarted);
        Ok(true)
    }

    /// Idempotent teardown: stop capture, close every link, best-effort
    /// unregister. Partial failures are logged, never raised.
    async fn teardown(&mut self) {
        if *self.state.read() == SessionState::Closed {
            return;
        }
        info!(room_id = %self.room_id, peer_id = %self.local_peer, "Leaving room");

        self.media.shutdown();

        for conn in self.pool.drain() {
            let peer = conn.peer_id().clone();
            conn.close().await;
            if self.linked.remove(&peer) {
                self.notify(SessionNotification::PeerLeft { peer_id: peer });
            }
        }
        self.early_candidates.clear();

        if let Err(e) = self
            .registry
            .unregister(&self.room_id, &self.participant_id)
            .await
        {
            warn!(room_id = %self.room_id, error = %e, "Best-effort unregister failed");
        }

        for task in self.forwarders.drain(..) {
            task.abort();
        }

        *self.state.write() = SessionState::Closed;
        self.notify(SessionNotification::StateChanged(SessionState::Closed));
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.notify_tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AcquireFailure, SyntheticMediaSource};
    use crate::signaling::MemorySignaling;
    use roomlink_core::MemoryPresenceRegistry;

    fn join_options(
        room: &RoomId,
        participant: &str,
        registry: &Arc<MemoryPresenceRegistry>,
        router: &MemorySignaling,
        media: Arc<SyntheticMediaSource>,
    ) -> JoinOptions {
        let participant_id = ParticipantId::from(participant);
        let peer_id = PeerId::derive(room, &participant_id);
        let (transport, signals) = router.attach(peer_id);
        JoinOptions {
            config: MeshConfig::loopback(),
            room_id: room.clone(),
            participant_id,
            display_name: participant.to_string(),
            media,
            registry: Arc::clone(registry) as Arc<dyn PresenceRegistry>,
            transport,
            signals,
        }
    }

    #[tokio::test]
    async fn test_fatal_media_error_aborts_join() {
        let registry = Arc::new(MemoryPresenceRegistry::new());
        let router = MemorySignaling::new();
        let media = Arc::new(SyntheticMediaSource::new());
        media.fail_camera(AcquireFailure::PermissionDenied);

        let room = RoomId::from("room-1");
        let result = RoomSession::join(join_options(&room, "alice", &registry, &router, media)).await;
        let err = result.err().expect("join must fail");
        assert!(err.is_fatal());

        // Nothing was registered.
        assert_eq!(registry.member_count(&room), 0);
    }

    #[tokio::test]
    async fn test_join_registers_and_reaches_ready() {
        let registry = Arc::new(MemoryPresenceRegistry::new());
        let router = MemorySignaling::new();
        let media = Arc::new(SyntheticMediaSource::new());

        let room = RoomId::from("room-1");
        let (session, mut events) =
            RoomSession::join(join_options(&room, "alice", &registry, &router, media))
                .await
                .expect("join");

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.peer_id().as_str(), "room-1:alice");
        assert_eq!(registry.member_count(&room), 1);

        let first = events.next().await.expect("notification");
        assert!(matches!(
            first,
            SessionNotification::StateChanged(SessionState::Ready)
        ));

        session.leave().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.member_count(&room), 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = Arc::new(MemoryPresenceRegistry::new());
        let router = MemorySignaling::new();
        let media = Arc::new(SyntheticMediaSource::new());

        let room = RoomId::from("room-1");
        let (session, _events) =
            RoomSession::join(join_options(&room, "alice", &registry, &router, Arc::clone(&media)))
                .await
                .expect("join");

        session.leave().await;
        session.leave().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(media.live_streams(), 0);
        assert!(session.connected_peers().is_empty());
    }
}
