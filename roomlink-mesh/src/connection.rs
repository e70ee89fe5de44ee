//! Per-peer connection lifecycle
//!
//! One `RemoteConnection` per remote peer-id, owning the underlying
//! `RTCPeerConnection`, the outgoing senders and the link state machine
//! (`Connecting -> Linked -> Closed`). WebRTC callbacks never mutate
//! session state; they only emit `ConnectionEvent`s into the session loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use roomlink_core::{Error, PeerId, Result};

use crate::config::MeshConfig;
use crate::media::LocalTrack;
use crate::signaling::IceCandidate;

/// Per-peer link state. `NoLink` is the absence of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Offer/answer in flight, no remote media yet
    Connecting,
    /// Remote media arrived; the link is flowing
    Linked,
    /// Torn down locally or remotely
    Closed,
}

/// Events a connection emits into the session loop.
///
/// `StreamArrived` and `Closed` carry the emitting connection's id so the
/// session can ignore stragglers from a superseded attempt for the same
/// peer (a glare loser closing after its replacement was pooled).
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A local ICE candidate to trickle to the peer
    LocalCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    /// First remote media arrived for this peer
    StreamArrived {
        peer_id: PeerId,
        connection_id: String,
    },
    /// The transport reported the link failed or closed
    Closed {
        peer_id: PeerId,
        connection_id: String,
    },
}

/// Remote media attached to one peer link. Handed to the render sink on
/// the `Linked` transition; track slots fill as media arrives.
pub struct RemoteStream {
    peer_id: PeerId,
    audio: RwLock<Option<Arc<TrackRemote>>>,
    video: RwLock<Option<Arc<TrackRemote>>>,
}

impl RemoteStream {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            audio: RwLock::new(None),
            video: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn audio(&self) -> Option<Arc<TrackRemote>> {
        self.audio.read().clone()
    }

    #[must_use]
    pub fn video(&self) -> Option<Arc<TrackRemote>> {
        self.video.read().clone()
    }

    fn attach(&self, track: Arc<TrackRemote>) {
        match track.kind() {
            RTPCodecType::Audio => *self.audio.write() = Some(track),
            _ => *self.video.write() = Some(track),
        }
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("peer_id", &self.peer_id)
            .field("has_audio", &self.audio.read().is_some())
            .field("has_video", &self.video.read().is_some())
            .finish()
    }
}

/// One live (or in-flight) link to a remote peer.
pub struct RemoteConnection {
    id: String,
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    state: RwLock<LinkState>,
    originated: bool,
    video_sender: Arc<RTCRtpSender>,
    outgoing_video_id: RwLock<String>,
    remote: Arc<RemoteStream>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    closed: AtomicBool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl RemoteConnection {
    /// Build the peer connection for one remote peer, attach the current
    /// outgoing tracks and wire its callbacks into the session loop.
    ///
    /// `originated` marks connections this session dialed (it sent the
    /// offer), which the glare tie-break inspects.
    pub async fn connect(
        peer_id: PeerId,
        config: &MeshConfig,
        audio: Option<&Arc<LocalTrack>>,
        video: &Arc<LocalTrack>,
        originated: bool,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<Self>> {
        let id = roomlink_core::models::generate_id();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::connection(peer_id.clone(), e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::connection(peer_id.clone(), e.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        if config.ice_disconnected_timeout_ms.is_some()
            || config.ice_failed_timeout_ms.is_some()
            || config.ice_keepalive_interval_ms.is_some()
        {
            setting_engine.set_ice_timeouts(
                config
                    .ice_disconnected_timeout_ms
                    .map(std::time::Duration::from_millis),
                config
                    .ice_failed_timeout_ms
                    .map(std::time::Duration::from_millis),
                config
                    .ice_keepalive_interval_ms
                    .map(std::time::Duration::from_millis),
            );
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(config.rtc_configuration())
                .await
                .map_err(|e| Error::connection(peer_id.clone(), e.to_string()))?,
        );

        if let Some(audio) = audio {
            pc.add_track(audio.rtp_track())
                .await
                .map_err(|e| Error::connection(peer_id.clone(), e.to_string()))?;
        }
        let video_sender = pc
            .add_track(video.rtp_track())
            .await
            .map_err(|e| Error::connection(peer_id.clone(), e.to_string()))?;

        let remote = Arc::new(RemoteStream::new(peer_id.clone()));

        // Trickle local candidates out through the session loop.
        {
            let events = events.clone();
            let peer_id = peer_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(ConnectionEvent::LocalCandidate {
                                peer_id: peer_id.clone(),
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            });
                        }
                        Err(e) => {
                            warn!(peer_id = %peer_id, error = %e, "Failed to serialize local candidate");
                        }
                    }
                }
                Box::pin(async {})
            }));
        }

        // Remote media: first arriving track reports the stream once.
        {
            let events = events.clone();
            let peer_id = peer_id.clone();
            let connection_id = id.clone();
            let remote = Arc::clone(&remote);
            let stream_reported = Arc::new(AtomicBool::new(false));
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                debug!(
                    peer_id = %peer_id,
                    track_id = %track.id(),
                    kind = ?track.kind(),
                    "Remote track arrived"
                );
                remote.attach(track);
                if !stream_reported.swap(true, Ordering::SeqCst) {
                    let _ = events.send(ConnectionEvent::StreamArrived {
                        peer_id: peer_id.clone(),
                        connection_id: connection_id.clone(),
                    });
                }
                Box::pin(async {})
            }));
        }

        // Transport-reported lifecycle. `Failed` and `Closed` are close
        // signals; `Disconnected` can recover and is only logged.
        {
            let peer_id = peer_id.clone();
            let connection_id = id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                match state {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        let _ = events.send(ConnectionEvent::Closed {
                            peer_id: peer_id.clone(),
                            connection_id: connection_id.clone(),
                        });
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(peer_id = %peer_id, "Peer link disconnected, waiting for recovery or failure");
                    }
                    other => {
                        debug!(peer_id = %peer_id, state = ?other, "Peer link state changed");
                    }
                }
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(Self {
            id,
            peer_id,
            pc,
            state: RwLock::new(LinkState::Connecting),
            originated,
            video_sender,
            outgoing_video_id: RwLock::new(video.id().to_string()),
            remote,
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created_at: chrono::Utc::now(),
        }))
    }

    /// Unique id of this connection attempt (distinct from the peer-id:
    /// a peer can be dialed again after a closed attempt).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    #[must_use]
    pub const fn is_originated(&self) -> bool {
        self.originated
    }

    #[must_use]
    pub fn remote_stream(&self) -> Arc<RemoteStream> {
        Arc::clone(&self.remote)
    }

    /// Track id currently feeding this link's outgoing video sender.
    #[must_use]
    pub fn outgoing_video_id(&self) -> String {
        self.outgoing_video_id.read().clone()
    }

    /// Create and install the local offer; returns its SDP for signaling.
    pub async fn offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        Ok(sdp)
    }

    /// Apply a remote offer and produce the local answer SDP.
    pub async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        Ok(sdp)
    }

    /// Apply the remote answer to an offer this session originated.
    pub async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Add a trickled remote candidate. Candidates arriving before the
    /// remote description are buffered and flushed once it is set.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().drain(..).collect();
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(peer_id = %self.peer_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    /// Swap the outgoing video sender's track in place. No renegotiation,
    /// the connection is never closed or recreated. Idempotent for the
    /// track already installed.
    pub async fn replace_video_track(&self, track: &Arc<LocalTrack>) -> Result<()> {
        if *self.outgoing_video_id.read() == track.id() {
            return Ok(());
        }

        self.video_sender
            .replace_track(Some(track.rtp_track()))
            .await
            .map_err(|e| Error::connection(self.peer_id.clone(), e.to_string()))?;
        *self.outgoing_video_id.write() = track.id().to_string();
        debug!(peer_id = %self.peer_id, track_id = %track.id(), "Outgoing video replaced");
        Ok(())
    }

    /// `Connecting -> Linked`. Returns whether the transition happened,
    /// so the caller assigns the render sink exactly once.
    pub fn mark_linked(&self) -> bool {
        let mut state = self.state.write();
        if *state == LinkState::Connecting {
            *state = LinkState::Linked;
            true
        } else {
            false
        }
    }

    /// Close the link. Idempotent and never fails; close errors from the
    /// transport are logged and swallowed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write() = LinkState::Closed;
        if let Err(e) = self.pc.close().await {
            debug!(peer_id = %self.peer_id, error = %e, "Error closing peer connection");
        }
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .field("originated", &self.originated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, TrackKind};

    fn test_tracks() -> (Arc<LocalTrack>, Arc<LocalTrack>) {
        (
            Arc::new(LocalTrack::new(TrackKind::Audio, "stream-test")),
            Arc::new(LocalTrack::new(TrackKind::Video, "stream-test")),
        )
    }

    async fn test_connection(peer: &str) -> (Arc<RemoteConnection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (audio, video) = test_tracks();
        let conn = RemoteConnection::connect(
            PeerId::from(peer),
            &MeshConfig::loopback(),
            Some(&audio),
            &video,
            true,
            events,
        )
        .await
        .expect("connection");
        (conn, rx)
    }

    #[tokio::test]
    async fn test_offer_contains_media_sections() {
        let (conn, _rx) = test_connection("room:peer-a").await;
        let sdp = conn.offer().await.expect("offer");
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
    }

    #[tokio::test]
    async fn test_linked_transition_happens_once() {
        let (conn, _rx) = test_connection("room:peer-a").await;
        assert_eq!(conn.state(), LinkState::Connecting);

        assert!(conn.mark_linked());
        assert_eq!(conn.state(), LinkState::Linked);

        // Second arrival does not re-assign the sink.
        assert!(!conn.mark_linked());
    }

    #[tokio::test]
    async fn test_replace_same_track_is_idempotent() {
        let (conn, _rx) = test_connection("room:peer-a").await;
        let current = conn.outgoing_video_id();

        let (_, video) = test_tracks();
        conn.replace_video_track(&video).await.expect("replace");
        assert_eq!(conn.outgoing_video_id(), video.id());
        assert_ne!(conn.outgoing_video_id(), current);

        // Replacing with the installed track is a no-op.
        conn.replace_video_track(&video).await.expect("idempotent");
        assert_eq!(conn.outgoing_video_id(), video.id());
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let (conn, _rx) = test_connection("room:peer-a").await;

        conn.add_remote_candidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 127.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        })
        .await
        .expect("buffered");
        assert_eq!(conn.pending_candidates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _rx) = test_connection("room:peer-a").await;
        conn.close().await;
        assert_eq!(conn.state(), LinkState::Closed);
        conn.close().await;
        assert_eq!(conn.state(), LinkState::Closed);

        // Linked never overrides Closed.
        assert!(!conn.mark_linked());
    }
}
