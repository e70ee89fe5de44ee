//! Local media capture and the media source controller
//!
//! This module handles:
//! - Local track wrappers with an in-place enabled gate (mute/unmute never
//!   rebuilds a stream or touches a connection)
//! - The `MediaSource` capture seam (camera/screen backends)
//! - A synthetic capture backend for tests and headless runs
//! - The controller that owns the single outgoing stream (camera XOR
//!   screen) and fans track swaps out across pooled connections

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use roomlink_core::models::generate_id;
use roomlink_core::{Error, PeerId, Result};

use crate::pool::ConnectionPool;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a local stream was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Camera,
    Screen,
}

/// A local outgoing track: the RTP-facing sample track plus an enabled
/// gate flipped in place by mute/unmute.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl LocalTrack {
    /// Create a track of the given kind bound to a capture stream id.
    #[must_use]
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (capability, prefix) = match kind {
            TrackKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio",
            ),
            TrackKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video",
            ),
        };

        let id = format!("{prefix}-{}", generate_id());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));

        Self {
            id,
            kind,
            rtp,
            enabled: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The track as the trait object `add_track`/`replace_track` expect.
    #[must_use]
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Flip the enabled gate in place. Disabled tracks silently drop
    /// captured samples; the sender and its negotiated state are untouched.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Write one captured sample through the gate.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtp
            .write_sample(sample)
            .await
            .map_err(|e| Error::Internal(format!("sample write failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// One captured local stream: camera (audio + video) or screen (video).
///
/// A screen stream carries an externally-triggerable ended signal — the
/// capture backend fires it when the user stops sharing through OS/browser
/// chrome; the session fires the same signal on a user-driven stop.
pub struct LocalStream {
    id: String,
    kind: StreamKind,
    audio: Option<Arc<LocalTrack>>,
    video: Arc<LocalTrack>,
    ended: Arc<watch::Sender<bool>>,
    stopped: Arc<AtomicBool>,
}

impl LocalStream {
    /// Create a stream shell; the capture backend pumps samples into the
    /// tracks until `stop` is observed.
    #[must_use]
    pub fn new(kind: StreamKind, audio: Option<Arc<LocalTrack>>, video: Arc<LocalTrack>) -> Self {
        let prefix = match kind {
            StreamKind::Camera => "camera",
            StreamKind::Screen => "screen",
        };
        let (ended, _) = watch::channel(false);
        Self {
            id: format!("{prefix}-{}", generate_id()),
            kind,
            audio,
            video,
            ended: Arc::new(ended),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    #[must_use]
    pub fn audio(&self) -> Option<Arc<LocalTrack>> {
        self.audio.clone()
    }

    #[must_use]
    pub fn video(&self) -> Arc<LocalTrack> {
        Arc::clone(&self.video)
    }

    /// Subscribe to the ended signal.
    #[must_use]
    pub fn ended_rx(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Fire the ended signal. Safe to call more than once; observers react
    /// to the first edge only.
    pub fn signal_ended(&self) {
        self.ended.send_replace(true);
    }

    /// Handle the capture backend uses to fire the ended signal after the
    /// stream has been handed off.
    #[must_use]
    pub fn ended_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.ended)
    }

    /// Flag the capture backend watches to halt its pump tasks.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Stop capture. The pump tasks observe the flag and exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Capture backend seam. Device-native backends (camera/microphone,
/// display capture) implement this outside the engine; the in-crate
/// synthetic backend serves tests and headless runs.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire the camera + microphone stream.
    ///
    /// Fails with `PermissionDenied` or `DeviceNotFound`; both are fatal to
    /// the session.
    async fn acquire_camera(&self) -> Result<LocalStream>;

    /// Acquire a screen-capture stream.
    ///
    /// Fails with `PermissionDenied`, or `UserCancelled` when the user
    /// dismisses the picker (not an error to the session).
    async fn acquire_screen(&self) -> Result<LocalStream>;
}

/// Injectable acquisition failure for the synthetic backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    PermissionDenied,
    DeviceNotFound,
    UserCancelled,
}

impl AcquireFailure {
    fn into_error(self, what: &str) -> Error {
        match self {
            Self::PermissionDenied => Error::PermissionDenied(what.to_string()),
            Self::DeviceNotFound => Error::DeviceNotFound(what.to_string()),
            Self::UserCancelled => Error::UserCancelled,
        }
    }
}

/// Handle onto a stream the synthetic backend has produced.
#[derive(Clone)]
pub struct StreamProbe {
    pub kind: StreamKind,
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Arc<LocalTrack>,
    stopped: Arc<AtomicBool>,
    ended: Arc<watch::Sender<bool>>,
}

impl StreamProbe {
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::Relaxed)
    }
}

/// Synthetic capture backend: pumps timed blank samples into its tracks.
pub struct SyntheticMediaSource {
    frame_interval: Duration,
    camera_failure: Mutex<Option<AcquireFailure>>,
    screen_failure: Mutex<Option<AcquireFailure>>,
    streams: Mutex<Vec<StreamProbe>>,
}

impl SyntheticMediaSource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(33))
    }

    /// Backend pumping one blank sample per `interval`.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            frame_interval: interval,
            camera_failure: Mutex::new(None),
            screen_failure: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `acquire_camera` fail.
    pub fn fail_camera(&self, failure: AcquireFailure) {
        *self.camera_failure.lock() = Some(failure);
    }

    /// Make the next `acquire_screen` fail.
    pub fn fail_screen(&self, failure: AcquireFailure) {
        *self.screen_failure.lock() = Some(failure);
    }

    /// Number of streams still capturing.
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.streams.lock().iter().filter(|s| s.is_live()).count()
    }

    /// Probe for the most recently acquired stream of a kind.
    #[must_use]
    pub fn last_stream(&self, kind: StreamKind) -> Option<StreamProbe> {
        self.streams
            .lock()
            .iter()
            .rev()
            .find(|s| s.kind == kind)
            .cloned()
    }

    /// Simulate the OS/browser "user stopped sharing" chrome: fires the
    /// ended signal of the most recent screen stream.
    pub fn end_screen(&self) {
        if let Some(probe) = self.last_stream(StreamKind::Screen) {
            probe.ended.send_replace(true);
        }
    }

    fn build_stream(&self, kind: StreamKind) -> LocalStream {
        let stream_tag = generate_id();
        let audio = match kind {
            StreamKind::Camera => Some(Arc::new(LocalTrack::new(TrackKind::Audio, &stream_tag))),
            StreamKind::Screen => None,
        };
        let video = Arc::new(LocalTrack::new(TrackKind::Video, &stream_tag));
        let stream = LocalStream::new(kind, audio.clone(), Arc::clone(&video));

        self.streams.lock().push(StreamProbe {
            kind,
            audio: audio.clone(),
            video: Arc::clone(&video),
            stopped: stream.stop_flag(),
            ended: stream.ended_handle(),
        });

        // Pump blank samples until stopped.
        let stopped = stream.stop_flag();
        let interval = self.frame_interval;
        tokio::spawn(async move {
            let sample = Sample {
                data: Bytes::from_static(&[0u8; 16]),
                duration: interval,
                ..Default::default()
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(audio) = &audio {
                    let _ = audio.write_sample(&sample).await;
                }
                let _ = video.write_sample(&sample).await;
            }
            debug!(kind = ?kind, "Synthetic capture pump stopped");
        });

        stream
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire_camera(&self) -> Result<LocalStream> {
        if let Some(failure) = self.camera_failure.lock().take() {
            return Err(failure.into_error("camera"));
        }
        Ok(self.build_stream(StreamKind::Camera))
    }

    async fn acquire_screen(&self) -> Result<LocalStream> {
        if let Some(failure) = self.screen_failure.lock().take() {
            return Err(failure.into_error("screen"));
        }
        Ok(self.build_stream(StreamKind::Screen))
    }
}

/// Owns the local capture state: the camera stream, a transient screen
/// stream, the enabled flags, and the single current outgoing video slot
/// (the local preview). All mutation happens on the session loop.
pub struct MediaController {
    source: Arc<dyn MediaSource>,
    camera: LocalStream,
    screen: Option<LocalStream>,
    audio_enabled: bool,
    video_enabled: bool,
    preview: Arc<RwLock<Arc<LocalTrack>>>,
}

impl MediaController {
    /// Acquire the camera from the capture backend. Fatal media errors
    /// (`PermissionDenied`, `DeviceNotFound`) propagate to the caller.
    pub async fn acquire(source: Arc<dyn MediaSource>) -> Result<Self> {
        let camera = source.acquire_camera().await?;
        let preview = Arc::new(RwLock::new(camera.video()));

        info!(stream_id = %camera.id(), "Local camera acquired");

        Ok(Self {
            source,
            camera,
            screen: None,
            audio_enabled: true,
            video_enabled: true,
            preview,
        })
    }

    /// The video track currently going out to peers (screen wins over
    /// camera while a share is active).
    #[must_use]
    pub fn outgoing_video(&self) -> Arc<LocalTrack> {
        self.screen
            .as_ref()
            .map_or_else(|| self.camera.video(), LocalStream::video)
    }

    /// The microphone track sent on every connection.
    #[must_use]
    pub fn outgoing_audio(&self) -> Option<Arc<LocalTrack>> {
        self.camera.audio()
    }

    /// Track currently shown in the local preview sink.
    #[must_use]
    pub fn preview_track(&self) -> Arc<LocalTrack> {
        Arc::clone(&self.preview.read())
    }

    #[must_use]
    pub const fn is_audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    #[must_use]
    pub const fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    #[must_use]
    pub const fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Flip the microphone gate in place. Never touches a connection.
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        if let Some(audio) = self.camera.audio() {
            audio.set_enabled(enabled);
        }
        debug!(enabled, "Audio gate flipped");
    }

    /// Flip the video gate in place on every local video track. Never
    /// touches a connection.
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        self.camera.video().set_enabled(enabled);
        if let Some(screen) = &self.screen {
            screen.video().set_enabled(enabled);
        }
        debug!(enabled, "Video gate flipped");
    }

    /// Start a screen share: acquire the screen stream and swap its video
    /// track into the preview and every pooled connection in place.
    ///
    /// Returns the ended-signal receiver when a share started, `None` when
    /// already sharing or the user dismissed the picker.
    pub async fn start_screen_share(
        &mut self,
        pool: &ConnectionPool,
    ) -> Result<Option<watch::Receiver<bool>>> {
        if self.screen.is_some() {
            debug!("Screen share already active, ignoring");
            return Ok(None);
        }

        let stream = match self.source.acquire_screen().await {
            Ok(stream) => stream,
            Err(Error::UserCancelled) => {
                debug!("Screen share picker dismissed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        stream.video().set_enabled(self.video_enabled);
        let ended = stream.ended_rx();
        let video = stream.video();
        self.screen = Some(stream);

        let failures = self.swap_outgoing_video(&video, pool).await;
        info!(
            pooled = pool.len(),
            failed = failures.len(),
            "Screen share started"
        );

        Ok(Some(ended))
    }

    /// End the current screen share and restore the camera as outgoing
    /// video everywhere, through the same in-place replacement path.
    ///
    /// Both the user-driven stop and the capture-side ended signal funnel
    /// here; the `take` makes the restore run exactly once per share.
    pub async fn stop_screen_share(&mut self, pool: &ConnectionPool) -> bool {
        let Some(screen) = self.screen.take() else {
            return false;
        };

        // Wake any watcher of the capture-side signal; the restore below
        // already ran by the time a raced trigger re-enters here.
        screen.signal_ended();
        screen.stop();
        let camera_video = self.camera.video();
        let failures = self.swap_outgoing_video(&camera_video, pool).await;
        info!(
            pooled = pool.len(),
            failed = failures.len(),
            "Screen share ended, camera restored"
        );
        true
    }

    /// Replace the outgoing video track on the local preview and on every
    /// pooled connection. Per-peer failures are isolated and reported; the
    /// swap is never rolled back for peers that succeeded.
    pub async fn swap_outgoing_video(
        &self,
        track: &Arc<LocalTrack>,
        pool: &ConnectionPool,
    ) -> Vec<(PeerId, Error)> {
        {
            let mut preview = self.preview.write();
            if preview.id() != track.id() {
                *preview = Arc::clone(track);
            }
        }

        let mut failures = Vec::new();
        for connection in pool.connections() {
            if let Err(e) = connection.replace_video_track(track).await {
                warn!(
                    peer_id = %connection.peer_id(),
                    error = %e,
                    "Video track replacement failed for peer"
                );
                failures.push((connection.peer_id().clone(), e));
            }
        }
        failures
    }

    /// Stop all local capture. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.camera.stop();
        debug!("Local media stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_gate_flips_in_place() {
        let track = LocalTrack::new(TrackKind::Audio, "stream-1");
        assert!(track.is_enabled());

        track.set_enabled(false);
        assert!(!track.is_enabled());

        // Writing through a disabled gate is a silent drop, not an error.
        let sample = Sample {
            data: Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        track.write_sample(&sample).await.expect("gated write");

        track.set_enabled(true);
        assert!(track.is_enabled());
    }

    #[tokio::test]
    async fn test_synthetic_camera_failures() {
        let source = SyntheticMediaSource::new();

        source.fail_camera(AcquireFailure::PermissionDenied);
        let err = source.acquire_camera().await.expect_err("must fail");
        assert!(matches!(err, Error::PermissionDenied(_)));

        // The failure is one-shot; the next acquisition succeeds.
        let stream = source.acquire_camera().await.expect("camera");
        assert!(stream.is_live());
        assert!(stream.audio().is_some());
    }

    #[tokio::test]
    async fn test_screen_ended_signal_fires_once_watchers_react_once() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire_screen().await.expect("screen");
        let mut rx = stream.ended_rx();

        assert!(!*rx.borrow());
        source.end_screen();
        rx.changed().await.expect("ended edge");
        assert!(*rx.borrow());

        // Second trigger does not produce a second edge for a consumer
        // that already observed the first.
        stream.signal_ended();
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_stop_halts_capture() {
        let source = SyntheticMediaSource::new();
        let stream = source.acquire_camera().await.expect("camera");
        assert_eq!(source.live_streams(), 1);

        stream.stop();
        assert_eq!(source.live_streams(), 0);
        assert!(!stream.is_live());
    }

    #[tokio::test]
    async fn test_screen_share_swaps_and_restores_once() {
        let source = Arc::new(SyntheticMediaSource::new());
        let pool = ConnectionPool::new();
        let mut controller = MediaController::acquire(source.clone() as Arc<dyn MediaSource>)
            .await
            .expect("camera");

        let camera_video_id = controller.outgoing_video().id().to_string();

        let ended = controller
            .start_screen_share(&pool)
            .await
            .expect("screen share");
        assert!(ended.is_some());
        assert!(controller.is_screen_sharing());
        assert_ne!(controller.outgoing_video().id(), camera_video_id);
        assert_eq!(controller.preview_track().id(), controller.outgoing_video().id());

        // Starting again while active is a no-op.
        let again = controller.start_screen_share(&pool).await.expect("no-op");
        assert!(again.is_none());

        // First stop restores the camera; the second is a no-op regardless
        // of which trigger raced in first.
        assert!(controller.stop_screen_share(&pool).await);
        assert!(!controller.stop_screen_share(&pool).await);
        assert_eq!(controller.outgoing_video().id(), camera_video_id);
        assert_eq!(controller.preview_track().id(), camera_video_id);

        // The screen capture stream is no longer live; the camera is.
        assert_eq!(source.live_streams(), 1);
    }

    #[tokio::test]
    async fn test_screen_share_cancel_is_a_no_op() {
        let source = Arc::new(SyntheticMediaSource::new());
        let pool = ConnectionPool::new();
        let mut controller = MediaController::acquire(source.clone() as Arc<dyn MediaSource>)
            .await
            .expect("camera");

        source.fail_screen(AcquireFailure::UserCancelled);
        let started = controller.start_screen_share(&pool).await.expect("no-op");
        assert!(started.is_none());
        assert!(!controller.is_screen_sharing());
    }

    #[tokio::test]
    async fn test_video_toggle_applies_to_screen_too() {
        let source = Arc::new(SyntheticMediaSource::new());
        let pool = ConnectionPool::new();
        let mut controller = MediaController::acquire(source.clone() as Arc<dyn MediaSource>)
            .await
            .expect("camera");

        controller.set_video_enabled(false);
        controller
            .start_screen_share(&pool)
            .await
            .expect("screen share");

        // A share started while video is muted comes up muted.
        assert!(!controller.outgoing_video().is_enabled());

        controller.set_video_enabled(true);
        assert!(controller.outgoing_video().is_enabled());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let source = Arc::new(SyntheticMediaSource::new());
        let pool = ConnectionPool::new();
        let mut controller = MediaController::acquire(source.clone() as Arc<dyn MediaSource>)
            .await
            .expect("camera");
        controller
            .start_screen_share(&pool)
            .await
            .expect("screen share");
        assert_eq!(source.live_streams(), 2);

        controller.shutdown();
        assert_eq!(source.live_streams(), 0);

        // Idempotent.
        controller.shutdown();
        assert_eq!(source.live_streams(), 0);
    }
}
