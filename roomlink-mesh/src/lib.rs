//! Roomlink mesh engine
//!
//! Full-mesh WebRTC rooms: every participant holds a direct pairwise link
//! to every other participant, discovered through a presence registry and
//! with no media relay in the middle.
//!
//! ## Architecture
//!
//! - **`RoomSession`**: per-participant orchestrator; a single event loop
//!   owns all session state and reacts to presence snapshots, inbound
//!   signaling, connection callbacks and user commands
//! - **`ConnectionPool`**: the owned home of all peer links, at most one
//!   per peer-id, with synchronous check-before-insert (glare guard)
//! - **`RemoteConnection`**: one peer link and its
//!   `Connecting -> Linked -> Closed` state machine
//! - **`MediaController`**: local capture state; mute flips track gates in
//!   place, camera/screen swaps replace sender tracks without
//!   renegotiation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomlink_mesh::{JoinOptions, MeshConfig, RoomSession, SyntheticMediaSource};
//!
//! let (session, mut events) = RoomSession::join(JoinOptions {
//!     config: MeshConfig::default(),
//!     room_id,
//!     participant_id,
//!     display_name: "Alice".into(),
//!     media,
//!     registry,
//!     transport,
//!     signals,
//! })
//! .await?;
//!
//! while let Some(notification) = events.next().await {
//!     // assign/clear render sinks, update controls
//! }
//! ```

mod config;
mod connection;
mod media;
mod pool;
mod session;
mod signaling;

pub use config::{MeshConfig, TurnConfig};
pub use connection::{ConnectionEvent, LinkState, RemoteConnection, RemoteStream};
pub use media::{
    AcquireFailure, LocalStream, LocalTrack, MediaController, MediaSource, StreamKind,
    StreamProbe, SyntheticMediaSource, TrackKind,
};
pub use pool::ConnectionPool;
pub use session::{
    JoinOptions, RoomSession, SessionEvents, SessionNotification, SessionState,
};
pub use signaling::{
    IceCandidate, MemorySignaling, MemorySignalingPeer, SignalMessage, SignalingTransport,
};
