//! Roomlink core
//!
//! Shared foundations for the Roomlink mesh engine:
//! - Identity and presence models (`RoomId`, `ParticipantId`, `PeerId`,
//!   `PresenceRecord`)
//! - The presence registry contract and its in-process implementation
//! - Configuration loading and logging bootstrap
//! - The crate-wide error type

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod registry;

pub use config::{Config, LoggingConfig};
pub use error::{Error, Result};
pub use models::{ParticipantId, PeerId, PresenceRecord, RoomId};
pub use registry::{MemoryPresenceRegistry, PresenceRegistry, PresenceSubscription};
