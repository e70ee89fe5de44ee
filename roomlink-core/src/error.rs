use thiserror::Error;

use crate::models::PeerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("Media device not found: {0}")]
    DeviceNotFound(String),

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Presence registry error: {0}")]
    Registry(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Connection error for peer {peer}: {message}")]
    Connection { peer: PeerId, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Error for a single peer link, leaving the rest of the mesh untouched.
    pub fn connection(peer: PeerId, message: impl Into<String>) -> Self {
        Self::Connection {
            peer,
            message: message.into(),
        }
    }

    /// Whether this error ends the session. Only local media acquisition
    /// failures are fatal; everything else degrades or stays per-peer.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::DeviceNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::PermissionDenied("camera".to_string()).is_fatal());
        assert!(Error::DeviceNotFound("camera".to_string()).is_fatal());
        assert!(!Error::UserCancelled.is_fatal());
        assert!(!Error::Registry("down".to_string()).is_fatal());
        assert!(!Error::connection(PeerId::from("room:a"), "ice failed").is_fatal());
    }

    #[test]
    fn test_connection_error_message() {
        let err = Error::connection(PeerId::from("room:b"), "replace failed");
        assert!(err.to_string().contains("room:b"));
        assert!(err.to_string().contains("replace failed"));
    }
}
