//! Mesh configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Mesh engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_config: Option<TurnConfig>,
    /// ICE disconnected timeout override (ms). Departure without a clean
    /// close is only detected through these transport timers.
    pub ice_disconnected_timeout_ms: Option<u64>,
    /// ICE failed timeout override (ms)
    pub ice_failed_timeout_ms: Option<u64>,
    /// ICE keepalive interval override (ms)
    pub ice_keepalive_interval_ms: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_config: None,
            ice_disconnected_timeout_ms: None,
            ice_failed_timeout_ms: None,
            ice_keepalive_interval_ms: None,
        }
    }
}

impl MeshConfig {
    /// Configuration for loopback-only operation (tests, single host):
    /// host candidates only, no STUN round-trips, fast failure detection.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            stun_servers: Vec::new(),
            ice_disconnected_timeout_ms: Some(2_000),
            ice_failed_timeout_ms: Some(5_000),
            ice_keepalive_interval_ms: Some(500),
            ..Self::default()
        }
    }

    /// Build the peer-connection configuration for this mesh.
    #[must_use]
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let mut ice_servers = Vec::new();

        if !self.stun_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }

        if let Some(turn) = &self.turn_config {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.server_url.clone()],
                username: turn.username.clone(),
                credential: turn.password.clone(),
                ..Default::default()
            });
        }

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL
    pub server_url: String,
    /// TURN username
    pub username: String,
    /// TURN password
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(!config.stun_servers.is_empty());
        assert!(config.turn_config.is_none());

        let rtc = config.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 1);
    }

    #[test]
    fn test_loopback_config_has_no_ice_servers() {
        let rtc = MeshConfig::loopback().rtc_configuration();
        assert!(rtc.ice_servers.is_empty());
    }

    #[test]
    fn test_turn_servers_are_included() {
        let config = MeshConfig {
            turn_config: Some(TurnConfig {
                server_url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
            ..Default::default()
        };

        let rtc = config.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[1].username, "user");
    }
}
