//! ICE server configuration

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::WebRtcConfig;

/// Build the ICE server list handed to the peer connection
pub fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::with_capacity(config.stun_servers.len() + config.turn_servers.len());

    for stun_url in config.stun_servers.iter().filter(|u| !u.trim().is_empty()) {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in config.turn_servers.iter().filter(|t| !t.urls.is_empty()) {
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

/// Whether at least one TURN relay is configured
pub fn has_turn(config: &WebRtcConfig) -> bool {
    config.turn_servers.iter().any(|t| !t.urls.is_empty())
}
