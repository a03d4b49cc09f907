//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::detection::DetectionOrigin;
use crate::webrtc::negotiation::NegotiationState;
use crate::webrtc::signaling::ConnectionState;

/// System event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "connection.state_changed",
///   "data": { "state": "connected" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Peer connection transport state changed
    #[serde(rename = "connection.state_changed")]
    ConnectionStateChanged { state: ConnectionState },

    /// Negotiation state machine moved
    #[serde(rename = "negotiation.state_changed")]
    NegotiationStateChanged { state: NegotiationState },

    /// A new detection set replaced the previous one
    #[serde(rename = "detection.updated")]
    DetectionsUpdated {
        frame_id: Option<String>,
        origin: DetectionOrigin,
        count: usize,
    },

    /// Detecting mode switched on or off
    #[serde(rename = "detection.mode_changed")]
    DetectionModeChanged { enabled: bool },

    /// Overlay was redrawn
    #[serde(rename = "overlay.updated")]
    OverlayUpdated {
        /// Number of boxes drawn
        boxes: usize,
        width: u32,
        height: u32,
    },

    /// Join image reference changed
    #[serde(rename = "join.image_updated")]
    JoinImageUpdated { src: String },

    /// Error event
    #[serde(rename = "error")]
    Error { module: String, message: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection.state_changed",
            Self::NegotiationStateChanged { .. } => "negotiation.state_changed",
            Self::DetectionsUpdated { .. } => "detection.updated",
            Self::DetectionModeChanged { .. } => "detection.mode_changed",
            Self::OverlayUpdated { .. } => "overlay.updated",
            Self::JoinImageUpdated { .. } => "join.image_updated",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `detection.*` matches all detection events
    /// - `overlay.updated` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        match topic.strip_suffix(".*") {
            Some(prefix) => event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => event_name == topic,
        }
    }
}
