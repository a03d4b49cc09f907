//! Session role

use serde::{Deserialize, Serialize};

/// Which end of the link this node is.
///
/// Fixed for the lifetime of a session and passed in explicitly when the
/// session is built. The viewer always initiates negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Receives remote video and runs detection on it
    Viewer,
    /// Publishes local camera video
    Camera,
}

impl Role {
    /// Whether this role creates the offer
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Viewer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Camera => "camera",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
