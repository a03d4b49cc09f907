//! vision-link - peer-to-peer camera link with live object detection
//!
//! A camera node streams H.264 to a viewer node over a direct WebRTC
//! connection negotiated through a relay. The viewer samples the incoming
//! video, submits stills for object detection and draws the results over
//! the video.

pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod join;
pub mod metrics;
pub mod overlay;
pub mod role;
pub mod session;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
pub use role::Role;
