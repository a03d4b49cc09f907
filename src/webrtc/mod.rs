//! Peer-to-peer video link
//!
//! ```text
//!  viewer                     relay (/ws)                     camera
//!    |  {"offer": ...}  ---------->|---------->                  |
//!    |                  <----------|<----------  {"answer": ...} |
//!    |  {"candidate": ...} <------>|<------> {"candidate": ...}  |
//!    |                                                           |
//!    |<================ H.264 over SRTP (direct) =================|
//! ```
//!
//! [`SignalingChannel`] relays messages, [`PeerConnectionManager`] runs the
//! offer/answer state machine over any [`MediaTransport`], and
//! [`RtcTransport`] is the webrtc-rs implementation used at runtime.

pub mod candidate_queue;
pub mod channel;
pub mod config;
pub mod mdns;
pub mod monitor;
pub mod negotiation;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use candidate_queue::IceCandidateQueue;
pub use channel::{ChannelState, SignalingChannel, SignalingSender};
pub use monitor::ConnectionStateMonitor;
pub use negotiation::{NegotiationState, Pending, PeerConnectionManager};
pub use peer::RtcTransport;
pub use signaling::{ConnectionState, IceCandidate, SdpKind, SessionDescription, SignalingMessage};
pub use transport::{MediaTransport, TransportEvent, TransportEvents};
