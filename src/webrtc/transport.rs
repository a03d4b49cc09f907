//! Media transport capability used by the negotiation state machine

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use crate::error::Result;

/// Events emitted by a media transport
#[derive(Debug, Clone)]
pub enum TransportEvent<R> {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// Transport connection state changed
    StateChanged(ConnectionState),
    /// The remote peer's media stream arrived
    RemoteTrack(R),
}

/// Receiver half handed out alongside a transport
pub type TransportEvents<R> = mpsc::UnboundedReceiver<TransportEvent<R>>;

/// The peer-connection operations negotiation needs
///
/// Implemented by [`RtcTransport`](super::peer::RtcTransport) for real
/// sessions; tests drive the state machine with a recording fake.
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    /// Handle to the remote media stream
    type RemoteStream: Clone + Send + Sync + 'static;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
