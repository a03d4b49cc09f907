//! Relayed signaling channel
//!
//! One WebSocket to the relay carries every [`SignalingMessage`] between the
//! two peers. The connection is driven by a background task; callers talk to
//! it through channels only.

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::signaling::SignalingMessage;
use crate::error::{AppError, Result};

/// Lifecycle of the signaling connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Cloneable handle for sending on a [`SignalingChannel`]
///
/// Messages sent before the channel opens are held and go out in
/// submission order as soon as it does.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingSender {
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| AppError::ChannelClosed)
    }

    /// Sender wired to a plain receiver, for driving negotiation without a relay
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Duplex signaling connection to the relay server
pub struct SignalingChannel {
    sender: SignalingSender,
    inbound: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    state_rx: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
}

impl SignalingChannel {
    /// Start connecting to `url` and return immediately
    pub fn connect(url: impl Into<String>) -> Self {
        let url = url.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let cancel = CancellationToken::new();

        tokio::spawn(run_connection(url, out_rx, in_tx, state_tx, cancel.clone()));

        Self {
            sender: SignalingSender { tx: out_tx },
            inbound: Some(in_rx),
            state_rx,
            cancel,
        }
    }

    /// Queue a message for the peer
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        self.sender.send(message)
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Next inbound message, or `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        match self.inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take ownership of the inbound stream; later `recv` calls return `None`
    pub fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.inbound.take()
    }

    /// Readiness watch
    pub fn opened(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Wait until the channel is open; fails if it closes first
    pub async fn wait_open(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let state = *rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map_err(|_| AppError::ChannelClosed)?;
        match state {
            ChannelState::Open => Ok(()),
            _ => Err(AppError::ChannelClosed),
        }
    }

    /// Close the connection; calling it again does nothing
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    in_tx: mpsc::UnboundedSender<SignalingMessage>,
    state_tx: watch::Sender<ChannelState>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = state_tx.send(ChannelState::Closed);
            return;
        }
        result = connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Signaling connection to {} failed: {}", url, e);
            let _ = state_tx.send(ChannelState::Closed);
            return;
        }
    };

    info!("Signaling channel open: {}", url);
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let _ = state_tx.send(ChannelState::Open);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(Message::Close(None)).await;
                debug!("Signaling channel closed locally");
                break;
            }
            outbound = out_rx.recv() => {
                let Some(message) = outbound else {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} message: {}", message.kind(), e);
                        continue;
                    }
                };
                debug!("Signaling -> {}", message.kind());
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    warn!("Signaling send failed: {}", e);
                    break;
                }
            }
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Text(text))) => deliver(&text, &in_tx),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => deliver(text, &in_tx),
                    Err(_) => warn!("Dropping non-UTF8 signaling frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Signaling channel closed by relay");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Signaling channel error: {}", e);
                    break;
                }
            }
        }
    }

    let _ = state_tx.send(ChannelState::Closed);
}

fn deliver(text: &str, in_tx: &mpsc::UnboundedSender<SignalingMessage>) {
    match SignalingMessage::from_json(text) {
        Ok(message) => {
            debug!("Signaling <- {}", message.kind());
            let _ = in_tx.send(message);
        }
        Err(e) => warn!("Ignoring malformed signaling message: {}", e),
    }
}
