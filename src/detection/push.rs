//! Pushed detection results (`/ws/detection`)

use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::DetectionStore;
use super::types::{parse_detection_payload, DetectionOrigin};

/// Inbound-only WebSocket feeding the [`DetectionStore`]
///
/// Every text frame becomes one detection set; a payload that is not a
/// detection set replaces the display with an empty one. The connection is
/// not re-established once lost.
pub struct DetectionPushChannel {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DetectionPushChannel {
    pub fn connect(url: impl Into<String>, store: DetectionStore, cancel: CancellationToken) -> Self {
        let url = url.into();
        let handle = tokio::spawn(run_push(url, store, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Close the channel and wait for the reader to exit
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for DetectionPushChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_push(url: String, store: DetectionStore, cancel: CancellationToken) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Detection push connection to {} failed: {}", url, e);
            return;
        }
    };
    info!("Detection push channel open: {}", url);

    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(Message::Close(None)).await;
                debug!("Detection push channel closed");
                break;
            }
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    store.replace(parse_detection_payload(&text, DetectionOrigin::Push));
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data);
                    store.replace(parse_detection_payload(&text, DetectionOrigin::Push));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Detection push channel closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Detection push channel error: {}", e);
                    break;
                }
            }
        }
    }
}
