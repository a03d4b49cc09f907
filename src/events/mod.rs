//! Session notifications
//!
//! Components publish what they are doing on one [`EventBus`]; the binary
//! subscribes and logs it in place of a UI.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Events a slow subscriber may fall behind before it sees `Lagged`
const CAPACITY: usize = 256;

/// Fan-out of [`SystemEvent`]s to any number of subscribers
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Fire and forget; nothing happens without subscribers
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Surface a failure the session cannot recover from
    pub fn error(&self, module: &str, message: impl Into<String>) {
        self.publish(SystemEvent::Error {
            module: module.to_string(),
            message: message.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::new();
        let mut viewer_ui = bus.subscribe();
        let mut logger = bus.subscribe();

        bus.publish(SystemEvent::JoinImageUpdated {
            src: "data:image/png;base64,AAAA".to_string(),
        });

        for rx in [&mut viewer_ui, &mut logger] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                SystemEvent::JoinImageUpdated { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_error_carries_module() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.error("signaling", "relay unreachable");

        match rx.recv().await.unwrap() {
            SystemEvent::Error { module, message } => {
                assert_eq!(module, "signaling");
                assert_eq!(message, "relay unreachable");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(SystemEvent::DetectionModeChanged { enabled: false });
    }
}
