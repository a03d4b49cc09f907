//! Connection state republishing

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use super::signaling::ConnectionState;
use crate::events::{EventBus, SystemEvent};

/// Latest peer connection state, observable by the rest of the session
///
/// Every transition is published verbatim, repeats included, both to the
/// watch channel and to the event bus.
#[derive(Clone)]
pub struct ConnectionStateMonitor {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events: Arc<EventBus>,
}

impl ConnectionStateMonitor {
    pub fn new(events: Arc<EventBus>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Self {
            state_tx: Arc::new(state_tx),
            events,
        }
    }

    pub fn publish(&self, state: ConnectionState) {
        info!("Connection state: {}", state);
        self.state_tx.send_replace(state);
        self.events
            .publish(SystemEvent::ConnectionStateChanged { state });
    }

    pub fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_republished() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let monitor = ConnectionStateMonitor::new(events);
        let mut watch_rx = monitor.subscribe();

        monitor.publish(ConnectionState::Connecting);
        monitor.publish(ConnectionState::Connected);

        assert!(monitor.is_connected());
        assert!(watch_rx.has_changed().unwrap());
        assert_eq!(*watch_rx.borrow_and_update(), ConnectionState::Connected);

        for expected in [ConnectionState::Connecting, ConnectionState::Connected] {
            match rx.recv().await.unwrap() {
                SystemEvent::ConnectionStateChanged { state } => assert_eq!(state, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
