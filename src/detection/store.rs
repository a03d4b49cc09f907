//! Latest detection set, shared between both delivery modes and the overlay

use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

use super::types::{DetectionOrigin, DetectionSet};
use crate::events::{EventBus, SystemEvent};

/// Holds the authoritative detection set
///
/// Whichever mode delivers last wins: [`replace`](Self::replace) swaps the
/// whole set, there is no merging across frames or modes.
#[derive(Clone)]
pub struct DetectionStore {
    tx: Arc<watch::Sender<Arc<DetectionSet>>>,
    events: Arc<EventBus>,
}

impl DetectionStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        let (tx, _) = watch::channel(Arc::new(DetectionSet::empty(DetectionOrigin::Response)));
        Self {
            tx: Arc::new(tx),
            events,
        }
    }

    pub fn replace(&self, set: DetectionSet) {
        trace!(
            "Detection set from {:?}: {} boxes (frame {:?})",
            set.origin,
            set.len(),
            set.frame_id
        );
        let event = SystemEvent::DetectionsUpdated {
            frame_id: set.frame_id.clone(),
            origin: set.origin,
            count: set.len(),
        };
        self.tx.send_replace(Arc::new(set));
        self.events.publish(event);
    }

    pub fn current(&self) -> Arc<DetectionSet> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DetectionSet>> {
        self.tx.subscribe()
    }
}
