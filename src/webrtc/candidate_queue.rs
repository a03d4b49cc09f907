//! Readiness-gated ICE candidate buffer

use std::collections::VecDeque;

use super::signaling::IceCandidate;

/// FIFO buffer of ICE candidates gated on a readiness condition
///
/// Used twice per session: local candidates wait for the signaling channel
/// to open, remote candidates wait for the remote description to be
/// committed. Candidates pushed before [`open`](Self::open) are returned by
/// it exactly once, in push order; after that every push passes straight
/// through.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    open: bool,
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate, or hand it back if the gate is already open
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Open the gate and drain everything buffered so far
    ///
    /// Returns an empty list if the gate was already open.
    pub fn open(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
