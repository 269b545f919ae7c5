//! Candidate buffer: remote candidates that arrived before the session could
//! consume them.
//!
//! Candidates trickle in independently of the offer/answer, so one can land
//! while the remote description is still being applied. Those are held here
//! in arrival order and flushed once the description is in place.

use echo_common::models::IceCandidate;
use std::collections::VecDeque;

/// Ordered queue scoped to one call session; dropped with it.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate to the back of the queue.
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Hand the candidate back for immediate application if the session
    /// already has its remote description, otherwise store it.
    pub fn drain_if_ready(
        &mut self,
        candidate: IceCandidate,
        has_remote_description: bool,
    ) -> Option<IceCandidate> {
        if has_remote_description {
            Some(candidate)
        } else {
            self.enqueue(candidate);
            None
        }
    }

    /// Pop every stored candidate in arrival order, leaving the buffer empty.
    pub fn flush_all(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
