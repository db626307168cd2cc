use std::collections::VecDeque;

use super::PendingRequest;

/// Per-account FIFO of requests waiting for execution.
///
/// A request whose [`PendingRequest::grouping_key`] matches one already queued
/// replaces it, so rapid opposite toggles collapse into the last one.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when an older request was superseded.
    pub fn push(&mut self, request: PendingRequest) -> bool {
        let key = request.grouping_key();
        let before = self.pending.len();
        self.pending
            .retain(|queued| !(queued.account_id == request.account_id && queued.grouping_key() == key));
        let replaced = self.pending.len() != before;
        if replaced {
            tracing::debug!("Coalesced queued {} ({})", request.name(), key);
        }
        self.pending.push_back(request);
        replaced
    }

    /// Remove up to `max` requests from the front.
    pub fn take(&mut self, max: usize) -> Vec<PendingRequest> {
        let n = max.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    /// Put requests back at the front, keeping their order.
    pub fn requeue_front(&mut self, requests: Vec<PendingRequest>) {
        for request in requests.into_iter().rev() {
            self.pending.push_front(request);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
