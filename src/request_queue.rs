//! Ordered backlog of transfer requests awaiting assignment.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::request::QueuedRequest;
use crate::types::RequestId;

type QueueKey = (Reverse<i32>, Instant, RequestId);

/// Requests ordered by priority (higher first), then creation time, then
/// arrival. This is not a plain FIFO: a later request with a higher priority
/// is served before an earlier one. Only equal-priority requests are served
/// first-in first-out.
///
/// Not synchronized: each scheduler strategy owns its queues inside its own
/// critical section, consumer thread, or agent.
#[derive(Default)]
pub struct RequestQueue {
    entries: BTreeMap<QueueKey, QueuedRequest>,
}

fn key_of(request: &QueuedRequest) -> QueueKey {
    (Reverse(request.priority), request.created_at, request.id)
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: QueuedRequest) {
        self.entries.insert(key_of(&request), request);
    }

    pub fn peek(&self) -> Option<&QueuedRequest> {
        self.entries.values().next()
    }

    /// Remove the head only if `predicate` holds for it.
    pub fn dequeue_if(
        &mut self,
        predicate: impl FnOnce(&QueuedRequest) -> bool,
    ) -> Option<QueuedRequest> {
        let entry = self.entries.first_entry()?;
        if predicate(entry.get()) {
            Some(entry.remove())
        } else {
            None
        }
    }

    /// Remove the first request, in queue order, for which `matcher` yields a
    /// value, and return it with that value. Requests that do not match keep
    /// their position.
    pub fn dequeue_first_with<T>(
        &mut self,
        mut matcher: impl FnMut(&QueuedRequest) -> Option<T>,
    ) -> Option<(QueuedRequest, T)> {
        let (key, found) = self
            .entries
            .iter()
            .find_map(|(key, request)| matcher(request).map(|found| (*key, found)))?;
        let request = self.entries.remove(&key)?;
        Some((request, found))
    }

    /// Withdraw a queued request.
    pub fn remove(&mut self, id: RequestId) -> Option<QueuedRequest> {
        let key = self.entries.keys().find(|key| key.2 == id).copied()?;
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.entries.values()
    }
}
