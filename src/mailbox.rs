//! Thread-safe FIFO mailbox with blocking consumers and in-flight accounting.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counts messages from push until their handler finishes.
///
/// Several mailboxes may share one tracker. A handler that pushes follow-up
/// messages does so before its own message is completed, so the count only
/// reaches zero once the whole cascade has settled.
pub struct InFlight {
    count: Mutex<usize>,
    settled: Condvar,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            settled: Condvar::new(),
        }
    }

    pub(crate) fn begin(&self) {
        let mut guard = self.count.lock().expect("in-flight mutex poisoned");
        *guard += 1;
    }

    pub(crate) fn end(&self) {
        let mut guard = self.count.lock().expect("in-flight mutex poisoned");
        debug_assert!(*guard > 0, "in-flight counter underflow");
        *guard = guard.saturating_sub(1);
        if *guard == 0 {
            self.settled.notify_all();
        }
    }

    pub fn is_settled(&self) -> bool {
        *self.count.lock().expect("in-flight mutex poisoned") == 0
    }

    /// Block until nothing is in flight or the timeout elapses.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.count.lock().expect("in-flight mutex poisoned");
        while *guard > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Wait releases the lock and re-acquires it before returning.
            let (next, _) = self
                .settled
                .wait_timeout(guard, deadline - now)
                .expect("condvar wait failed");
            guard = next;
        }
        true
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// A synchronized single-consumer message queue.
pub struct Mailbox<M> {
    inner: Mutex<MailboxState<M>>,
    available: Condvar,
    in_flight: Arc<InFlight>,
}

struct MailboxState<M> {
    queue: VecDeque<M>,
    closed: bool,
}

impl<M> Mailbox<M> {
    /// Create an empty mailbox with its own tracker.
    pub fn new() -> Self {
        Self::with_tracker(Arc::new(InFlight::new()))
    }

    /// Create an empty mailbox sharing `in_flight` with other mailboxes.
    pub fn with_tracker(in_flight: Arc<InFlight>) -> Self {
        Self {
            inner: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            in_flight,
        }
    }

    /// Push a message; returns it back if the mailbox is closed.
    pub fn push(&self, message: M) -> Result<(), M> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        if guard.closed {
            return Err(message);
        }
        self.in_flight.begin();
        guard.queue.push_back(message);
        self.available.notify_one();
        Ok(())
    }

    /// Try to pop immediately without blocking.
    pub fn try_pop(&self) -> Option<M> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.queue.pop_front()
    }

    /// Block until a message is available or the mailbox is closed and drained.
    pub fn pop_blocking_or_closed(&self) -> Option<M> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        loop {
            if let Some(message) = guard.queue.pop_front() {
                return Some(message);
            }
            if guard.closed {
                return None;
            }
            guard = self.available.wait(guard).expect("condvar wait failed");
        }
    }

    /// Mark one popped message as handled.
    pub fn complete(&self) {
        self.in_flight.end();
    }

    /// Close the mailbox and wake all blocked consumers. Queued messages
    /// are still delivered.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.closed = true;
        self.available.notify_all();
    }

    /// Close the mailbox and discard everything still queued.
    pub fn close_and_discard(&self) -> Vec<M> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.closed = true;
        let dropped: Vec<M> = guard.queue.drain(..).collect();
        for _ in &dropped {
            self.in_flight.end();
        }
        self.available.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("mailbox mutex poisoned").closed
    }

    /// Current number of queued messages.
    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tracker(&self) -> &Arc<InFlight> {
        &self.in_flight
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}
