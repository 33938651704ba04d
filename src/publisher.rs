//! Per-resource broadcast of occupancy transitions.
//!
//! Each registered resource owns a channel holding its latest event and its
//! subscriber list. Sequence numbers are drawn from one global counter but
//! assigned and delivered while the resource's channel lock is held, so the
//! stream seen for a single resource is always in sequence order. Streams of
//! different resources are not ordered relative to each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::error::CellError;
use crate::types::{ItemId, ResourceHandle, ResourceKind, ResourceState};

/// Notification of one occupancy mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StateChangeEvent {
    /// Globally monotonic sequence number.
    pub seq: u64,
    pub kind: ResourceKind,
    pub resource: String,
    #[serde(skip)]
    pub handle: ResourceHandle,
    pub state: ResourceState,
    pub item: Option<ItemId>,
}

/// Receiver of state-change events.
///
/// Listeners run on the publishing thread while the resource's channel is
/// locked; they must hand work off (push to a mailbox, record) rather than
/// call back into the scheduler.
pub trait StateListener: Send + Sync {
    fn on_event(&self, event: &StateChangeEvent);
}

impl<F> StateListener for F
where
    F: Fn(&StateChangeEvent) + Send + Sync,
{
    fn on_event(&self, event: &StateChangeEvent) {
        self(event)
    }
}

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Channel {
    current: StateChangeEvent,
    listeners: Vec<(SubscriptionId, Arc<dyn StateListener>)>,
}

/// Broadcast hub holding one channel per registered resource.
pub struct StatePublisher {
    channels: RwLock<Vec<Mutex<Channel>>>,
    next_seq: AtomicU64,
    next_subscription: AtomicU64,
}

impl StatePublisher {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Open the channel for a newly registered resource; its initial state is idle.
    pub(crate) fn open_channel(&self, handle: ResourceHandle, kind: ResourceKind, name: &str) {
        let mut channels = self.channels.write().expect("publisher lock poisoned");
        debug_assert_eq!(channels.len(), handle.0, "channels opened out of order");
        let current = StateChangeEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            resource: name.to_string(),
            handle,
            state: ResourceState::Idle,
            item: None,
        };
        channels.push(Mutex::new(Channel {
            current,
            listeners: Vec::new(),
        }));
    }

    /// Record and broadcast a new state for `handle`.
    pub(crate) fn publish(
        &self,
        handle: ResourceHandle,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> StateChangeEvent {
        let channels = self.channels.read().expect("publisher lock poisoned");
        let mut channel = channels[handle.0].lock().expect("channel mutex poisoned");
        let event = StateChangeEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            kind: channel.current.kind,
            resource: channel.current.resource.clone(),
            handle,
            state,
            item,
        };
        channel.current = event.clone();
        for (_, listener) in &channel.listeners {
            listener.on_event(&event);
        }
        event
    }

    /// Subscribe to a resource. The listener receives the current state
    /// before this call returns, and every later event in order.
    pub fn subscribe(
        &self,
        handle: ResourceHandle,
        listener: Arc<dyn StateListener>,
    ) -> Result<SubscriptionId, CellError> {
        let channels = self.channels.read().expect("publisher lock poisoned");
        let slot = channels
            .get(handle.0)
            .ok_or_else(|| CellError::UnknownResource(format!("#{}", handle.0)))?;
        let mut channel = slot.lock().expect("channel mutex poisoned");
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        listener.on_event(&channel.current);
        channel.listeners.push((id, listener));
        Ok(id)
    }

    /// Remove a subscription; returns whether it was present.
    pub fn unsubscribe(&self, handle: ResourceHandle, subscription: SubscriptionId) -> bool {
        let channels = self.channels.read().expect("publisher lock poisoned");
        let Some(slot) = channels.get(handle.0) else {
            return false;
        };
        let mut channel = slot.lock().expect("channel mutex poisoned");
        let before = channel.listeners.len();
        channel.listeners.retain(|(id, _)| *id != subscription);
        channel.listeners.len() != before
    }

    /// Latest event published for `handle`.
    pub fn current(&self, handle: ResourceHandle) -> Option<StateChangeEvent> {
        let channels = self.channels.read().expect("publisher lock poisoned");
        let slot = channels.get(handle.0)?;
        let channel = slot.lock().expect("channel mutex poisoned");
        Some(channel.current.clone())
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.read().expect("publisher lock poisoned").len()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}
