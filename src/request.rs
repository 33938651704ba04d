//! Transfer requests as submitted by callers and as held in scheduler queues.

use std::fmt;
use std::time::Instant;

use crate::error::CellError;
use crate::registry::Topology;
use crate::types::{ItemId, RequestId, ResourceHandle, ResourceKind};

/// Callback fired with the item id once its transfer is delivered.
pub type CompletionCallback = Box<dyn FnOnce(ItemId) + Send + 'static>;

/// A pending move of one wafer from a source to a destination.
pub struct TransferRequest {
    pub item: ItemId,
    pub source: String,
    pub destination: String,
    /// Higher runs first.
    pub priority: i32,
    pub created_at: Instant,
    pub preferred_robot: Option<String>,
    on_complete: Option<CompletionCallback>,
}

impl TransferRequest {
    pub fn new(item: ItemId, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            item,
            source: source.into(),
            destination: destination.into(),
            priority: 0,
            created_at: Instant::now(),
            preferred_robot: None,
            on_complete: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn prefer_robot(mut self, robot: impl Into<String>) -> Self {
        self.preferred_robot = Some(robot.into());
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(ItemId) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Validate against the topology and resolve names to handles.
    pub(crate) fn resolve(
        self,
        id: RequestId,
        topology: &Topology,
    ) -> Result<QueuedRequest, CellError> {
        if self.item == 0 {
            return Err(CellError::Validation("item ids must be positive".to_string()));
        }
        if self.source.trim().is_empty() || self.destination.trim().is_empty() {
            return Err(CellError::Validation(
                "source and destination are required".to_string(),
            ));
        }
        if self.source == self.destination {
            return Err(CellError::Validation(format!(
                "source and destination are both {}",
                self.source
            )));
        }
        let source = location(topology, &self.source)?;
        let destination = location(topology, &self.destination)?;
        let preferred = match self.preferred_robot.as_deref() {
            Some(name) => {
                let handle = topology.lookup(name).ok_or_else(|| {
                    CellError::Validation(format!("preferred robot {name} is not registered"))
                })?;
                if topology.kind(handle) != ResourceKind::Robot {
                    return Err(CellError::Validation(format!("{name} is not a robot")));
                }
                Some(handle)
            }
            None => None,
        };
        Ok(QueuedRequest {
            id,
            item: self.item,
            source,
            destination,
            priority: self.priority,
            created_at: self.created_at,
            enqueued_at: Instant::now(),
            preferred,
            on_complete: self.on_complete,
        })
    }
}

fn location(topology: &Topology, name: &str) -> Result<ResourceHandle, CellError> {
    let handle = topology
        .lookup(name)
        .ok_or_else(|| CellError::Validation(format!("{name} is not registered")))?;
    if topology.kind(handle) == ResourceKind::Robot {
        return Err(CellError::Validation(format!("{name} is a robot, not a location")));
    }
    Ok(handle)
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("item", &self.item)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .field("preferred_robot", &self.preferred_robot)
            .finish_non_exhaustive()
    }
}

/// A validated request waiting in a scheduler queue.
pub struct QueuedRequest {
    pub id: RequestId,
    pub item: ItemId,
    pub source: ResourceHandle,
    pub destination: ResourceHandle,
    pub priority: i32,
    pub created_at: Instant,
    pub enqueued_at: Instant,
    pub preferred: Option<ResourceHandle>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl QueuedRequest {
    pub(crate) fn take_callback(&mut self) -> Option<CompletionCallback> {
        self.on_complete.take()
    }
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("item", &self.item)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
