//! Resource registration, occupancy records, station leases and transit claims.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error};

use crate::error::CellError;
use crate::publisher::{StateChangeEvent, StatePublisher};
use crate::router::{Route, RouteTable};
use crate::types::{ItemId, ResourceHandle, ResourceKind, ResourceState, StationRole};

#[derive(Clone, Debug)]
struct ResourceInfo {
    name: String,
    kind: ResourceKind,
    role: Option<StationRole>,
}

/// Immutable description of the cell: names, kinds, and the route table.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    resources: Vec<ResourceInfo>,
    by_name: HashMap<String, ResourceHandle>,
    routes: RouteTable,
}

impl Topology {
    /// Resolve a name, failing with `UnknownResource`.
    pub fn handle(&self, name: &str) -> Result<ResourceHandle, CellError> {
        self.lookup(name)
            .ok_or_else(|| CellError::UnknownResource(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Option<ResourceHandle> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, handle: ResourceHandle) -> &str {
        &self.resources[handle.0].name
    }

    pub fn kind(&self, handle: ResourceHandle) -> ResourceKind {
        self.resources[handle.0].kind
    }

    pub fn role(&self, handle: ResourceHandle) -> Option<StationRole> {
        self.resources[handle.0].role
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        (0..self.resources.len()).map(ResourceHandle)
    }

    /// Robots in registration order.
    pub fn robots(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.handles()
            .filter(|&handle| self.kind(handle) == ResourceKind::Robot)
    }

    pub fn stations(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.handles()
            .filter(|&handle| self.kind(handle) == ResourceKind::Station)
    }
}

/// Occupancy record of one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Occupancy {
    pub state: ResourceState,
    pub item: Option<ItemId>,
    /// Set after an invariant violation; the record accepts no further updates.
    pub faulted: bool,
}

impl Default for Occupancy {
    fn default() -> Self {
        Self {
            state: ResourceState::Idle,
            item: None,
            faulted: false,
        }
    }
}

impl Occupancy {
    /// Validate and apply a state update.
    ///
    /// Shape errors (wrong kind, zero item) are `Validation` and leave the
    /// record untouched. Invariant errors fault the record permanently.
    pub(crate) fn transition(
        &mut self,
        name: &str,
        kind: ResourceKind,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError> {
        if self.faulted {
            return Err(CellError::ResourceFaulted(name.to_string()));
        }
        if kind == ResourceKind::Port {
            return Err(CellError::Validation(format!("port {name} has no occupancy")));
        }
        if !state.applies_to(kind) {
            return Err(CellError::Validation(format!("{state} is not a {kind} state")));
        }
        if item == Some(0) {
            return Err(CellError::Validation("item ids must be positive".to_string()));
        }
        if let Err(detail) = self.check_invariants(kind, state, item) {
            self.faulted = true;
            error!(resource = name, %detail, "invariant violation, resource faulted");
            return Err(CellError::invariant(name, detail));
        }
        self.state = state;
        self.item = item;
        Ok(())
    }

    fn check_invariants(
        &self,
        kind: ResourceKind,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), String> {
        match (state.holds_item(), item) {
            (false, Some(item)) => return Err(format!("idle while holding item {item}")),
            (true, None) => return Err(format!("{state} without a held item")),
            _ => {}
        }
        if let (Some(held), Some(next)) = (self.item, item) {
            if held != next {
                return Err(format!("holds item {held}, cannot take item {next}"));
            }
        }
        if kind == ResourceKind::Robot && !ResourceState::robot_can_move(self.state, state) {
            return Err(format!("illegal robot transition {} -> {state}", self.state));
        }
        Ok(())
    }
}

/// Registration-time builder and occupancy arena for every resource.
pub struct ResourceRegistry {
    topology: Arc<Topology>,
    slots: Vec<Occupancy>,
    publisher: Arc<StatePublisher>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            topology: Arc::new(Topology::default()),
            slots: Vec::new(),
            publisher: Arc::new(StatePublisher::new()),
        }
    }

    fn register(
        &mut self,
        name: &str,
        kind: ResourceKind,
        role: Option<StationRole>,
    ) -> Result<ResourceHandle, CellError> {
        if name.trim().is_empty() {
            return Err(CellError::Validation("resource name is empty".to_string()));
        }
        if self.topology.by_name.contains_key(name) {
            return Err(CellError::DuplicateResource(name.to_string()));
        }
        let topology = Arc::make_mut(&mut self.topology);
        let handle = ResourceHandle(topology.resources.len());
        topology.resources.push(ResourceInfo {
            name: name.to_string(),
            kind,
            role,
        });
        topology.by_name.insert(name.to_string(), handle);
        self.slots.push(Occupancy::default());
        self.publisher.open_channel(handle, kind, name);
        debug!(resource = name, %kind, "registered");
        Ok(handle)
    }

    pub fn register_station(
        &mut self,
        name: &str,
        role: StationRole,
    ) -> Result<ResourceHandle, CellError> {
        self.register(name, ResourceKind::Station, Some(role))
    }

    pub fn register_port(&mut self, name: &str) -> Result<ResourceHandle, CellError> {
        self.register(name, ResourceKind::Port, None)
    }

    /// Register a robot with its ordered capability list of `(source, destination)` names.
    ///
    /// Every endpoint must already be registered as a station or port.
    pub fn register_robot(
        &mut self,
        name: &str,
        capabilities: &[(&str, &str)],
    ) -> Result<ResourceHandle, CellError> {
        if self.topology.by_name.contains_key(name) {
            return Err(CellError::DuplicateResource(name.to_string()));
        }
        let mut routes: Vec<Route> = Vec::with_capacity(capabilities.len());
        for &(source, destination) in capabilities {
            let source = self.location(source)?;
            let destination = self.location(destination)?;
            if source == destination {
                return Err(CellError::Validation(format!(
                    "robot {name} route starts and ends at {}",
                    self.topology.name(source)
                )));
            }
            routes.push((source, destination));
        }
        let handle = self.register(name, ResourceKind::Robot, None)?;
        Arc::make_mut(&mut self.topology)
            .routes
            .add_robot(handle, &routes);
        Ok(handle)
    }

    fn location(&self, name: &str) -> Result<ResourceHandle, CellError> {
        let handle = self.topology.handle(name)?;
        if self.topology.kind(handle) == ResourceKind::Robot {
            return Err(CellError::Validation(format!(
                "{name} is a robot, not a location"
            )));
        }
        Ok(handle)
    }

    pub fn get_state(&self, name: &str) -> Result<ResourceState, CellError> {
        let handle = self.topology.handle(name)?;
        Ok(self.slots[handle.0].state)
    }

    pub fn occupancy(&self, handle: ResourceHandle) -> Occupancy {
        self.slots[handle.0]
    }

    /// Validate and apply a state update by name, then publish it.
    pub fn set_state(
        &mut self,
        name: &str,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<StateChangeEvent, CellError> {
        let handle = self.topology.handle(name)?;
        self.apply(handle, state, item)
    }

    pub(crate) fn apply(
        &mut self,
        handle: ResourceHandle,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<StateChangeEvent, CellError> {
        let info = &self.topology.resources[handle.0];
        self.slots[handle.0].transition(&info.name, info.kind, state, item)?;
        Ok(self.publisher.publish(handle, state, item))
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Split into the shared topology, the occupancy arena, and the publisher.
    pub(crate) fn into_parts(self) -> (Arc<Topology>, Vec<Occupancy>, Arc<StatePublisher>) {
        (self.topology, self.slots, self.publisher)
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination claims, one slot per resource.
///
/// A robot claims a station when it is assigned to deliver into it; the
/// claim lasts until the station is emptied again. Claims are the only
/// arbiter of destination availability, so two robots can never head for
/// the same station.
pub(crate) struct StationLeases {
    holders: Vec<AtomicUsize>,
}

impl StationLeases {
    const FREE: usize = 0;

    pub(crate) fn new(len: usize) -> Self {
        Self {
            holders: (0..len).map(|_| AtomicUsize::new(Self::FREE)).collect(),
        }
    }

    pub(crate) fn try_claim(&self, station: ResourceHandle, robot: ResourceHandle) -> bool {
        self.holders[station.0]
            .compare_exchange(
                Self::FREE,
                robot.0 + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn release(&self, station: ResourceHandle) {
        self.holders[station.0].store(Self::FREE, Ordering::SeqCst);
    }

    pub(crate) fn holder(&self, station: ResourceHandle) -> Option<ResourceHandle> {
        match self.holders[station.0].load(Ordering::SeqCst) {
            Self::FREE => None,
            slot => Some(ResourceHandle(slot - 1)),
        }
    }
}

/// Items currently committed to a robot, from assignment until delivery.
///
/// An item can be claimed once; a second request for it waits in its queue
/// until the first transfer has been delivered.
#[derive(Default)]
pub(crate) struct TransitClaims {
    items: Mutex<HashSet<ItemId>>,
}

impl TransitClaims {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_claim(&self, item: ItemId) -> bool {
        self.items
            .lock()
            .expect("transit claims mutex poisoned")
            .insert(item)
    }

    pub(crate) fn release(&self, item: ItemId) {
        self.items
            .lock()
            .expect("transit claims mutex poisoned")
            .remove(&item);
    }

    pub(crate) fn contains(&self, item: ItemId) -> bool {
        self.items
            .lock()
            .expect("transit claims mutex poisoned")
            .contains(&item)
    }
}
