//! Transfer scheduling: one contract, three concurrency strategies.
//!
//! - [`lock::LockScheduler`] keeps all scheduling state behind one mutex.
//! - [`mailbox::MailboxScheduler`] hands every call to a single consumer thread.
//! - [`agents::AgentScheduler`] runs one reactive agent per robot, fed only by
//!   state-change events.
//!
//! All three share the assignment rule implemented here: scan the queue in
//! order and commit the first request whose item is not already in transit,
//! whose source is ready, whose destination is open and claimable, and whose
//! bound robot is idle. A request is bound to the eligible hint, else to the
//! first eligible robot in registration order.

pub mod agents;
pub mod lock;
pub mod mailbox;
pub mod stall;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::{CellConfig, UnroutablePolicy};
use crate::error::{CellError, ConfigError};
use crate::publisher::{StateListener, StatePublisher, SubscriptionId};
use crate::registry::{Occupancy, ResourceRegistry, StationLeases, Topology, TransitClaims};
use crate::request::{CompletionCallback, QueuedRequest, TransferRequest};
use crate::request_queue::RequestQueue;
use crate::types::{
    ItemId, RequestId, ResourceHandle, ResourceKind, ResourceState, TransferOrder,
};

use self::stall::{StallDetector, StallReport};

/// Which concurrency strategy runs the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One exclusive critical section.
    Lock,
    /// One single-consumer mailbox.
    Mailbox,
    /// One reactive agent per robot.
    Agents,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Lock, Strategy::Mailbox, Strategy::Agents];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Lock => write!(f, "lock"),
            Strategy::Mailbox => write!(f, "mailbox"),
            Strategy::Agents => write!(f, "agents"),
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lock" | "mutex" | "a" => Ok(Strategy::Lock),
            "mailbox" | "actor" | "b" => Ok(Strategy::Mailbox),
            "agents" | "reactive" | "c" => Ok(Strategy::Agents),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Scheduler tuning shared by every strategy.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub unroutable: UnroutablePolicy,
    /// How long a request may wait before it is reported as stalled.
    pub stall_after: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            unroutable: UnroutablePolicy::Queue,
            stall_after: Some(Duration::from_secs(30)),
        }
    }
}

impl From<&CellConfig> for SchedulerOptions {
    fn from(config: &CellConfig) -> Self {
        Self {
            unroutable: config.unroutable,
            stall_after: config.stall_after,
        }
    }
}

/// Receives transfer orders when a robot is committed to a request.
///
/// Orders may arrive on a scheduler-owned thread. A sink hands them to the
/// robot controller and must not report state back from inside `dispatch`.
pub trait DispatchSink: Send + Sync {
    fn dispatch(&self, order: &TransferOrder);
}

impl<F> DispatchSink for F
where
    F: Fn(&TransferOrder) + Send + Sync,
{
    fn dispatch(&self, order: &TransferOrder) {
        self(order)
    }
}

/// Occupancy and queue state of one resource as last published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub kind: ResourceKind,
    pub state: ResourceState,
    pub item: Option<ItemId>,
}

/// Published state of every resource, keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CellSnapshot {
    pub resources: BTreeMap<String, ResourceSnapshot>,
}

/// The scheduler contract, identical across strategies.
pub trait TransferScheduler: Send + Sync {
    fn strategy(&self) -> Strategy;

    fn topology(&self) -> &Topology;

    fn publisher(&self) -> &StatePublisher;

    /// Validate and queue a request. Assignment happens asynchronously.
    fn submit(&self, request: TransferRequest) -> Result<RequestId, CellError>;

    /// Report a physical state change of a robot or station.
    fn set_state(
        &self,
        resource: &str,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError>;

    /// Withdraw a request that is still queued. Returns whether it was found.
    fn cancel(&self, request: RequestId) -> Result<bool, CellError>;

    /// Requests not yet assigned. May be stale by the time it is read.
    fn queue_depth(&self) -> usize;

    /// Queued requests that have waited longer than the stall threshold.
    fn stalled_requests(&self) -> Vec<StallReport>;

    /// Block until every in-flight message has been handled.
    fn wait_idle(&self, timeout: Duration) -> bool;

    /// Stop accepting work and join any worker threads.
    fn shutdown(&self);

    /// Last published state of a resource, as a lowercase name.
    fn resource_state(&self, resource: &str) -> Result<String, CellError> {
        let handle = self.topology().handle(resource)?;
        self.publisher()
            .current(handle)
            .map(|event| event.state.to_string())
            .ok_or_else(|| CellError::UnknownResource(resource.to_string()))
    }

    fn subscribe(
        &self,
        resource: &str,
        listener: Arc<dyn StateListener>,
    ) -> Result<SubscriptionId, CellError> {
        let handle = self.topology().handle(resource)?;
        self.publisher().subscribe(handle, listener)
    }

    fn unsubscribe(
        &self,
        resource: &str,
        subscription: SubscriptionId,
    ) -> Result<bool, CellError> {
        let handle = self.topology().handle(resource)?;
        Ok(self.publisher().unsubscribe(handle, subscription))
    }

    fn snapshot(&self) -> CellSnapshot {
        let topology = self.topology();
        let resources = topology
            .handles()
            .filter_map(|handle| {
                let event = self.publisher().current(handle)?;
                Some((
                    topology.name(handle).to_string(),
                    ResourceSnapshot {
                        kind: event.kind,
                        state: event.state,
                        item: event.item,
                    },
                ))
            })
            .collect();
        CellSnapshot { resources }
    }
}

/// Build a scheduler for `strategy` over a fully registered cell.
pub fn build_scheduler(
    strategy: Strategy,
    registry: ResourceRegistry,
    options: SchedulerOptions,
    sink: Arc<dyn DispatchSink>,
) -> Result<Arc<dyn TransferScheduler>, CellError> {
    let scheduler: Arc<dyn TransferScheduler> = match strategy {
        Strategy::Lock => Arc::new(lock::LockScheduler::new(registry, options, sink)),
        Strategy::Mailbox => Arc::new(mailbox::MailboxScheduler::new(registry, options, sink)),
        Strategy::Agents => Arc::new(agents::AgentScheduler::new(registry, options, sink)?),
    };
    Ok(scheduler)
}

/// Front door shared by every strategy: id assignment, validation, routing policy.
pub(crate) struct Intake {
    topology: Arc<Topology>,
    next_id: AtomicU64,
    unroutable: UnroutablePolicy,
    stopped: AtomicBool,
}

impl Intake {
    pub(crate) fn new(topology: Arc<Topology>, unroutable: UnroutablePolicy) -> Self {
        Self {
            topology,
            next_id: AtomicU64::new(0),
            unroutable,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn accept(&self, request: TransferRequest) -> Result<QueuedRequest, CellError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CellError::SchedulerStopped);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let queued = request.resolve(id, &self.topology)?;
        let source = self.topology.name(queued.source);
        let destination = self.topology.name(queued.destination);
        if self
            .topology
            .routes()
            .eligible(queued.source, queued.destination)
            .is_empty()
        {
            match self.unroutable {
                UnroutablePolicy::Reject => {
                    return Err(CellError::RoutingExhausted {
                        source_name: source.to_string(),
                        destination: destination.to_string(),
                    });
                }
                UnroutablePolicy::Queue => warn!(
                    request = id,
                    item = queued.item,
                    source,
                    destination,
                    "no robot serves this route, request stays queued"
                ),
            }
        }
        debug!(request = id, item = queued.item, source, destination, "transfer submitted");
        Ok(queued)
    }

    pub(crate) fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Side effects produced under a scheduler's exclusive section and run after it.
pub(crate) enum Effect {
    Dispatch(TransferOrder),
    Delivered {
        request: RequestId,
        item: ItemId,
        callback: Option<CompletionCallback>,
    },
}

pub(crate) fn run_effects(effects: Vec<Effect>, sink: &dyn DispatchSink) {
    for effect in effects {
        match effect {
            Effect::Dispatch(order) => sink.dispatch(&order),
            Effect::Delivered {
                request,
                item,
                callback,
            } => {
                debug!(request, item, "transfer delivered");
                if let Some(callback) = callback {
                    callback(item);
                }
            }
        }
    }
}

/// Read access to occupancy, either authoritative or as observed through events.
pub(crate) trait OccupancyView {
    fn occupancy_of(&self, handle: ResourceHandle) -> Option<Occupancy>;
}

impl OccupancyView for ResourceRegistry {
    fn occupancy_of(&self, handle: ResourceHandle) -> Option<Occupancy> {
        Some(self.occupancy(handle))
    }
}

impl OccupancyView for HashMap<ResourceHandle, Occupancy> {
    fn occupancy_of(&self, handle: ResourceHandle) -> Option<Occupancy> {
        self.get(&handle).copied()
    }
}

/// Everything a commit claims: the destination station and the item itself.
pub(crate) struct Claims {
    pub(crate) stations: StationLeases,
    pub(crate) transit: TransitClaims,
}

impl Claims {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            stations: StationLeases::new(len),
            transit: TransitClaims::new(),
        }
    }

    /// Undo a reservation whose commit failed.
    pub(crate) fn release(&self, topology: &Topology, request: &QueuedRequest) {
        self.transit.release(request.item);
        if topology.kind(request.destination) == ResourceKind::Station {
            self.stations.release(request.destination);
        }
    }
}

fn source_ready(topology: &Topology, view: &impl OccupancyView, request: &QueuedRequest) -> bool {
    match topology.kind(request.source) {
        ResourceKind::Port => true,
        ResourceKind::Station => view.occupancy_of(request.source).is_some_and(|occupancy| {
            !occupancy.faulted
                && occupancy.state == ResourceState::Done
                && occupancy.item == Some(request.item)
        }),
        ResourceKind::Robot => false,
    }
}

fn destination_open(
    topology: &Topology,
    view: &impl OccupancyView,
    leases: &StationLeases,
    request: &QueuedRequest,
) -> bool {
    match topology.kind(request.destination) {
        ResourceKind::Port => true,
        ResourceKind::Station => {
            leases.holder(request.destination).is_none()
                && view.occupancy_of(request.destination).is_some_and(|occupancy| {
                    !occupancy.faulted && occupancy.state == ResourceState::Idle
                })
        }
        ResourceKind::Robot => false,
    }
}

/// Check the robot the router binds `request` to, then claim the item and its
/// destination, or leave everything untouched.
pub(crate) fn try_reserve(
    topology: &Topology,
    view: &impl OccupancyView,
    claims: &Claims,
    request: &QueuedRequest,
    robot_available: impl Fn(ResourceHandle) -> bool,
) -> Option<ResourceHandle> {
    if claims.transit.contains(request.item)
        || !source_ready(topology, view, request)
        || !destination_open(topology, view, &claims.stations, request)
    {
        return None;
    }
    let robot = topology
        .routes()
        .select(request.source, request.destination, request.preferred)
        .filter(|&robot| robot_available(robot))?;
    if !claims.transit.try_claim(request.item) {
        return None;
    }
    if topology.kind(request.destination) == ResourceKind::Station
        && !claims.stations.try_claim(request.destination, robot)
    {
        claims.transit.release(request.item);
        return None;
    }
    Some(robot)
}

pub(crate) fn order_for(topology: &Topology, robot: ResourceHandle, request: &QueuedRequest) -> TransferOrder {
    TransferOrder {
        request: request.id,
        robot: topology.name(robot).to_string(),
        item: request.item,
        source: topology.name(request.source).to_string(),
        destination: topology.name(request.destination).to_string(),
    }
}

/// Scheduling state owned exclusively by the lock and mailbox strategies.
pub(crate) struct DispatchCore {
    registry: ResourceRegistry,
    claims: Claims,
    queue: RequestQueue,
    active: HashMap<ResourceHandle, QueuedRequest>,
    stall: StallDetector,
}

impl DispatchCore {
    pub(crate) fn new(registry: ResourceRegistry, stall_after: Option<Duration>) -> Self {
        let claims = Claims::new(registry.topology().len());
        Self {
            registry,
            claims,
            queue: RequestQueue::new(),
            active: HashMap::new(),
            stall: StallDetector::new(stall_after),
        }
    }

    pub(crate) fn submit(&mut self, request: QueuedRequest) -> Vec<Effect> {
        self.queue.enqueue(request);
        self.dispatch()
    }

    pub(crate) fn set_state(
        &mut self,
        handle: ResourceHandle,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<Vec<Effect>, CellError> {
        let before = self.registry.occupancy(handle);
        self.registry.apply(handle, state, item)?;
        let mut effects = Vec::new();
        match self.registry.topology().kind(handle) {
            ResourceKind::Station
                if before.state != ResourceState::Idle && state == ResourceState::Idle =>
            {
                self.claims.stations.release(handle);
            }
            ResourceKind::Robot
                if before.state == ResourceState::Carrying && state == ResourceState::Idle =>
            {
                if let Some(mut delivered) = self.active.remove(&handle) {
                    self.claims.transit.release(delivered.item);
                    effects.push(Effect::Delivered {
                        request: delivered.id,
                        item: delivered.item,
                        callback: delivered.take_callback(),
                    });
                }
            }
            _ => {}
        }
        effects.extend(self.dispatch());
        Ok(effects)
    }

    pub(crate) fn cancel(&mut self, request: RequestId) -> bool {
        self.queue.remove(request).is_some()
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn stalled(&self) -> Vec<StallReport> {
        self.stall
            .scan(self.queue.iter(), self.registry.topology(), std::time::Instant::now())
    }

    fn dispatch(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            let registry = &self.registry;
            let claims = &self.claims;
            let active = &self.active;
            let topology = registry.topology();
            let matched = self.queue.dequeue_first_with(|request| {
                try_reserve(topology, registry, claims, request, |robot| {
                    let occupancy = registry.occupancy(robot);
                    !occupancy.faulted
                        && occupancy.state == ResourceState::Idle
                        && !active.contains_key(&robot)
                })
            });
            let Some((request, robot)) = matched else {
                break;
            };
            match self.commit(request, robot) {
                Some(order) => effects.push(Effect::Dispatch(order)),
                // The request went back on the queue; rescanning would pick it again.
                None => break,
            }
        }
        effects
    }

    fn commit(&mut self, request: QueuedRequest, robot: ResourceHandle) -> Option<TransferOrder> {
        let order = order_for(self.registry.topology(), robot, &request);
        if let Err(err) = self
            .registry
            .apply(robot, ResourceState::Busy, Some(request.item))
        {
            error!(robot = %order.robot, %err, "robot refused assignment");
            self.claims.release(self.registry.topology(), &request);
            self.queue.enqueue(request);
            return None;
        }
        debug!(
            request = order.request,
            item = order.item,
            robot = %order.robot,
            source = %order.source,
            destination = %order.destination,
            "transfer assigned"
        );
        self.active.insert(robot, request);
        Some(order)
    }
}
