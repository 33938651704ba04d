//! Strategy C: one reactive agent per robot.
//!
//! Each agent thread owns its robot's occupancy record, its own request
//! queue, and a view of the stations on its routes that is updated only by
//! state-change events. Station records live at the front-end behind one
//! lock per station. Destinations and items are arbitrated by shared claims,
//! so a stale view can delay an assignment but never double-book a station
//! or hand one wafer to two robots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::CellError;
use crate::mailbox::{InFlight, Mailbox};
use crate::publisher::{StateChangeEvent, StatePublisher};
use crate::registry::{Occupancy, ResourceRegistry, Topology};
use crate::request::{QueuedRequest, TransferRequest};
use crate::request_queue::RequestQueue;
use crate::types::{ItemId, RequestId, ResourceHandle, ResourceKind, ResourceState};

use super::stall::{StallDetector, StallReport};
use super::{
    Claims, DispatchSink, Intake, SchedulerOptions, Strategy, TransferScheduler, order_for,
    try_reserve,
};

enum AgentMessage {
    Submit(QueuedRequest),
    Observed(StateChangeEvent),
    StationFaulted(ResourceHandle),
    /// Another agent delivered this item; a request waiting on it may now fit.
    TransitCleared(ItemId),
    SetState {
        state: ResourceState,
        item: Option<ItemId>,
        reply: mpsc::Sender<Result<(), CellError>>,
    },
    Cancel {
        request: RequestId,
        reply: mpsc::Sender<bool>,
    },
    Stalled {
        reply: mpsc::Sender<Vec<StallReport>>,
    },
}

struct RobotAgent {
    robot: ResourceHandle,
    topology: Arc<Topology>,
    publisher: Arc<StatePublisher>,
    claims: Arc<Claims>,
    peers: Arc<Vec<Arc<Mailbox<AgentMessage>>>>,
    sink: Arc<dyn DispatchSink>,
    own: Occupancy,
    view: HashMap<ResourceHandle, Occupancy>,
    queue: RequestQueue,
    active: Option<QueuedRequest>,
    depth: Arc<AtomicUsize>,
    stall: StallDetector,
}

impl RobotAgent {
    fn name(&self) -> &str {
        self.topology.name(self.robot)
    }

    fn run(mut self, mailbox: &Mailbox<AgentMessage>) {
        while let Some(message) = mailbox.pop_blocking_or_closed() {
            let healthy = self.handle(message);
            mailbox.complete();
            if !healthy {
                let stranded = self.queue.len();
                self.depth.fetch_sub(stranded, Ordering::SeqCst);
                // Pending replies are dropped; their callers see the robot as faulted.
                let discarded = mailbox.close_and_discard();
                error!(
                    robot = self.name(),
                    stranded,
                    discarded = discarded.len(),
                    "agent stopped after invariant violation"
                );
                return;
            }
        }
        debug!(robot = self.name(), "agent mailbox drained");
    }

    /// Handle one message. Returns false once the robot has faulted.
    fn handle(&mut self, message: AgentMessage) -> bool {
        match message {
            AgentMessage::Submit(request) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                self.queue.enqueue(request);
            }
            AgentMessage::Observed(event) => {
                let faulted = self
                    .view
                    .get(&event.handle)
                    .is_some_and(|occupancy| occupancy.faulted);
                self.view.insert(
                    event.handle,
                    Occupancy {
                        state: event.state,
                        item: event.item,
                        faulted,
                    },
                );
            }
            AgentMessage::StationFaulted(station) => {
                self.view.entry(station).or_default().faulted = true;
            }
            AgentMessage::TransitCleared(_) => {}
            AgentMessage::SetState { state, item, reply } => {
                let outcome = self.apply(state, item);
                let healthy = !matches!(outcome, Err(CellError::InvariantViolation { .. }));
                if healthy {
                    self.dispatch();
                }
                let _ = reply.send(outcome);
                return healthy;
            }
            AgentMessage::Cancel { request, reply } => {
                let removed = self.queue.remove(request).is_some();
                if removed {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }
                let _ = reply.send(removed);
                return true;
            }
            AgentMessage::Stalled { reply } => {
                let reports = self
                    .stall
                    .scan(self.queue.iter(), &self.topology, Instant::now());
                let _ = reply.send(reports);
                return true;
            }
        }
        self.dispatch();
        true
    }

    fn apply(&mut self, state: ResourceState, item: Option<ItemId>) -> Result<(), CellError> {
        let before = self.own.state;
        let name = self.topology.name(self.robot);
        self.own
            .transition(name, ResourceKind::Robot, state, item)?;
        self.publisher.publish(self.robot, state, item);
        if before == ResourceState::Carrying && state == ResourceState::Idle {
            if let Some(mut delivered) = self.active.take() {
                self.claims.transit.release(delivered.item);
                for peer in self.peers.iter() {
                    // Stopped agents have closed their mailboxes.
                    let _ = peer.push(AgentMessage::TransitCleared(delivered.item));
                }
                debug!(request = delivered.id, item = delivered.item, robot = name, "transfer delivered");
                if let Some(callback) = delivered.take_callback() {
                    callback(delivered.item);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self) {
        if self.own.faulted || self.own.state != ResourceState::Idle || self.active.is_some() {
            return;
        }
        let robot = self.robot;
        let topology = &self.topology;
        let view = &self.view;
        let claims = &self.claims;
        let matched = self.queue.dequeue_first_with(|request| {
            try_reserve(topology, view, claims, request, |candidate| candidate == robot)
        });
        let Some((request, _)) = matched else {
            return;
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);

        let order = order_for(&self.topology, robot, &request);
        let name = self.topology.name(robot);
        if let Err(err) = self
            .own
            .transition(name, ResourceKind::Robot, ResourceState::Busy, Some(request.item))
        {
            error!(robot = name, %err, "robot refused assignment");
            self.claims.release(&self.topology, &request);
            self.depth.fetch_add(1, Ordering::SeqCst);
            self.queue.enqueue(request);
            return;
        }
        self.publisher
            .publish(robot, ResourceState::Busy, Some(request.item));
        debug!(
            request = order.request,
            item = order.item,
            robot = %order.robot,
            source = %order.source,
            destination = %order.destination,
            "transfer assigned"
        );
        self.active = Some(request);
        self.sink.dispatch(&order);
    }
}

struct AgentSlot {
    mailbox: Arc<Mailbox<AgentMessage>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Scheduler front-end routing each request to the agent of its robot.
pub struct AgentScheduler {
    intake: Intake,
    publisher: Arc<StatePublisher>,
    claims: Arc<Claims>,
    agents: HashMap<ResourceHandle, AgentSlot>,
    stations: Vec<Option<Mutex<Occupancy>>>,
    parked: Mutex<RequestQueue>,
    parked_stall: StallDetector,
    tracker: Arc<InFlight>,
    depth: Arc<AtomicUsize>,
}

impl AgentScheduler {
    pub fn new(
        registry: ResourceRegistry,
        options: SchedulerOptions,
        sink: Arc<dyn DispatchSink>,
    ) -> Result<Self, CellError> {
        let (topology, slots, publisher) = registry.into_parts();
        let claims = Arc::new(Claims::new(topology.len()));
        let tracker = Arc::new(InFlight::new());
        let depth = Arc::new(AtomicUsize::new(0));

        let mut mailboxes = Vec::new();
        for robot in topology.robots() {
            let mailbox = Arc::new(Mailbox::with_tracker(Arc::clone(&tracker)));
            for location in topology.routes().locations_of(robot) {
                if topology.kind(location) != ResourceKind::Station {
                    continue;
                }
                let inbox = Arc::clone(&mailbox);
                publisher.subscribe(
                    location,
                    Arc::new(move |event: &StateChangeEvent| {
                        // A stopped agent no longer needs updates.
                        let _ = inbox.push(AgentMessage::Observed(event.clone()));
                    }),
                )?;
            }
            mailboxes.push((robot, mailbox));
        }
        let everyone: Arc<Vec<_>> = Arc::new(
            mailboxes
                .iter()
                .map(|(_, mailbox)| Arc::clone(mailbox))
                .collect(),
        );

        let mut agents = HashMap::new();
        for (robot, mailbox) in mailboxes {
            let agent = RobotAgent {
                robot,
                topology: Arc::clone(&topology),
                publisher: Arc::clone(&publisher),
                claims: Arc::clone(&claims),
                peers: Arc::clone(&everyone),
                sink: Arc::clone(&sink),
                own: slots[robot.index()],
                view: HashMap::new(),
                queue: RequestQueue::new(),
                active: None,
                depth: Arc::clone(&depth),
                stall: StallDetector::new(options.stall_after),
            };
            let worker = {
                let mailbox = Arc::clone(&mailbox);
                thread::Builder::new()
                    .name(format!("agent-{}", topology.name(robot)))
                    .spawn(move || agent.run(&mailbox))
                    .expect("failed to spawn agent thread")
            };
            agents.insert(
                robot,
                AgentSlot {
                    mailbox,
                    worker: Mutex::new(Some(worker)),
                },
            );
        }

        let stations = topology
            .handles()
            .map(|handle| {
                (topology.kind(handle) == ResourceKind::Station)
                    .then(|| Mutex::new(slots[handle.index()]))
            })
            .collect();
        info!(agents = agents.len(), "agent scheduler started");

        Ok(Self {
            intake: Intake::new(topology, options.unroutable),
            publisher,
            claims,
            agents,
            stations,
            parked: Mutex::new(RequestQueue::new()),
            parked_stall: StallDetector::new(options.stall_after),
            tracker,
            depth,
        })
    }

    fn agent(&self, robot: ResourceHandle) -> Result<&AgentSlot, CellError> {
        self.agents
            .get(&robot)
            .ok_or_else(|| CellError::UnknownResource(self.topology().name(robot).to_string()))
    }

    fn set_station(
        &self,
        station: ResourceHandle,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError> {
        let name = self.topology().name(station);
        let Some(record) = &self.stations[station.index()] else {
            return Err(CellError::UnknownResource(name.to_string()));
        };
        let mut occupancy = record.lock().expect("station mutex poisoned");
        let before = occupancy.state;
        match occupancy.transition(name, ResourceKind::Station, state, item) {
            Ok(()) => {
                // Release before publishing: agents re-check the lease when the event lands.
                if before != ResourceState::Idle && state == ResourceState::Idle {
                    self.claims.stations.release(station);
                }
                self.publisher.publish(station, state, item);
                Ok(())
            }
            Err(err) => {
                if matches!(err, CellError::InvariantViolation { .. }) {
                    self.notify_station_fault(station);
                }
                Err(err)
            }
        }
    }

    fn notify_station_fault(&self, station: ResourceHandle) {
        for (&robot, slot) in &self.agents {
            let serves = self
                .topology()
                .routes()
                .routes_of(robot)
                .iter()
                .any(|&(source, destination)| source == station || destination == station);
            if serves {
                let _ = slot.mailbox.push(AgentMessage::StationFaulted(station));
            }
        }
    }

    fn set_robot(
        &self,
        robot: ResourceHandle,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError> {
        let name = self.topology().name(robot);
        let slot = self.agent(robot)?;
        let (reply, outcome) = mpsc::channel();
        slot.mailbox
            .push(AgentMessage::SetState { state, item, reply })
            .map_err(|_| CellError::ResourceFaulted(name.to_string()))?;
        outcome
            .recv()
            .map_err(|_| CellError::ResourceFaulted(name.to_string()))?
    }
}

impl TransferScheduler for AgentScheduler {
    fn strategy(&self) -> Strategy {
        Strategy::Agents
    }

    fn topology(&self) -> &Topology {
        self.intake.topology()
    }

    fn publisher(&self) -> &StatePublisher {
        &self.publisher
    }

    fn submit(&self, request: TransferRequest) -> Result<RequestId, CellError> {
        let queued = self.intake.accept(request)?;
        let id = queued.id;
        let owner = self
            .topology()
            .routes()
            .select(queued.source, queued.destination, queued.preferred);
        match owner {
            Some(robot) => {
                let slot = self.agent(robot)?;
                slot.mailbox
                    .push(AgentMessage::Submit(queued))
                    .map_err(|_| {
                        CellError::ResourceFaulted(self.topology().name(robot).to_string())
                    })?;
            }
            None => {
                // Accepted under the queue policy; nothing can ever serve it.
                self.parked
                    .lock()
                    .expect("parked queue mutex poisoned")
                    .enqueue(queued);
            }
        }
        Ok(id)
    }

    fn set_state(
        &self,
        resource: &str,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError> {
        let handle = self.topology().handle(resource)?;
        match self.topology().kind(handle) {
            ResourceKind::Robot => self.set_robot(handle, state, item),
            ResourceKind::Station => self.set_station(handle, state, item),
            ResourceKind::Port => Err(CellError::Validation(format!(
                "port {resource} has no occupancy"
            ))),
        }
    }

    fn cancel(&self, request: RequestId) -> Result<bool, CellError> {
        if self
            .parked
            .lock()
            .expect("parked queue mutex poisoned")
            .remove(request)
            .is_some()
        {
            return Ok(true);
        }
        for slot in self.agents.values() {
            let (reply, outcome) = mpsc::channel();
            if slot
                .mailbox
                .push(AgentMessage::Cancel { request, reply })
                .is_err()
            {
                continue;
            }
            if outcome.recv().unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn queue_depth(&self) -> usize {
        let parked = self
            .parked
            .lock()
            .expect("parked queue mutex poisoned")
            .len();
        self.depth.load(Ordering::SeqCst) + parked
    }

    fn stalled_requests(&self) -> Vec<StallReport> {
        let mut reports = {
            let parked = self.parked.lock().expect("parked queue mutex poisoned");
            self.parked_stall
                .scan(parked.iter(), self.topology(), Instant::now())
        };
        for slot in self.agents.values() {
            let (reply, outcome) = mpsc::channel();
            if slot.mailbox.push(AgentMessage::Stalled { reply }).is_ok() {
                reports.extend(outcome.recv().unwrap_or_default());
            }
        }
        reports.sort_by_key(|report| report.request);
        reports
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        self.tracker.wait_settled(timeout)
    }

    fn shutdown(&self) {
        self.intake.stop();
        for slot in self.agents.values() {
            slot.mailbox.close();
        }
        let current = thread::current().id();
        for (robot, slot) in &self.agents {
            let worker = slot
                .worker
                .lock()
                .expect("agent worker mutex poisoned")
                .take();
            let Some(worker) = worker else {
                continue;
            };
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(robot = self.topology().name(*robot), "agent thread panicked");
            }
        }
        info!("agent scheduler stopped");
    }
}

impl Drop for AgentScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
