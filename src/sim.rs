//! Process simulator and end-to-end demo runner for the wafer cell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditReport, OccupancyAudit};
use crate::config::{CellConfig, SimTiming};
use crate::error::CellError;
use crate::journey::{DepartedBatch, JourneyCoordinator, JourneyRoute};
use crate::mailbox::{InFlight, Mailbox};
use crate::registry::{ResourceRegistry, Topology};
use crate::scheduler::{
    DispatchSink, SchedulerOptions, Strategy, TransferScheduler, build_scheduler,
};
use crate::types::{ItemId, ResourceState, StationRole, TransferOrder};

// Poll interval of the stall watcher during a demo.
const STALL_POLL_MS: u64 = 50;
// Extra slack on top of the nominal batch duration before giving up.
const BATCH_TIMEOUT_SLACK_MS: u64 = 10_000;

/// The standard four-location cell with three transfer robots.
pub fn standard_cell_registry() -> Result<ResourceRegistry, CellError> {
    let route = JourneyRoute::default();
    let mut registry = ResourceRegistry::new();
    registry.register_port(&route.carrier)?;
    registry.register_station(&route.polisher, StationRole::Process)?;
    registry.register_station(&route.cleaner, StationRole::Process)?;
    registry.register_station(&route.buffer, StationRole::Buffer)?;
    registry.register_robot(
        "R1",
        &[
            (route.carrier.as_str(), route.polisher.as_str()),
            (route.buffer.as_str(), route.carrier.as_str()),
        ],
    )?;
    registry.register_robot("R2", &[(route.polisher.as_str(), route.cleaner.as_str())])?;
    registry.register_robot("R3", &[(route.cleaner.as_str(), route.buffer.as_str())])?;
    Ok(registry)
}

/// State shared between the simulator handle and its worker threads.
struct Plant {
    scheduler: OnceLock<Weak<dyn TransferScheduler>>,
    roles: HashMap<String, StationRole>,
    stations: HashMap<String, Arc<Mailbox<ItemId>>>,
    timing: SimTiming,
    moves: AtomicUsize,
}

impl Plant {
    fn scheduler(&self) -> Option<Arc<dyn TransferScheduler>> {
        self.scheduler.get()?.upgrade()
    }

    fn report(&self, resource: &str, state: ResourceState, item: Option<ItemId>) {
        let Some(scheduler) = self.scheduler() else {
            warn!(resource, %state, "simulator has no scheduler attached");
            return;
        };
        if let Err(err) = scheduler.set_state(resource, state, item) {
            error!(resource, %state, ?item, %err, "scheduler rejected simulated state");
        }
    }

    fn dwell(&self, role: StationRole) -> Duration {
        match role {
            StationRole::Process => Duration::from_millis(self.timing.process_ms),
            StationRole::Buffer => Duration::from_millis(self.timing.buffer_ms),
        }
    }

    /// Drive one transfer order: pickup, travel, put-down.
    fn carry(&self, order: &TransferOrder) {
        let travel = Duration::from_millis(self.timing.move_ms);
        thread::sleep(travel);
        if self.roles.contains_key(&order.source) {
            self.report(&order.source, ResourceState::Idle, None);
        }
        self.report(&order.robot, ResourceState::Carrying, Some(order.item));
        thread::sleep(travel);
        if let Some(role) = self.roles.get(&order.destination) {
            self.report(&order.destination, role.delivery_state(), Some(order.item));
        }
        self.report(&order.robot, ResourceState::Idle, None);
        if let Some(station) = self.stations.get(&order.destination) {
            let _ = station.push(order.item);
        }
        self.moves.fetch_add(1, Ordering::SeqCst);
        debug!(
            robot = %order.robot,
            item = order.item,
            destination = %order.destination,
            "simulated move finished"
        );
    }
}

/// Robot controller and station equipment stand-in.
///
/// Each robot and each station gets a worker thread. Robots execute the
/// orders they are dispatched; stations dwell on a delivered wafer and then
/// report it done.
pub struct ProcessSimulator {
    plant: Arc<Plant>,
    robots: HashMap<String, Arc<Mailbox<TransferOrder>>>,
    tracker: Arc<InFlight>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ProcessSimulator {
    pub fn new(topology: &Topology, timing: SimTiming) -> Arc<Self> {
        let tracker = Arc::new(InFlight::new());
        let mut roles = HashMap::new();
        let mut stations = HashMap::new();
        for handle in topology.stations() {
            let name = topology.name(handle).to_string();
            if let Some(role) = topology.role(handle) {
                roles.insert(name.clone(), role);
            }
            stations.insert(name, Arc::new(Mailbox::with_tracker(Arc::clone(&tracker))));
        }
        let plant = Arc::new(Plant {
            scheduler: OnceLock::new(),
            roles,
            stations,
            timing,
            moves: AtomicUsize::new(0),
        });

        let mut workers = Vec::new();
        for (name, inbox) in &plant.stations {
            let plant = Arc::clone(&plant);
            let inbox = Arc::clone(inbox);
            let station = name.clone();
            let worker = thread::Builder::new()
                .name(format!("station-{station}"))
                .spawn(move || {
                    let dwell = plant
                        .roles
                        .get(&station)
                        .map(|role| plant.dwell(*role))
                        .unwrap_or_default();
                    while let Some(item) = inbox.pop_blocking_or_closed() {
                        thread::sleep(dwell);
                        plant.report(&station, ResourceState::Done, Some(item));
                        inbox.complete();
                    }
                })
                .expect("failed to spawn station thread");
            workers.push(worker);
        }

        let mut robots = HashMap::new();
        for handle in topology.robots() {
            let name = topology.name(handle).to_string();
            let inbox = Arc::new(Mailbox::with_tracker(Arc::clone(&tracker)));
            let worker = {
                let plant = Arc::clone(&plant);
                let inbox = Arc::clone(&inbox);
                thread::Builder::new()
                    .name(format!("robot-{name}"))
                    .spawn(move || {
                        while let Some(order) = inbox.pop_blocking_or_closed() {
                            plant.carry(&order);
                            inbox.complete();
                        }
                    })
                    .expect("failed to spawn robot thread")
            };
            workers.push(worker);
            robots.insert(name, inbox);
        }

        Arc::new(Self {
            plant,
            robots,
            tracker,
            workers: Mutex::new(workers),
        })
    }

    /// Connect the simulator to the scheduler it reports to.
    pub fn attach(&self, scheduler: &Arc<dyn TransferScheduler>) {
        if self.plant.scheduler.set(Arc::downgrade(scheduler)).is_err() {
            warn!("simulator already attached");
        }
    }

    /// Transfers carried out so far.
    pub fn moves_completed(&self) -> usize {
        self.plant.moves.load(Ordering::SeqCst)
    }

    /// Block until no robot or station has pending work.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.tracker.wait_settled(timeout)
    }

    pub fn shutdown(&self) {
        for inbox in self.robots.values() {
            inbox.close();
        }
        for inbox in self.plant.stations.values() {
            inbox.close();
        }
        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("simulator worker mutex poisoned")
            .drain(..)
            .collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("simulator thread panicked");
            }
        }
    }
}

impl Drop for ProcessSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DispatchSink for ProcessSimulator {
    fn dispatch(&self, order: &TransferOrder) {
        match self.robots.get(&order.robot) {
            Some(inbox) => {
                if inbox.push(order.clone()).is_err() {
                    warn!(robot = %order.robot, request = order.request, "robot controller stopped");
                }
            }
            None => warn!(robot = %order.robot, "order for a robot the simulator does not drive"),
        }
    }
}

fn spawn_stall_watch(
    scheduler: Arc<dyn TransferScheduler>,
    stop_flag: Arc<AtomicBool>,
    stalled_seen: Arc<AtomicUsize>,
    poll: Duration,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("stall-watch".to_string())
        .spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                let stalled = scheduler.stalled_requests().len();
                stalled_seen.fetch_max(stalled, Ordering::SeqCst);
                thread::sleep(poll);
            }
        })
        .expect("failed to spawn stall watcher")
}

/// Outcome of one demo run.
#[derive(Clone, Debug, Serialize)]
pub struct DemoSummary {
    pub strategy: Strategy,
    pub batches_requested: usize,
    pub batches_completed: usize,
    pub wafers_per_batch: usize,
    pub transfers: usize,
    pub elapsed_ms: u64,
    pub final_queue_depth: usize,
    pub max_stalled_requests: usize,
    pub mutual_exclusion_violation: bool,
    pub audit: AuditReport,
    pub departed: Vec<DepartedBatch>,
}

/// Run `batches` batches of `wafers` wafers each through the standard cell.
pub fn run_demo(config: &CellConfig, batches: usize, wafers: usize) -> Result<DemoSummary, CellError> {
    if batches == 0 || wafers == 0 {
        return Err(CellError::Validation(
            "batches and wafers must be positive".to_string(),
        ));
    }
    info!(strategy = %config.strategy, batches, wafers, "demo start");

    let registry = standard_cell_registry()?;
    let audit = OccupancyAudit::attach(registry.topology(), registry.publisher())?;
    let simulator = ProcessSimulator::new(registry.topology(), config.timing);
    let scheduler = build_scheduler(
        config.strategy,
        registry,
        SchedulerOptions::from(config),
        Arc::clone(&simulator) as Arc<dyn DispatchSink>,
    )?;
    simulator.attach(&scheduler);
    let coordinator = JourneyCoordinator::new(Arc::clone(&scheduler), JourneyRoute::default())?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stalled_seen = Arc::new(AtomicUsize::new(0));
    let watcher = spawn_stall_watch(
        Arc::clone(&scheduler),
        Arc::clone(&stop_flag),
        Arc::clone(&stalled_seen),
        Duration::from_millis(STALL_POLL_MS),
    );

    // Four legs per wafer, two travel halves per leg, plus every dwell.
    let timing = config.timing;
    let per_wafer = 8 * timing.move_ms + 2 * timing.process_ms + timing.buffer_ms;
    let batch_timeout =
        Duration::from_millis(per_wafer * wafers as u64 + BATCH_TIMEOUT_SLACK_MS);

    let start = Instant::now();
    let mut completed = 0;
    let mut outcome = Ok(());
    for index in 0..batches {
        let batch = format!("LOT-{:02}", index + 1);
        let first = (index * wafers) as ItemId + 1;
        let items: Vec<ItemId> = (first..first + wafers as ItemId).collect();
        if let Err(err) = coordinator.on_arrival(&batch, &items) {
            outcome = Err(err);
            break;
        }
        if !coordinator.wait_for_batch_complete(batch_timeout) {
            warn!(batch = %batch, "batch did not complete in time");
            break;
        }
        match coordinator.on_departure(&batch) {
            Ok(_) => completed += 1,
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    simulator.wait_idle(Duration::from_secs(5));
    scheduler.wait_idle(Duration::from_secs(5));
    stop_flag.store(true, Ordering::SeqCst);
    if watcher.join().is_err() {
        error!("stall watcher panicked");
    }

    let summary = DemoSummary {
        strategy: config.strategy,
        batches_requested: batches,
        batches_completed: completed,
        wafers_per_batch: wafers,
        transfers: simulator.moves_completed(),
        elapsed_ms,
        final_queue_depth: scheduler.queue_depth(),
        max_stalled_requests: stalled_seen.load(Ordering::SeqCst),
        mutual_exclusion_violation: audit.has_violation(),
        audit: audit.report(),
        departed: coordinator.departed_batches(),
    };

    coordinator.shutdown();
    scheduler.shutdown();
    simulator.shutdown();
    outcome?;
    info!(
        completed = summary.batches_completed,
        transfers = summary.transfers,
        elapsed_ms = summary.elapsed_ms,
        "demo finished"
    );
    Ok(summary)
}
