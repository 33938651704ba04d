//! Behaviour every scheduler strategy must share.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rstest::rstest;

use wafer_cell::audit::OccupancyAudit;
use wafer_cell::config::SimTiming;
use wafer_cell::sim::{ProcessSimulator, standard_cell_registry};
use wafer_cell::{
    CellError, CellSnapshot, DispatchSink, ItemId, JourneyCoordinator, JourneyRoute, JourneyStage,
    ResourceRegistry, ResourceState, SchedulerOptions, StateChangeEvent, StationRole, Strategy,
    TransferOrder, TransferRequest, TransferScheduler, UnroutablePolicy, build_scheduler,
};

const SETTLE: Duration = Duration::from_secs(5);

/// Sink that only records orders; tests play the robot controller by hand.
#[derive(Default)]
struct RecordingSink {
    orders: Mutex<Vec<TransferOrder>>,
}

impl RecordingSink {
    fn orders(&self) -> Vec<TransferOrder> {
        self.orders.lock().expect("orders mutex poisoned").clone()
    }
}

impl DispatchSink for RecordingSink {
    fn dispatch(&self, order: &TransferOrder) {
        self.orders
            .lock()
            .expect("orders mutex poisoned")
            .push(order.clone());
    }
}

fn manual_cell(
    strategy: Strategy,
    registry: ResourceRegistry,
    options: SchedulerOptions,
) -> (Arc<dyn TransferScheduler>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let scheduler = build_scheduler(
        strategy,
        registry,
        options,
        Arc::clone(&sink) as Arc<dyn DispatchSink>,
    )
    .expect("scheduler");
    (scheduler, sink)
}

fn standard(strategy: Strategy) -> (Arc<dyn TransferScheduler>, Arc<RecordingSink>) {
    manual_cell(
        strategy,
        standard_cell_registry().expect("cell"),
        SchedulerOptions::default(),
    )
}

fn settle(scheduler: &Arc<dyn TransferScheduler>) {
    assert!(scheduler.wait_idle(SETTLE), "scheduler did not settle");
}

fn set(scheduler: &Arc<dyn TransferScheduler>, resource: &str, state: ResourceState, item: Option<ItemId>) {
    scheduler
        .set_state(resource, state, item)
        .unwrap_or_else(|err| panic!("{resource} -> {state}: {err}"));
    settle(scheduler);
}

fn submit(scheduler: &Arc<dyn TransferScheduler>, request: TransferRequest) -> u64 {
    let id = scheduler.submit(request).expect("submit");
    settle(scheduler);
    id
}

fn record_states(
    scheduler: &Arc<dyn TransferScheduler>,
    resource: &str,
) -> Arc<Mutex<Vec<ResourceState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    scheduler
        .subscribe(
            resource,
            Arc::new(move |event: &StateChangeEvent| {
                sink.lock().expect("states mutex poisoned").push(event.state);
            }),
        )
        .expect("subscribe");
    seen
}

fn completions() -> (Arc<Mutex<Vec<ItemId>>>, impl Fn() -> Box<dyn FnOnce(ItemId) + Send>) {
    let done = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&done);
    let make = move || {
        let done = Arc::clone(&shared);
        Box::new(move |item: ItemId| done.lock().expect("done mutex poisoned").push(item))
            as Box<dyn FnOnce(ItemId) + Send>
    };
    (done, make)
}

#[rstest]
fn single_transfer_walks_robot_and_station_states(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, sink) = standard(strategy);
    let r1 = record_states(&scheduler, "R1");
    let polisher = record_states(&scheduler, "Polisher");
    let (done, callback) = completions();

    let id = submit(
        &scheduler,
        TransferRequest::new(1, "Carrier", "Polisher").on_complete(callback()),
    );
    let orders = sink.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].request, id);
    assert_eq!(orders[0].robot, "R1");
    assert_eq!(scheduler.resource_state("R1").as_deref(), Ok("busy"));

    set(&scheduler, "R1", ResourceState::Carrying, Some(1));
    set(&scheduler, "Polisher", ResourceState::Processing, Some(1));
    set(&scheduler, "R1", ResourceState::Idle, None);

    use ResourceState::*;
    assert_eq!(*r1.lock().expect("states"), vec![Idle, Busy, Carrying, Idle]);
    assert_eq!(*polisher.lock().expect("states"), vec![Idle, Processing]);
    assert_eq!(*done.lock().expect("done"), vec![1]);
    assert_eq!(scheduler.queue_depth(), 0);
    scheduler.shutdown();
}

#[rstest]
fn busy_robot_leaves_second_request_queued(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, sink) = standard(strategy);
    set(&scheduler, "Buffer", ResourceState::Done, Some(9));
    submit(&scheduler, TransferRequest::new(1, "Carrier", "Polisher"));
    let second = submit(&scheduler, TransferRequest::new(9, "Buffer", "Carrier"));
    assert_eq!(sink.orders().len(), 1);
    assert_eq!(scheduler.queue_depth(), 1);

    set(&scheduler, "R1", ResourceState::Carrying, Some(1));
    set(&scheduler, "Polisher", ResourceState::Processing, Some(1));
    set(&scheduler, "R1", ResourceState::Idle, None);

    let orders = sink.orders();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].request, second);
    assert_eq!(orders[1].robot, "R1");
    assert_eq!(scheduler.queue_depth(), 0);
    scheduler.shutdown();
}

#[rstest]
fn occupied_destination_blocks_until_emptied(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, sink) = standard(strategy);
    set(&scheduler, "Cleaner", ResourceState::Processing, Some(5));
    set(&scheduler, "Polisher", ResourceState::Done, Some(4));
    submit(&scheduler, TransferRequest::new(4, "Polisher", "Cleaner"));
    assert!(sink.orders().is_empty());
    assert_eq!(scheduler.queue_depth(), 1);

    set(&scheduler, "Cleaner", ResourceState::Done, Some(5));
    assert!(sink.orders().is_empty());
    set(&scheduler, "Cleaner", ResourceState::Idle, None);
    let orders = sink.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].robot, "R2");
    assert_eq!(orders[0].item, 4);
    scheduler.shutdown();
}

#[rstest]
fn eligible_hint_binds_the_request(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let mut registry = ResourceRegistry::new();
    registry.register_port("Carrier").expect("carrier");
    registry
        .register_station("Polisher", StationRole::Process)
        .expect("polisher");
    registry
        .register_station("Cleaner", StationRole::Process)
        .expect("cleaner");
    for robot in ["R1", "R2"] {
        registry
            .register_robot(robot, &[("Carrier", "Polisher"), ("Carrier", "Cleaner")])
            .expect("robot");
    }
    let (scheduler, sink) = manual_cell(strategy, registry, SchedulerOptions::default());

    submit(
        &scheduler,
        TransferRequest::new(1, "Carrier", "Polisher").prefer_robot("R2"),
    );
    submit(&scheduler, TransferRequest::new(2, "Carrier", "Cleaner"));
    let robots: Vec<_> = sink.orders().into_iter().map(|order| order.robot).collect();
    assert_eq!(robots, vec!["R2", "R1"]);
    scheduler.shutdown();
}

fn shared_route(strategy: Strategy) -> (Vec<(String, ItemId)>, CellSnapshot) {
    let mut registry = ResourceRegistry::new();
    registry.register_port("Carrier").expect("carrier");
    registry
        .register_station("Polisher", StationRole::Process)
        .expect("polisher");
    registry
        .register_station("Cleaner", StationRole::Process)
        .expect("cleaner");
    registry
        .register_robot("R1", &[("Carrier", "Polisher"), ("Carrier", "Cleaner")])
        .expect("r1");
    registry
        .register_robot("R2", &[("Carrier", "Cleaner")])
        .expect("r2");
    let (scheduler, sink) = manual_cell(strategy, registry, SchedulerOptions::default());
    use ResourceState::*;

    submit(&scheduler, TransferRequest::new(1, "Carrier", "Polisher"));
    submit(&scheduler, TransferRequest::new(2, "Carrier", "Cleaner"));
    // Item 2 is bound to R1, the first robot registered for its route.
    assert_eq!(sink.orders().len(), 1, "{strategy} used the idle robot");
    assert_eq!(scheduler.queue_depth(), 1);
    assert_eq!(scheduler.resource_state("R2").as_deref(), Ok("idle"));

    set(&scheduler, "R1", Carrying, Some(1));
    set(&scheduler, "Polisher", Processing, Some(1));
    set(&scheduler, "R1", Idle, None);

    let orders = sink
        .orders()
        .into_iter()
        .map(|order| (order.robot, order.item))
        .collect();
    let snapshot = scheduler.snapshot();
    scheduler.shutdown();
    (orders, snapshot)
}

#[test]
fn strategies_agree_when_robots_share_a_route() {
    let (orders, snapshot) = shared_route(Strategy::Lock);
    assert_eq!(orders, vec![("R1".to_string(), 1), ("R1".to_string(), 2)]);
    assert_eq!(snapshot.resources["R1"].state, ResourceState::Busy);
    assert_eq!(snapshot.resources["R2"].state, ResourceState::Idle);

    for strategy in [Strategy::Mailbox, Strategy::Agents] {
        let (other_orders, other_snapshot) = shared_route(strategy);
        assert_eq!(other_orders, orders, "{strategy} dispatched differently");
        assert_eq!(other_snapshot, snapshot, "{strategy} ended in another state");
    }
}

#[rstest]
fn one_item_is_never_handed_to_two_robots(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let mut registry = ResourceRegistry::new();
    registry.register_port("Carrier").expect("carrier");
    registry
        .register_station("Polisher", StationRole::Process)
        .expect("polisher");
    for robot in ["R1", "R2"] {
        registry
            .register_robot(robot, &[("Polisher", "Carrier")])
            .expect("robot");
    }
    let audit = OccupancyAudit::attach(registry.topology(), registry.publisher()).expect("audit");
    let (scheduler, sink) = manual_cell(strategy, registry, SchedulerOptions::default());
    use ResourceState::*;

    set(&scheduler, "Polisher", Done, Some(7));
    submit(&scheduler, TransferRequest::new(7, "Polisher", "Carrier"));
    submit(
        &scheduler,
        TransferRequest::new(7, "Polisher", "Carrier").prefer_robot("R2"),
    );
    let orders = sink.orders();
    assert_eq!(orders.len(), 1, "item 7 dispatched twice under {strategy}");
    assert_eq!(orders[0].robot, "R1");
    assert_eq!(scheduler.queue_depth(), 1);
    assert_eq!(scheduler.resource_state("R2").as_deref(), Ok("idle"));

    // Once delivered, the wafer has left the polisher; the duplicate stays put.
    set(&scheduler, "R1", Carrying, Some(7));
    set(&scheduler, "Polisher", Idle, None);
    set(&scheduler, "R1", Idle, None);
    assert_eq!(sink.orders().len(), 1);
    assert_eq!(scheduler.queue_depth(), 1);
    assert!(!audit.has_violation(), "{:?}", audit.report().violations);
    scheduler.shutdown();
}

#[rstest]
fn late_subscriber_sees_current_state_first(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, _sink) = standard(strategy);
    submit(&scheduler, TransferRequest::new(3, "Carrier", "Polisher"));
    let r1 = record_states(&scheduler, "R1");
    assert_eq!(*r1.lock().expect("states"), vec![ResourceState::Busy]);
    scheduler.shutdown();
}

#[rstest]
fn cancel_only_touches_queued_requests(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, _sink) = standard(strategy);
    let assigned = submit(&scheduler, TransferRequest::new(1, "Carrier", "Polisher"));
    let waiting = submit(&scheduler, TransferRequest::new(2, "Carrier", "Polisher"));
    assert_eq!(scheduler.queue_depth(), 1);

    assert_eq!(scheduler.cancel(assigned), Ok(false));
    assert_eq!(scheduler.cancel(waiting), Ok(true));
    assert_eq!(scheduler.cancel(waiting), Ok(false));
    assert_eq!(scheduler.queue_depth(), 0);
    scheduler.shutdown();
}

#[rstest]
fn unroutable_requests_follow_policy(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let reject = SchedulerOptions {
        unroutable: UnroutablePolicy::Reject,
        ..SchedulerOptions::default()
    };
    let (scheduler, _sink) = manual_cell(strategy, standard_cell_registry().expect("cell"), reject);
    assert!(matches!(
        scheduler.submit(TransferRequest::new(1, "Polisher", "Carrier")),
        Err(CellError::RoutingExhausted { .. })
    ));
    assert_eq!(scheduler.queue_depth(), 0);
    scheduler.shutdown();

    let queue = SchedulerOptions {
        unroutable: UnroutablePolicy::Queue,
        stall_after: Some(Duration::from_millis(1)),
    };
    let (scheduler, sink) = manual_cell(strategy, standard_cell_registry().expect("cell"), queue);
    let parked = submit(&scheduler, TransferRequest::new(1, "Polisher", "Carrier"));
    assert_eq!(scheduler.queue_depth(), 1);
    thread::sleep(Duration::from_millis(20));

    let stalled = scheduler.stalled_requests();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].request, parked);
    assert!(stalled[0].unroutable);
    assert!(sink.orders().is_empty());

    assert_eq!(scheduler.cancel(parked), Ok(true));
    assert_eq!(scheduler.queue_depth(), 0);
    assert!(scheduler.stalled_requests().is_empty());
    scheduler.shutdown();
}

#[rstest]
fn waiting_request_is_reported_stalled(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let options = SchedulerOptions {
        stall_after: Some(Duration::from_millis(1)),
        ..SchedulerOptions::default()
    };
    let (scheduler, _sink) =
        manual_cell(strategy, standard_cell_registry().expect("cell"), options);
    // Nothing has finished on the polisher, so the pickup never becomes ready.
    let waiting = submit(&scheduler, TransferRequest::new(4, "Polisher", "Cleaner"));
    thread::sleep(Duration::from_millis(20));
    let stalled = scheduler.stalled_requests();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].request, waiting);
    assert_eq!(stalled[0].source, "Polisher");
    assert!(!stalled[0].unroutable);
    scheduler.shutdown();
}

#[rstest]
fn invariant_violation_faults_the_resource(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, _sink) = standard(strategy);
    assert!(matches!(
        scheduler.set_state("Polisher", ResourceState::Idle, Some(4)),
        Err(CellError::InvariantViolation { .. })
    ));
    assert!(matches!(
        scheduler.set_state("Polisher", ResourceState::Processing, Some(4)),
        Err(CellError::ResourceFaulted(_))
    ));

    // Idle straight to carrying skips the pickup.
    assert!(matches!(
        scheduler.set_state("R3", ResourceState::Carrying, Some(6)),
        Err(CellError::InvariantViolation { .. })
    ));
    settle(&scheduler);
    assert!(matches!(
        scheduler.set_state("R3", ResourceState::Idle, None),
        Err(CellError::ResourceFaulted(_))
    ));

    // Unrelated resources keep working.
    set(&scheduler, "Cleaner", ResourceState::Processing, Some(7));
    assert_eq!(scheduler.resource_state("Cleaner").as_deref(), Ok("processing"));
    scheduler.shutdown();
}

#[rstest]
fn malformed_calls_are_rejected_without_side_effects(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, _sink) = standard(strategy);
    assert!(matches!(
        scheduler.set_state("Dryer", ResourceState::Idle, None),
        Err(CellError::UnknownResource(_))
    ));
    assert!(matches!(
        scheduler.set_state("Carrier", ResourceState::Idle, None),
        Err(CellError::Validation(_))
    ));
    assert!(matches!(
        scheduler.set_state("R1", ResourceState::Processing, Some(1)),
        Err(CellError::Validation(_))
    ));
    assert!(matches!(
        scheduler.submit(TransferRequest::new(0, "Carrier", "Polisher")),
        Err(CellError::Validation(_))
    ));
    // Validation errors do not fault anything.
    set(&scheduler, "Polisher", ResourceState::Processing, Some(1));
    assert_eq!(scheduler.queue_depth(), 0);
    scheduler.shutdown();
}

#[rstest]
fn submit_after_shutdown_is_refused(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let (scheduler, _sink) = standard(strategy);
    scheduler.shutdown();
    assert_eq!(
        scheduler.submit(TransferRequest::new(1, "Carrier", "Polisher")).err(),
        Some(CellError::SchedulerStopped)
    );
}

/// Drive the same script by hand and return what each strategy ends up with.
fn replay(strategy: Strategy) -> (Vec<(String, ItemId)>, Vec<ItemId>, CellSnapshot) {
    let (scheduler, sink) = standard(strategy);
    let (done, callback) = completions();
    use ResourceState::*;

    set(&scheduler, "Buffer", Done, Some(9));
    submit(&scheduler, TransferRequest::new(1, "Carrier", "Polisher").on_complete(callback()));
    submit(&scheduler, TransferRequest::new(9, "Buffer", "Carrier").on_complete(callback()));
    submit(&scheduler, TransferRequest::new(2, "Carrier", "Polisher").on_complete(callback()));

    set(&scheduler, "R1", Carrying, Some(1));
    set(&scheduler, "Polisher", Processing, Some(1));
    set(&scheduler, "R1", Idle, None);

    set(&scheduler, "R1", Carrying, Some(9));
    set(&scheduler, "Buffer", Idle, None);
    set(&scheduler, "R1", Idle, None);

    set(&scheduler, "Polisher", Done, Some(1));
    submit(&scheduler, TransferRequest::new(1, "Polisher", "Cleaner").on_complete(callback()));
    set(&scheduler, "R2", Carrying, Some(1));
    set(&scheduler, "Polisher", Idle, None);
    set(&scheduler, "Cleaner", Processing, Some(1));
    set(&scheduler, "R2", Idle, None);

    set(&scheduler, "R1", Carrying, Some(2));
    set(&scheduler, "Polisher", Processing, Some(2));
    set(&scheduler, "R1", Idle, None);

    let orders = sink
        .orders()
        .into_iter()
        .map(|order| (order.robot, order.item))
        .collect();
    let completed = done.lock().expect("done").clone();
    let snapshot = scheduler.snapshot();
    assert_eq!(scheduler.queue_depth(), 0);
    scheduler.shutdown();
    (orders, completed, snapshot)
}

#[test]
fn strategies_agree_on_a_scripted_run() {
    let (orders, completed, snapshot) = replay(Strategy::Lock);
    assert_eq!(
        orders,
        vec![
            ("R1".to_string(), 1),
            ("R1".to_string(), 9),
            ("R2".to_string(), 1),
            ("R1".to_string(), 2),
        ]
    );
    assert_eq!(completed, vec![1, 9, 1, 2]);
    assert_eq!(snapshot.resources["Polisher"].item, Some(2));
    assert_eq!(snapshot.resources["Cleaner"].state, ResourceState::Processing);

    for strategy in [Strategy::Mailbox, Strategy::Agents] {
        let (other_orders, other_completed, other_snapshot) = replay(strategy);
        assert_eq!(other_orders, orders, "{strategy} dispatched differently");
        assert_eq!(other_completed, completed, "{strategy} completed differently");
        assert_eq!(other_snapshot, snapshot, "{strategy} ended in another state");
    }
}

/// A scheduler wired to the simulated plant, with a journey coordinator on top.
struct Rig {
    coordinator: JourneyCoordinator,
    scheduler: Arc<dyn TransferScheduler>,
    simulator: Arc<ProcessSimulator>,
    audit: Arc<OccupancyAudit>,
}

impl Rig {
    fn new(strategy: Strategy) -> Self {
        let registry = standard_cell_registry().expect("cell");
        let audit = OccupancyAudit::attach(registry.topology(), registry.publisher()).expect("audit");
        let timing = SimTiming {
            move_ms: 1,
            process_ms: 2,
            buffer_ms: 1,
        };
        let simulator = ProcessSimulator::new(registry.topology(), timing);
        let scheduler = build_scheduler(
            strategy,
            registry,
            SchedulerOptions::default(),
            Arc::clone(&simulator) as Arc<dyn DispatchSink>,
        )
        .expect("scheduler");
        simulator.attach(&scheduler);
        let coordinator =
            JourneyCoordinator::new(Arc::clone(&scheduler), JourneyRoute::default()).expect("coordinator");
        Self {
            coordinator,
            scheduler,
            simulator,
            audit,
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.coordinator.shutdown();
        self.scheduler.shutdown();
        self.simulator.shutdown();
    }
}

#[rstest]
fn batches_travel_the_whole_cell(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let rig = Rig::new(strategy);
    for (batch, items) in [("C1", [1, 2, 3, 4]), ("C2", [5, 6, 7, 8])] {
        rig.coordinator.on_arrival(batch, &items).expect("arrival");
        assert!(
            rig.coordinator.wait_for_batch_complete(Duration::from_secs(10)),
            "{batch} did not finish under {strategy}"
        );
        assert!(rig.coordinator.is_current_batch_complete());
        let wafers = rig.coordinator.wafers();
        let returned: Vec<ItemId> = wafers.iter().map(|wafer| wafer.item).collect();
        assert_eq!(returned, items.to_vec(), "wafers lost or duplicated");
        for wafer in wafers {
            assert!(wafer.completed);
            assert_eq!(wafer.stage, JourneyStage::InCarrier);
            assert_eq!(wafer.batch, batch);
        }
        let departed = rig.coordinator.on_departure(batch).expect("departure");
        assert_eq!(departed.wafers, 4);
    }

    assert!(rig.simulator.wait_idle(SETTLE));
    assert!(rig.scheduler.wait_idle(SETTLE));
    assert_eq!(rig.simulator.moves_completed(), 8 * 4);
    assert_eq!(rig.scheduler.queue_depth(), 0);
    for (name, resource) in rig.scheduler.snapshot().resources {
        assert_eq!(resource.item, None, "{name} still holds a wafer");
    }
    let report = rig.audit.report();
    assert!(report.violations.is_empty(), "{:?}", report.violations);
    assert_eq!(rig.coordinator.departed_batches().len(), 2);
    assert_eq!(rig.coordinator.current_batch_id(), None);
}

#[rstest]
fn only_one_batch_may_occupy_the_cell(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let rig = Rig::new(strategy);
    rig.coordinator
        .on_arrival("C1", &[1, 2, 3, 4, 5])
        .expect("arrival");
    assert!(matches!(
        rig.coordinator.on_arrival("C2", &[6]),
        Err(CellError::BatchConflict { .. })
    ));
    assert_eq!(rig.coordinator.current_batch_id().as_deref(), Some("C1"));

    assert!(rig.coordinator.wait_for_batch_complete(Duration::from_secs(10)));
    rig.coordinator.on_departure("C1").expect("departure");
    assert_eq!(
        rig.coordinator.on_departure("C1").err(),
        Some(CellError::BatchNotActive("C1".to_string()))
    );
    rig.coordinator.on_arrival("C2", &[6]).expect("second batch");
    assert!(rig.coordinator.wait_for_batch_complete(Duration::from_secs(10)));
}

#[rstest]
fn early_departure_and_bad_arrivals_are_refused(
    #[values(Strategy::Lock, Strategy::Agents)] strategy: Strategy,
) {
    let rig = Rig::new(strategy);
    assert!(matches!(
        rig.coordinator.on_arrival("C1", &[]),
        Err(CellError::Validation(_))
    ));
    assert!(matches!(
        rig.coordinator.on_arrival("C1", &[1, 1]),
        Err(CellError::Validation(_))
    ));
    assert!(matches!(
        rig.coordinator.on_arrival(" ", &[1]),
        Err(CellError::Validation(_))
    ));
    assert_eq!(rig.coordinator.current_batch_id(), None);
    assert_eq!(
        rig.coordinator.on_departure("C9").err(),
        Some(CellError::BatchNotActive("C9".to_string()))
    );

    rig.coordinator.on_arrival("C1", &[1, 2]).expect("arrival");
    // Wafers cannot have looped the cell before the first move finishes.
    assert!(matches!(
        rig.coordinator.on_departure("C1"),
        Err(CellError::BatchIncomplete { batch, .. }) if batch == "C1"
    ));
    assert!(rig.coordinator.wait_for_batch_complete(Duration::from_secs(10)));
    rig.coordinator.on_departure("C1").expect("departure");
}

#[rstest]
fn refused_leg_marks_the_wafer_stuck(
    #[values(Strategy::Lock, Strategy::Mailbox, Strategy::Agents)] strategy: Strategy,
) {
    let mut registry = ResourceRegistry::new();
    registry.register_port("Carrier").expect("carrier");
    registry
        .register_station("Polisher", StationRole::Process)
        .expect("polisher");
    registry
        .register_station("Cleaner", StationRole::Process)
        .expect("cleaner");
    registry
        .register_station("Buffer", StationRole::Buffer)
        .expect("buffer");
    // Nothing serves Polisher -> Cleaner.
    registry
        .register_robot("R1", &[("Carrier", "Polisher")])
        .expect("r1");
    let reject = SchedulerOptions {
        unroutable: UnroutablePolicy::Reject,
        ..SchedulerOptions::default()
    };
    let (scheduler, sink) = manual_cell(strategy, registry, reject);
    let coordinator =
        JourneyCoordinator::new(Arc::clone(&scheduler), JourneyRoute::default()).expect("coordinator");
    use ResourceState::*;

    coordinator.on_arrival("C1", &[1]).expect("arrival");
    settle(&scheduler);
    assert_eq!(sink.orders().len(), 1);
    assert_eq!(coordinator.wafer(1).map(|wafer| wafer.stage), Some(JourneyStage::ToPolisher));

    set(&scheduler, "R1", Carrying, Some(1));
    set(&scheduler, "Polisher", Processing, Some(1));
    set(&scheduler, "R1", Idle, None);
    set(&scheduler, "Polisher", Done, Some(1));

    let started = Instant::now();
    assert!(!coordinator.wait_for_batch_complete(Duration::from_secs(10)));
    assert!(started.elapsed() < SETTLE, "wait ran to its timeout");
    let wafer = coordinator.wafer(1).expect("wafer");
    assert!(wafer.stuck);
    assert_eq!(wafer.stage, JourneyStage::Polishing);
    assert!(!coordinator.is_current_batch_complete());
    assert!(matches!(
        coordinator.on_departure("C1"),
        Err(CellError::BatchIncomplete { remaining: 1, .. })
    ));

    coordinator.shutdown();
    scheduler.shutdown();
}
