//! Per-wafer journey through the cell and batch arrival/departure.
//!
//! Every wafer of a batch travels Carrier → Polisher → Cleaner → Buffer →
//! Carrier. The coordinator submits one leg at a time and advances on two
//! inputs, both funnelled through its own mailbox worker: the scheduler's
//! completion callback for a delivered leg, and a station reporting `Done`
//! for the wafer dwelling on it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::CellError;
use crate::mailbox::Mailbox;
use crate::publisher::{StateChangeEvent, SubscriptionId};
use crate::request::TransferRequest;
use crate::scheduler::TransferScheduler;
use crate::types::{BatchId, ItemId, RequestId, ResourceState};

/// Where a wafer is on its way round the cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStage {
    InCarrier,
    ToPolisher,
    Polishing,
    ToCleaner,
    Cleaning,
    ToBuffer,
    InBuffer,
    ToCarrier,
}

/// Location names the journey visits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JourneyRoute {
    pub carrier: String,
    pub polisher: String,
    pub cleaner: String,
    pub buffer: String,
}

impl Default for JourneyRoute {
    fn default() -> Self {
        Self {
            carrier: "Carrier".to_string(),
            polisher: "Polisher".to_string(),
            cleaner: "Cleaner".to_string(),
            buffer: "Buffer".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Leg {
    CarrierToPolisher,
    PolisherToCleaner,
    CleanerToBuffer,
    BufferToCarrier,
}

impl Leg {
    fn stage(self) -> JourneyStage {
        match self {
            Leg::CarrierToPolisher => JourneyStage::ToPolisher,
            Leg::PolisherToCleaner => JourneyStage::ToCleaner,
            Leg::CleanerToBuffer => JourneyStage::ToBuffer,
            Leg::BufferToCarrier => JourneyStage::ToCarrier,
        }
    }

    /// Where the wafer waits before this leg starts.
    fn origin(self) -> JourneyStage {
        match self {
            Leg::CarrierToPolisher => JourneyStage::InCarrier,
            Leg::PolisherToCleaner => JourneyStage::Polishing,
            Leg::CleanerToBuffer => JourneyStage::Cleaning,
            Leg::BufferToCarrier => JourneyStage::InBuffer,
        }
    }

    /// Later legs run first so finished wafers drain out of the cell.
    fn priority(self) -> i32 {
        match self {
            Leg::CarrierToPolisher => 0,
            Leg::PolisherToCleaner => 1,
            Leg::CleanerToBuffer => 2,
            Leg::BufferToCarrier => 3,
        }
    }

    fn endpoints(self, route: &JourneyRoute) -> (&str, &str) {
        match self {
            Leg::CarrierToPolisher => (route.carrier.as_str(), route.polisher.as_str()),
            Leg::PolisherToCleaner => (route.polisher.as_str(), route.cleaner.as_str()),
            Leg::CleanerToBuffer => (route.cleaner.as_str(), route.buffer.as_str()),
            Leg::BufferToCarrier => (route.buffer.as_str(), route.carrier.as_str()),
        }
    }
}

/// Journey record of one wafer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WaferJourney {
    pub item: ItemId,
    pub batch: BatchId,
    pub stage: JourneyStage,
    /// Back in the carrier after the full loop.
    pub completed: bool,
    /// The next leg was refused; the wafer stays where it is.
    pub stuck: bool,
}

/// A batch that has left the cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DepartedBatch {
    pub batch: BatchId,
    pub wafers: usize,
    pub arrived_at: DateTime<Utc>,
    pub departed_at: DateTime<Utc>,
}

enum JourneyEvent {
    Delivered(ItemId),
    StationReady { station: String, item: ItemId },
}

struct ActiveBatch {
    id: BatchId,
    items: Vec<ItemId>,
    arrived_at: DateTime<Utc>,
}

#[derive(Default)]
struct JourneyState {
    current: Option<ActiveBatch>,
    wafers: HashMap<ItemId, WaferJourney>,
    // Station reported done before the delivery callback was processed.
    early_ready: HashSet<ItemId>,
    departed: Vec<DepartedBatch>,
}

impl JourneyState {
    fn remaining(&self) -> usize {
        self.wafers.values().filter(|wafer| !wafer.completed).count()
    }
}

struct Shared {
    state: Mutex<JourneyState>,
    batch_complete: Condvar,
}

/// Drives wafers of the active batch through the cell, one batch at a time.
pub struct JourneyCoordinator {
    scheduler: Arc<dyn TransferScheduler>,
    route: JourneyRoute,
    shared: Arc<Shared>,
    inbox: Arc<Mailbox<JourneyEvent>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    subscriptions: Vec<(String, SubscriptionId)>,
}

impl JourneyCoordinator {
    pub fn new(
        scheduler: Arc<dyn TransferScheduler>,
        route: JourneyRoute,
    ) -> Result<Self, CellError> {
        for name in [&route.carrier, &route.polisher, &route.cleaner, &route.buffer] {
            scheduler.topology().handle(name)?;
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(JourneyState::default()),
            batch_complete: Condvar::new(),
        });
        let inbox = Arc::new(Mailbox::new());

        let worker = {
            let scheduler = Arc::clone(&scheduler);
            let route = route.clone();
            let shared = Arc::clone(&shared);
            let inbox = Arc::clone(&inbox);
            thread::Builder::new()
                .name("journey-coordinator".to_string())
                .spawn(move || {
                    while let Some(event) = inbox.pop_blocking_or_closed() {
                        handle_event(event, scheduler.as_ref(), &route, &shared, &inbox);
                        inbox.complete();
                    }
                })
                .expect("failed to spawn journey coordinator")
        };

        let mut coordinator = Self {
            scheduler,
            route,
            shared,
            inbox,
            worker: Mutex::new(Some(worker)),
            subscriptions: Vec::new(),
        };
        let stations = [
            coordinator.route.polisher.clone(),
            coordinator.route.cleaner.clone(),
            coordinator.route.buffer.clone(),
        ];
        for station in stations {
            let inbox = Arc::clone(&coordinator.inbox);
            let subscription = coordinator.scheduler.subscribe(
                &station,
                Arc::new(move |event: &StateChangeEvent| {
                    if event.state != ResourceState::Done {
                        return;
                    }
                    if let Some(item) = event.item {
                        let _ = inbox.push(JourneyEvent::StationReady {
                            station: event.resource.clone(),
                            item,
                        });
                    }
                }),
            )?;
            coordinator.subscriptions.push((station, subscription));
        }
        Ok(coordinator)
    }

    /// Admit a batch and start every wafer on its first leg.
    pub fn on_arrival(&self, batch: &str, items: &[ItemId]) -> Result<(), CellError> {
        if batch.trim().is_empty() {
            return Err(CellError::Validation("batch id is empty".to_string()));
        }
        if items.is_empty() {
            return Err(CellError::Validation(format!("batch {batch} has no wafers")));
        }
        let mut seen = HashSet::new();
        for &item in items {
            if item == 0 {
                return Err(CellError::Validation("item ids must be positive".to_string()));
            }
            if !seen.insert(item) {
                return Err(CellError::Validation(format!(
                    "item {item} appears twice in batch {batch}"
                )));
            }
        }

        {
            let mut state = self.shared.state.lock().expect("journey mutex poisoned");
            if let Some(active) = &state.current {
                return Err(CellError::BatchConflict {
                    active: active.id.clone(),
                    requested: batch.to_string(),
                });
            }
            state.wafers = items
                .iter()
                .map(|&item| {
                    (
                        item,
                        WaferJourney {
                            item,
                            batch: batch.to_string(),
                            stage: JourneyStage::InCarrier,
                            completed: false,
                            stuck: false,
                        },
                    )
                })
                .collect();
            state.early_ready.clear();
            state.current = Some(ActiveBatch {
                id: batch.to_string(),
                items: items.to_vec(),
                arrived_at: Utc::now(),
            });
        }
        info!(batch, wafers = items.len(), "batch arrived");

        let mut submitted = Vec::with_capacity(items.len());
        for &item in items {
            let next = {
                let mut state = self.shared.state.lock().expect("journey mutex poisoned");
                advance(&mut state, item)
            };
            let Some((item, leg)) = next else {
                continue;
            };
            match submit_leg(self.scheduler.as_ref(), &self.route, &self.inbox, item, leg) {
                Ok(request) => submitted.push(request),
                Err(err) => {
                    for request in submitted {
                        let _ = self.scheduler.cancel(request);
                    }
                    let mut state = self.shared.state.lock().expect("journey mutex poisoned");
                    state.current = None;
                    state.wafers.clear();
                    warn!(batch, %err, "batch arrival rolled back");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// True once every wafer of the active batch is back in the carrier.
    pub fn is_current_batch_complete(&self) -> bool {
        let state = self.shared.state.lock().expect("journey mutex poisoned");
        state.current.is_some() && state.remaining() == 0
    }

    /// Release a completed batch from the cell.
    pub fn on_departure(&self, batch: &str) -> Result<DepartedBatch, CellError> {
        let mut state = self.shared.state.lock().expect("journey mutex poisoned");
        let is_active = state
            .current
            .as_ref()
            .is_some_and(|active| active.id == batch);
        if !is_active {
            return Err(CellError::BatchNotActive(batch.to_string()));
        }
        let remaining = state.remaining();
        if remaining > 0 {
            return Err(CellError::BatchIncomplete {
                batch: batch.to_string(),
                remaining,
            });
        }
        let Some(active) = state.current.take() else {
            return Err(CellError::BatchNotActive(batch.to_string()));
        };
        let departed = DepartedBatch {
            batch: active.id,
            wafers: active.items.len(),
            arrived_at: active.arrived_at,
            departed_at: Utc::now(),
        };
        state.departed.push(departed.clone());
        info!(batch, wafers = departed.wafers, "batch departed");
        Ok(departed)
    }

    pub fn current_batch_id(&self) -> Option<BatchId> {
        let state = self.shared.state.lock().expect("journey mutex poisoned");
        state.current.as_ref().map(|active| active.id.clone())
    }

    pub fn wafer(&self, item: ItemId) -> Option<WaferJourney> {
        let state = self.shared.state.lock().expect("journey mutex poisoned");
        state.wafers.get(&item).cloned()
    }

    /// Wafers of the active (or most recent) batch, by item id.
    pub fn wafers(&self) -> Vec<WaferJourney> {
        let state = self.shared.state.lock().expect("journey mutex poisoned");
        let mut wafers: Vec<_> = state.wafers.values().cloned().collect();
        wafers.sort_by_key(|wafer| wafer.item);
        wafers
    }

    pub fn departed_batches(&self) -> Vec<DepartedBatch> {
        let state = self.shared.state.lock().expect("journey mutex poisoned");
        state.departed.clone()
    }

    /// Block until the active batch completes or the timeout elapses.
    ///
    /// Returns false straight away once a wafer is stuck, since the batch
    /// can no longer finish on its own.
    pub fn wait_for_batch_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("journey mutex poisoned");
        loop {
            if state.current.is_some() && state.remaining() == 0 {
                return true;
            }
            if state.wafers.values().any(|wafer| wafer.stuck) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .batch_complete
                .wait_timeout(state, deadline - now)
                .expect("condvar wait failed");
            state = next;
        }
    }

    /// Stop listening for events and join the worker.
    pub fn shutdown(&self) {
        for (station, subscription) in &self.subscriptions {
            let _ = self.scheduler.unsubscribe(station, *subscription);
        }
        self.inbox.close();
        let worker = self
            .worker
            .lock()
            .expect("journey worker mutex poisoned")
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("journey coordinator thread panicked");
            }
        }
    }
}

impl Drop for JourneyCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn submit_leg(
    scheduler: &dyn TransferScheduler,
    route: &JourneyRoute,
    inbox: &Arc<Mailbox<JourneyEvent>>,
    item: ItemId,
    leg: Leg,
) -> Result<RequestId, CellError> {
    let (source, destination) = leg.endpoints(route);
    let inbox = Arc::clone(inbox);
    let request = TransferRequest::new(item, source, destination)
        .with_priority(leg.priority())
        .on_complete(move |item| {
            let _ = inbox.push(JourneyEvent::Delivered(item));
        });
    scheduler.submit(request)
}

fn handle_event(
    event: JourneyEvent,
    scheduler: &dyn TransferScheduler,
    route: &JourneyRoute,
    shared: &Shared,
    inbox: &Arc<Mailbox<JourneyEvent>>,
) {
    let next = {
        let mut state = shared.state.lock().expect("journey mutex poisoned");
        match event {
            JourneyEvent::Delivered(item) => delivered(&mut state, shared, item),
            JourneyEvent::StationReady { station, item } => ready(&mut state, route, &station, item),
        }
    };
    let Some((item, leg)) = next else {
        return;
    };
    if let Err(err) = submit_leg(scheduler, route, inbox, item, leg) {
        error!(item, ?leg, %err, "could not submit next leg");
        let mut state = shared.state.lock().expect("journey mutex poisoned");
        stall_wafer(&mut state, item, leg);
        shared.batch_complete.notify_all();
    }
}

/// Put a wafer whose leg was refused back where it waits, and mark it stuck.
fn stall_wafer(state: &mut JourneyState, item: ItemId, leg: Leg) {
    if let Some(wafer) = state.wafers.get_mut(&item) {
        if wafer.stage == leg.stage() {
            wafer.stage = leg.origin();
        }
        wafer.stuck = true;
    }
}

fn delivered(state: &mut JourneyState, shared: &Shared, item: ItemId) -> Option<(ItemId, Leg)> {
    let early = state.early_ready.remove(&item);
    let Some(wafer) = state.wafers.get_mut(&item) else {
        warn!(item, "delivery for a wafer outside the active batch");
        return None;
    };
    wafer.stage = match wafer.stage {
        JourneyStage::ToPolisher => JourneyStage::Polishing,
        JourneyStage::ToCleaner => JourneyStage::Cleaning,
        JourneyStage::ToBuffer => JourneyStage::InBuffer,
        JourneyStage::ToCarrier => {
            wafer.completed = true;
            JourneyStage::InCarrier
        }
        other => {
            warn!(item, stage = ?other, "unexpected delivery");
            return None;
        }
    };
    debug!(item, stage = ?wafer.stage, "wafer delivered");
    if wafer.completed {
        if state.remaining() == 0 {
            shared.batch_complete.notify_all();
        }
        return None;
    }
    if early {
        return advance(state, item);
    }
    None
}

fn ready(
    state: &mut JourneyState,
    route: &JourneyRoute,
    station: &str,
    item: ItemId,
) -> Option<(ItemId, Leg)> {
    let stage = state.wafers.get(&item)?.stage;
    let expected = match stage {
        JourneyStage::Polishing | JourneyStage::ToPolisher => &route.polisher,
        JourneyStage::Cleaning | JourneyStage::ToCleaner => &route.cleaner,
        JourneyStage::InBuffer | JourneyStage::ToBuffer => &route.buffer,
        _ => return None,
    };
    if station != expected.as_str() {
        return None;
    }
    if matches!(
        stage,
        JourneyStage::ToPolisher | JourneyStage::ToCleaner | JourneyStage::ToBuffer
    ) {
        state.early_ready.insert(item);
        return None;
    }
    advance(state, item)
}

fn advance(state: &mut JourneyState, item: ItemId) -> Option<(ItemId, Leg)> {
    let wafer = state.wafers.get_mut(&item)?;
    let leg = match wafer.stage {
        _ if wafer.completed => return None,
        JourneyStage::InCarrier => Leg::CarrierToPolisher,
        JourneyStage::Polishing => Leg::PolisherToCleaner,
        JourneyStage::Cleaning => Leg::CleanerToBuffer,
        JourneyStage::InBuffer => Leg::BufferToCarrier,
        _ => return None,
    };
    wafer.stage = leg.stage();
    debug!(item, stage = ?wafer.stage, "wafer ready for next leg");
    Some((item, leg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(item: ItemId, stage: JourneyStage) -> JourneyState {
        let mut state = JourneyState::default();
        state.wafers.insert(
            item,
            WaferJourney {
                item,
                batch: "C1".to_string(),
                stage,
                completed: false,
                stuck: false,
            },
        );
        state
    }

    fn shared() -> Shared {
        Shared {
            state: Mutex::new(JourneyState::default()),
            batch_complete: Condvar::new(),
        }
    }

    #[test]
    fn done_after_delivery_starts_next_leg() {
        let route = JourneyRoute::default();
        let mut state = state_with(1, JourneyStage::ToPolisher);
        assert_eq!(delivered(&mut state, &shared(), 1), None);
        assert_eq!(state.wafers[&1].stage, JourneyStage::Polishing);

        let next = ready(&mut state, &route, "Polisher", 1);
        assert_eq!(next, Some((1, Leg::PolisherToCleaner)));
        assert_eq!(state.wafers[&1].stage, JourneyStage::ToCleaner);
    }

    #[test]
    fn done_before_delivery_is_held_until_delivery() {
        let route = JourneyRoute::default();
        let mut state = state_with(2, JourneyStage::ToCleaner);
        assert_eq!(ready(&mut state, &route, "Cleaner", 2), None);
        assert!(state.early_ready.contains(&2));

        let next = delivered(&mut state, &shared(), 2);
        assert_eq!(next, Some((2, Leg::CleanerToBuffer)));
        assert!(state.early_ready.is_empty());
    }

    #[test]
    fn done_from_another_station_is_ignored() {
        let route = JourneyRoute::default();
        let mut state = state_with(3, JourneyStage::Polishing);
        assert_eq!(ready(&mut state, &route, "Cleaner", 3), None);
        assert_eq!(ready(&mut state, &route, "Polisher", 99), None);
        assert_eq!(state.wafers[&3].stage, JourneyStage::Polishing);
    }

    #[test]
    fn return_to_carrier_completes_the_wafer() {
        let mut state = state_with(4, JourneyStage::ToCarrier);
        assert_eq!(delivered(&mut state, &shared(), 4), None);
        let wafer = &state.wafers[&4];
        assert!(wafer.completed);
        assert_eq!(wafer.stage, JourneyStage::InCarrier);
        assert_eq!(state.remaining(), 0);
    }

    #[test]
    fn arriving_wafer_leaves_the_carrier_when_its_leg_starts() {
        let mut state = state_with(5, JourneyStage::InCarrier);
        assert_eq!(advance(&mut state, 5), Some((5, Leg::CarrierToPolisher)));
        assert_eq!(state.wafers[&5].stage, JourneyStage::ToPolisher);
    }

    #[test]
    fn returned_wafer_does_not_go_round_again() {
        let mut state = state_with(6, JourneyStage::ToCarrier);
        delivered(&mut state, &shared(), 6);
        assert_eq!(advance(&mut state, 6), None);
        assert_eq!(state.wafers[&6].stage, JourneyStage::InCarrier);
    }

    #[test]
    fn refused_leg_leaves_the_wafer_where_it_was() {
        let route = JourneyRoute::default();
        let mut state = state_with(7, JourneyStage::Polishing);
        let (item, leg) = ready(&mut state, &route, "Polisher", 7).expect("next leg");
        stall_wafer(&mut state, item, leg);
        let wafer = &state.wafers[&7];
        assert_eq!(wafer.stage, JourneyStage::Polishing);
        assert!(wafer.stuck);
        assert_eq!(state.remaining(), 1);
    }

    #[test]
    fn later_legs_outrank_earlier_ones() {
        let legs = [
            Leg::CarrierToPolisher,
            Leg::PolisherToCleaner,
            Leg::CleanerToBuffer,
            Leg::BufferToCarrier,
        ];
        assert!(legs.windows(2).all(|pair| pair[0].priority() < pair[1].priority()));
        let route = JourneyRoute::default();
        assert_eq!(Leg::BufferToCarrier.endpoints(&route), ("Buffer", "Carrier"));
    }
}
