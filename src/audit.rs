//! Independent observer that checks the published event stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::error;

use crate::error::CellError;
use crate::publisher::{StateChangeEvent, StatePublisher};
use crate::registry::Topology;
use crate::types::{ItemId, ResourceKind, ResourceState};

#[derive(Clone, Copy)]
struct LastSeen {
    seq: u64,
    state: ResourceState,
    item: Option<ItemId>,
}

#[derive(Default)]
struct AuditState {
    last: HashMap<String, LastSeen>,
    /// Which robot, and which station, each item was last seen on.
    robot_items: HashMap<ItemId, String>,
    station_items: HashMap<ItemId, String>,
    violations: Vec<String>,
}

/// Move `resource`'s entry in `holders` from `before` to `after`. Returns a
/// problem when `after` is already held by another resource of the same kind.
fn track(
    holders: &mut HashMap<ItemId, String>,
    resource: &str,
    before: Option<ItemId>,
    after: Option<ItemId>,
) -> Option<String> {
    if let Some(old) = before.filter(|&old| Some(old) != after) {
        if holders.get(&old).is_some_and(|holder| holder == resource) {
            holders.remove(&old);
        }
    }
    let item = after?;
    match holders.get(&item) {
        Some(other) if other != resource => {
            Some(format!("item {item} is on {resource} while {other} still holds it"))
        }
        _ => {
            holders.insert(item, resource.to_string());
            None
        }
    }
}

/// Counters exposed by the audit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub events: usize,
    pub max_active_robots: usize,
    pub violations: Vec<String>,
}

/// Subscribes to every resource and records anything that breaks the
/// one-item rule, robot transition order, or per-resource event order.
///
/// Across resources, an item may sit on at most one robot and at most one
/// station at a time. A robot and a station sharing an item is the normal
/// pickup and delivery overlap. Ports are not tracked.
pub struct OccupancyAudit {
    state: Mutex<AuditState>,
    events: AtomicUsize,
    active_robots: AtomicUsize,
    max_active_robots: AtomicUsize,
}

impl OccupancyAudit {
    fn new() -> Self {
        Self {
            state: Mutex::new(AuditState::default()),
            events: AtomicUsize::new(0),
            active_robots: AtomicUsize::new(0),
            max_active_robots: AtomicUsize::new(0),
        }
    }

    /// Subscribe a new audit to every registered resource.
    pub fn attach(topology: &Topology, publisher: &StatePublisher) -> Result<Arc<Self>, CellError> {
        let audit = Arc::new(Self::new());
        for handle in topology.handles() {
            let observer = Arc::clone(&audit);
            publisher.subscribe(
                handle,
                Arc::new(move |event: &StateChangeEvent| observer.record(event)),
            )?;
        }
        Ok(audit)
    }

    fn record(&self, event: &StateChangeEvent) {
        self.events.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock().expect("audit mutex poisoned");
        let state = &mut *guard;
        let previous = state.last.insert(
            event.resource.clone(),
            LastSeen {
                seq: event.seq,
                state: event.state,
                item: event.item,
            },
        );
        let mut problems = Vec::new();
        let before = previous.and_then(|previous| previous.item);
        let holders = match event.kind {
            ResourceKind::Robot => Some(&mut state.robot_items),
            ResourceKind::Station => Some(&mut state.station_items),
            ResourceKind::Port => None,
        };
        if let Some(holders) = holders {
            problems.extend(track(holders, &event.resource, before, event.item));
        }

        let Some(previous) = previous else {
            if event.kind == ResourceKind::Robot && event.state != ResourceState::Idle {
                self.robot_entered();
            }
            Self::flag(state, event, problems);
            return;
        };

        if event.seq <= previous.seq {
            problems.push(format!(
                "{} event {} arrived after {}",
                event.resource, event.seq, previous.seq
            ));
        }
        if let (Some(held), Some(next)) = (previous.item, event.item) {
            if held != next {
                problems.push(format!(
                    "{} switched from item {held} to {next} without emptying",
                    event.resource
                ));
            }
        }
        if event.kind == ResourceKind::Robot {
            if !ResourceState::robot_can_move(previous.state, event.state) {
                problems.push(format!(
                    "{} moved {} -> {}",
                    event.resource, previous.state, event.state
                ));
            }
            match (previous.state == ResourceState::Idle, event.state == ResourceState::Idle) {
                (true, false) => self.robot_entered(),
                (false, true) => {
                    self.active_robots.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
        Self::flag(state, event, problems);
    }

    fn flag(state: &mut AuditState, event: &StateChangeEvent, problems: Vec<String>) {
        for problem in problems {
            error!(resource = %event.resource, seq = event.seq, %problem, "occupancy audit violation");
            state.violations.push(problem);
        }
    }

    fn robot_entered(&self) {
        let current = self.active_robots.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_robots.fetch_max(current, Ordering::SeqCst);
    }

    pub fn has_violation(&self) -> bool {
        !self
            .state
            .lock()
            .expect("audit mutex poisoned")
            .violations
            .is_empty()
    }

    /// Peak number of robots simultaneously away from idle.
    pub fn max_active_robots(&self) -> usize {
        self.max_active_robots.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> AuditReport {
        let guard = self.state.lock().expect("audit mutex poisoned");
        AuditReport {
            events: self.events.load(Ordering::SeqCst),
            max_active_robots: self.max_active_robots(),
            violations: guard.violations.clone(),
        }
    }
}
