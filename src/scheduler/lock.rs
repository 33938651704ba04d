//! Strategy A: every scheduling decision inside one exclusive critical section.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::error::CellError;
use crate::publisher::StatePublisher;
use crate::registry::{ResourceRegistry, Topology};
use crate::request::TransferRequest;
use crate::types::{ItemId, RequestId, ResourceState};

use super::stall::StallReport;
use super::{
    DispatchCore, DispatchSink, Intake, SchedulerOptions, Strategy, TransferScheduler, run_effects,
};

/// Scheduler guarding the registry, queue, and active transfers with one mutex.
///
/// Work happens on the caller's thread. Orders and completion callbacks run
/// after the lock is released but before the call returns.
pub struct LockScheduler {
    intake: Intake,
    publisher: Arc<StatePublisher>,
    core: Mutex<DispatchCore>,
    sink: Arc<dyn DispatchSink>,
}

impl LockScheduler {
    pub fn new(
        registry: ResourceRegistry,
        options: SchedulerOptions,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        let topology = Arc::clone(registry.topology());
        let publisher = Arc::clone(registry.publisher());
        info!(resources = topology.len(), "lock scheduler started");
        Self {
            intake: Intake::new(topology, options.unroutable),
            publisher,
            core: Mutex::new(DispatchCore::new(registry, options.stall_after)),
            sink,
        }
    }
}

impl TransferScheduler for LockScheduler {
    fn strategy(&self) -> Strategy {
        Strategy::Lock
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
        let effects = {
            let mut core = self.core.lock().expect("scheduler mutex poisoned");
            core.submit(queued)
        };
        run_effects(effects, self.sink.as_ref());
        Ok(id)
    }

    fn set_state(
        &self,
        resource: &str,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError> {
        let handle = self.topology().handle(resource)?;
        let effects = {
            let mut core = self.core.lock().expect("scheduler mutex poisoned");
            core.set_state(handle, state, item)?
        };
        run_effects(effects, self.sink.as_ref());
        Ok(())
    }

    fn cancel(&self, request: RequestId) -> Result<bool, CellError> {
        let mut core = self.core.lock().expect("scheduler mutex poisoned");
        Ok(core.cancel(request))
    }

    fn queue_depth(&self) -> usize {
        self.core
            .lock()
            .expect("scheduler mutex poisoned")
            .queue_depth()
    }

    fn stalled_requests(&self) -> Vec<StallReport> {
        self.core.lock().expect("scheduler mutex poisoned").stalled()
    }

    // Nothing runs in the background; every call finishes its own work.
    fn wait_idle(&self, _timeout: Duration) -> bool {
        true
    }

    fn shutdown(&self) {
        self.intake.stop();
        info!("lock scheduler stopped");
    }
}
