//! Strategy B: a single consumer thread owns all scheduling state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::CellError;
use crate::mailbox::Mailbox;
use crate::publisher::StatePublisher;
use crate::registry::{ResourceRegistry, Topology};
use crate::request::{QueuedRequest, TransferRequest};
use crate::types::{ItemId, RequestId, ResourceHandle, ResourceState};

use super::stall::StallReport;
use super::{
    DispatchCore, DispatchSink, Intake, SchedulerOptions, Strategy, TransferScheduler, run_effects,
};

enum Command {
    Submit(QueuedRequest),
    SetState {
        handle: ResourceHandle,
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

/// Scheduler whose state lives on one consumer thread fed by a mailbox.
pub struct MailboxScheduler {
    intake: Intake,
    publisher: Arc<StatePublisher>,
    mailbox: Arc<Mailbox<Command>>,
    depth: Arc<AtomicUsize>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MailboxScheduler {
    pub fn new(
        registry: ResourceRegistry,
        options: SchedulerOptions,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        let topology = Arc::clone(registry.topology());
        let publisher = Arc::clone(registry.publisher());
        let mailbox = Arc::new(Mailbox::new());
        let depth = Arc::new(AtomicUsize::new(0));

        let worker = {
            let mailbox = Arc::clone(&mailbox);
            let depth = Arc::clone(&depth);
            let core = DispatchCore::new(registry, options.stall_after);
            thread::Builder::new()
                .name("scheduler-mailbox".to_string())
                .spawn(move || consume(core, &mailbox, &depth, sink.as_ref()))
                .expect("failed to spawn scheduler thread")
        };
        info!(resources = topology.len(), "mailbox scheduler started");

        Self {
            intake: Intake::new(topology, options.unroutable),
            publisher,
            mailbox,
            depth,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn send(&self, command: Command) -> Result<(), CellError> {
        self.mailbox
            .push(command)
            .map_err(|_| CellError::SchedulerStopped)
    }
}

fn consume(
    mut core: DispatchCore,
    mailbox: &Mailbox<Command>,
    depth: &AtomicUsize,
    sink: &dyn DispatchSink,
) {
    while let Some(command) = mailbox.pop_blocking_or_closed() {
        match command {
            Command::Submit(request) => run_effects(core.submit(request), sink),
            Command::SetState {
                handle,
                state,
                item,
                reply,
            } => {
                let outcome = core
                    .set_state(handle, state, item)
                    .map(|effects| run_effects(effects, sink));
                // The caller may have given up waiting.
                let _ = reply.send(outcome);
            }
            Command::Cancel { request, reply } => {
                let _ = reply.send(core.cancel(request));
            }
            Command::Stalled { reply } => {
                let _ = reply.send(core.stalled());
            }
        }
        depth.store(core.queue_depth(), Ordering::SeqCst);
        mailbox.complete();
    }
    debug!("scheduler mailbox drained");
}

impl TransferScheduler for MailboxScheduler {
    fn strategy(&self) -> Strategy {
        Strategy::Mailbox
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
        self.send(Command::Submit(queued))?;
        Ok(id)
    }

    fn set_state(
        &self,
        resource: &str,
        state: ResourceState,
        item: Option<ItemId>,
    ) -> Result<(), CellError> {
        let handle = self.topology().handle(resource)?;
        let (reply, outcome) = mpsc::channel();
        self.send(Command::SetState {
            handle,
            state,
            item,
            reply,
        })?;
        outcome.recv().map_err(|_| CellError::SchedulerStopped)?
    }

    fn cancel(&self, request: RequestId) -> Result<bool, CellError> {
        let (reply, outcome) = mpsc::channel();
        self.send(Command::Cancel { request, reply })?;
        outcome.recv().map_err(|_| CellError::SchedulerStopped)
    }

    fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn stalled_requests(&self) -> Vec<StallReport> {
        let (reply, outcome) = mpsc::channel();
        if self.send(Command::Stalled { reply }).is_err() {
            return Vec::new();
        }
        outcome.recv().unwrap_or_default()
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        self.mailbox.tracker().wait_settled(timeout)
    }

    fn shutdown(&self) {
        self.intake.stop();
        self.mailbox.close();
        let worker = self
            .worker
            .lock()
            .expect("scheduler worker mutex poisoned")
            .take();
        if let Some(worker) = worker {
            // A callback running on the consumer thread cannot join itself.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("scheduler thread panicked");
            }
            info!("mailbox scheduler stopped");
        }
    }
}

impl Drop for MailboxScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
