//! Transfer scheduling and resource-invariant engine for a pipelined wafer cell.
//!
//! Robots move wafers between a carrier port and process stations. The
//! [`registry`] holds the occupancy records and enforces the one-item rule,
//! the [`scheduler`] assigns queued transfer requests to eligible idle
//! robots under one of three concurrency strategies, and the [`journey`]
//! coordinator walks each wafer of a batch through the whole cell.

pub mod audit;
pub mod config;
pub mod error;
pub mod journey;
pub mod logging;
pub mod mailbox;
pub mod publisher;
pub mod registry;
pub mod request;
pub mod request_queue;
pub mod router;
pub mod scheduler;
pub mod sim;
pub mod types;

pub use config::{CellConfig, LogFormat, SimTiming, UnroutablePolicy};
pub use error::{CellError, ConfigError};
pub use journey::{JourneyCoordinator, JourneyRoute, JourneyStage, WaferJourney};
pub use publisher::{StateChangeEvent, StateListener, SubscriptionId};
pub use registry::ResourceRegistry;
pub use request::TransferRequest;
pub use scheduler::stall::StallReport;
pub use scheduler::{
    CellSnapshot, DispatchSink, SchedulerOptions, Strategy, TransferScheduler, build_scheduler,
};
pub use types::{ItemId, RequestId, ResourceKind, ResourceState, StationRole, TransferOrder};
