//! Shared identifiers, resource kinds, and occupancy states used across the cell.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CellError;

/// Identifier of a wafer travelling through the cell. Always positive.
pub type ItemId = u64;
/// Identifier assigned to a transfer request once it is accepted.
pub type RequestId = u64;
/// Identifier of a carrier batch.
pub type BatchId = String;

/// Stable arena index of a registered resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHandle(pub(crate) usize);

impl ResourceHandle {
    /// Position of the resource in registration order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// What kind of entity a resource is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Mobile unit carrying at most one wafer.
    Robot,
    /// Fixed resource holding at most one wafer.
    Station,
    /// Carrier load port; unbounded, no occupancy.
    Port,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Robot => write!(f, "robot"),
            ResourceKind::Station => write!(f, "station"),
            ResourceKind::Port => write!(f, "port"),
        }
    }
}

/// How a station treats a delivered wafer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationRole {
    /// Delivery starts processing (`Processing`, later `Done`).
    Process,
    /// Delivery parks the wafer (`Occupied`, later `Done`).
    Buffer,
}

impl StationRole {
    /// State a station enters when a wafer is put down on it.
    pub fn delivery_state(self) -> ResourceState {
        match self {
            StationRole::Process => ResourceState::Processing,
            StationRole::Buffer => ResourceState::Occupied,
        }
    }
}

/// Occupancy state of a robot or station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Idle,
    /// Robot assigned to a transfer, travelling to the pickup.
    Busy,
    /// Robot holding the wafer.
    Carrying,
    Processing,
    /// Station finished with its wafer; ready for pickup.
    Done,
    Occupied,
}

impl ResourceState {
    /// Whether a resource in this state must hold a wafer.
    pub fn holds_item(self) -> bool {
        self != ResourceState::Idle
    }

    /// Whether this state is meaningful for the given kind.
    pub fn applies_to(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Robot => matches!(
                self,
                ResourceState::Idle | ResourceState::Busy | ResourceState::Carrying
            ),
            ResourceKind::Station => matches!(
                self,
                ResourceState::Idle
                    | ResourceState::Processing
                    | ResourceState::Done
                    | ResourceState::Occupied
            ),
            ResourceKind::Port => false,
        }
    }

    /// Legal robot moves: idle → busy → carrying → idle, or staying put.
    pub fn robot_can_move(from: ResourceState, to: ResourceState) -> bool {
        from == to
            || matches!(
                (from, to),
                (ResourceState::Idle, ResourceState::Busy)
                    | (ResourceState::Busy, ResourceState::Carrying)
                    | (ResourceState::Carrying, ResourceState::Idle)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Idle => "idle",
            ResourceState::Busy => "busy",
            ResourceState::Carrying => "carrying",
            ResourceState::Processing => "processing",
            ResourceState::Done => "done",
            ResourceState::Occupied => "occupied",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = CellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(ResourceState::Idle),
            "busy" => Ok(ResourceState::Busy),
            "carrying" => Ok(ResourceState::Carrying),
            "processing" => Ok(ResourceState::Processing),
            "done" => Ok(ResourceState::Done),
            "occupied" => Ok(ResourceState::Occupied),
            other => Err(CellError::Validation(format!("unknown resource state: {other}"))),
        }
    }
}

/// Command handed to a robot controller when a transfer is assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferOrder {
    pub request: RequestId,
    pub robot: String,
    pub item: ItemId,
    pub source: String,
    pub destination: String,
}
