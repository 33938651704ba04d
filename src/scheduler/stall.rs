//! Detection of queued requests that have waited too long.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::registry::Topology;
use crate::request::QueuedRequest;
use crate::types::{ItemId, RequestId};

/// A queued request that has exceeded the stall threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StallReport {
    pub request: RequestId,
    pub item: ItemId,
    pub source: String,
    pub destination: String,
    pub waited_ms: u64,
    /// No registered robot serves the route at all.
    pub unroutable: bool,
}

/// Reports queued requests older than `dwell`, warning once per request.
pub struct StallDetector {
    dwell: Option<Duration>,
    reported: Mutex<HashSet<RequestId>>,
}

impl StallDetector {
    /// `None` disables detection.
    pub fn new(dwell: Option<Duration>) -> Self {
        Self {
            dwell,
            reported: Mutex::new(HashSet::new()),
        }
    }

    fn overdue<'a>(
        requests: impl Iterator<Item = &'a QueuedRequest>,
        topology: &Topology,
        now: Instant,
        dwell: Duration,
    ) -> Vec<StallReport> {
        requests
            .filter_map(|request| {
                let waited = now.saturating_duration_since(request.enqueued_at);
                if waited <= dwell {
                    return None;
                }
                Some(StallReport {
                    request: request.id,
                    item: request.item,
                    source: topology.name(request.source).to_string(),
                    destination: topology.name(request.destination).to_string(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    unroutable: topology
                        .routes()
                        .eligible(request.source, request.destination)
                        .is_empty(),
                })
            })
            .collect()
    }

    /// Report every overdue request. Newly overdue ones are logged.
    pub fn scan<'a>(
        &self,
        requests: impl Iterator<Item = &'a QueuedRequest>,
        topology: &Topology,
        now: Instant,
    ) -> Vec<StallReport> {
        let Some(dwell) = self.dwell else {
            return Vec::new();
        };
        let overdue = Self::overdue(requests, topology, now, dwell);
        let mut reported = self.reported.lock().expect("stall detector mutex poisoned");
        // Forget requests that have left the queue.
        reported.retain(|id| overdue.iter().any(|report| report.request == *id));
        for report in &overdue {
            if reported.insert(report.request) {
                warn!(
                    request = report.request,
                    item = report.item,
                    source = %report.source,
                    destination = %report.destination,
                    waited_ms = report.waited_ms,
                    unroutable = report.unroutable,
                    "transfer request stalled"
                );
            }
        }
        overdue
    }
}
