//! Precomputed (source, destination) → robot lookup.

use std::collections::HashMap;

use crate::types::ResourceHandle;

/// A directed route between two locations.
pub type Route = (ResourceHandle, ResourceHandle);

/// Routing table built once at registration time.
///
/// Each lookup is a single hash access; nothing is derived per request.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    by_route: HashMap<Route, Vec<ResourceHandle>>,
    by_robot: HashMap<ResourceHandle, Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a robot's capability list. Robots keep registration order per route.
    pub(crate) fn add_robot(&mut self, robot: ResourceHandle, routes: &[Route]) {
        let capabilities = self.by_robot.entry(robot).or_default();
        for &route in routes {
            if capabilities.contains(&route) {
                continue;
            }
            capabilities.push(route);
            self.by_route.entry(route).or_default().push(robot);
        }
    }

    /// Robots able to serve the route, in registration order.
    pub fn eligible(&self, source: ResourceHandle, destination: ResourceHandle) -> &[ResourceHandle] {
        self.by_route
            .get(&(source, destination))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_eligible(
        &self,
        robot: ResourceHandle,
        source: ResourceHandle,
        destination: ResourceHandle,
    ) -> bool {
        self.eligible(source, destination).contains(&robot)
    }

    /// Robots to try for a request: the hint alone when it is eligible,
    /// otherwise every eligible robot in registration order.
    pub fn candidates(
        &self,
        source: ResourceHandle,
        destination: ResourceHandle,
        hint: Option<ResourceHandle>,
    ) -> impl Iterator<Item = ResourceHandle> + '_ {
        let eligible = self.eligible(source, destination);
        let pinned = hint.filter(|robot| eligible.contains(robot));
        pinned.into_iter().chain(
            eligible
                .iter()
                .copied()
                .filter(move |_| pinned.is_none()),
        )
    }

    /// The single robot owning a request: the eligible hint, else the first eligible.
    pub fn select(
        &self,
        source: ResourceHandle,
        destination: ResourceHandle,
        hint: Option<ResourceHandle>,
    ) -> Option<ResourceHandle> {
        self.candidates(source, destination, hint).next()
    }

    /// Capability list of a robot, in registration order.
    pub fn routes_of(&self, robot: ResourceHandle) -> &[Route] {
        self.by_robot.get(&robot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct locations touched by a robot's routes.
    pub fn locations_of(&self, robot: ResourceHandle) -> Vec<ResourceHandle> {
        let mut locations = Vec::new();
        for &(source, destination) in self.routes_of(robot) {
            for location in [source, destination] {
                if !locations.contains(&location) {
                    locations.push(location);
                }
            }
        }
        locations
    }
}
