//! Endpoint registry, liveness probing and the background health monitor.
//!
//! Candidate endpoints are tried in configured priority order. The
//! [`HealthMonitor`] owns the active `(endpoint, model)` route; readers take
//! snapshots through a [`RouteHandle`].

pub mod monitor;
pub mod probe;
pub mod registry;

pub use monitor::{HealthMonitor, RouteHandle, RouteTarget, StatusAnnouncer};
pub use probe::{EndpointProbe, HttpProber, ProbeError, ProbeStatus};
pub use registry::{
    ActiveRoute, Discovery, Endpoint, EndpointRegistry, ModelDescriptor, Reachability,
    RouteStatus, Selection, discover, select_model,
};
