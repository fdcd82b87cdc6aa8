//! Service reconciliation: the registry of services and their group ids,
//! the cluster watchers, and the controller that programs the switch from
//! their changes.

pub mod registry;
pub mod resource;
pub mod service;
pub mod watch;

pub use registry::{Admission, EndpointDiff, EndpointUpdate, ServiceRecord, ServiceRegistry};
pub use resource::{PortRule, Protocol};
pub use service::ServiceController;
pub use watch::{Change, Relist};
