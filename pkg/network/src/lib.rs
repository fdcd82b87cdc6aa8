//! Node-side networking of the attachment plugin: the cross-process lock,
//! link and runtime lookups, the uplink pool and the per-pod workflow.

pub mod attach;
pub mod link;
pub mod lock;
pub mod runtime;
pub mod uplink;

pub use attach::{AttachConfig, Attacher, PodAttachment, PodRef, pod_flows};
pub use lock::{AdvisoryLock, LockGuard};
pub use runtime::PodDetails;
pub use uplink::UplinkPool;
