//! Service controller constants.

/// Default cluster API base URL.
pub const DEFAULT_API_SERVER: &str = "http://127.0.0.1:8080";

/// Group ids are minted as `registry size + GROUP_ID_BASE`.
pub const GROUP_ID_BASE: u32 = 100;

/// Delay after a service event before it is applied, so a near-simultaneous
/// endpoints event for the same service lands in the same pass.
pub const SERVICE_DEBOUNCE_MS: u64 = 300;

/// Delay before a failed list/watch is retried.
pub const WATCH_RETRY_SECS: u64 = 5;

/// Capacity of each watch event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
