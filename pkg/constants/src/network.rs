//! Node network constants.

/// Linux bridge the container runtime attaches pod veths to.
pub const DOCKER_BRIDGE: &str = "docker0";

/// Size of the uplink pool. Usable uplink ids are `1..UPLINK_POOL_SIZE`.
pub const UPLINK_POOL_SIZE: u16 = 10;

/// Name prefix of the physical uplink interfaces (`eth1`, `eth2`, ...).
pub const UPLINK_PREFIX: &str = "eth";

/// Name prefix of the ipvlan tap interfaces layered on the uplinks.
pub const IPVLAN_PREFIX: &str = "ipv";

/// Interface name of the pod's default link inside its namespace.
pub const POD_INTERFACE: &str = "eth0";

/// Seconds to wait before retrying a failed lock acquisition.
pub const LOCK_RETRY_SECS: u64 = 2;
