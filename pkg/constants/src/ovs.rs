//! Virtual switch pipeline constants.

/// Default name of the switch bridge.
pub const DEFAULT_BRIDGE: &str = "br0";

/// OpenFlow version passed to every `ovs-ofctl` call.
pub const OPENFLOW_VERSION: &str = "OpenFlow13";

/// Protocol list enabled on the bridge at creation time.
pub const BRIDGE_PROTOCOLS: &str = "OpenFlow10,OpenFlow13";

/// Number of stages in the fixed table chain (tables `0..PIPELINE_TABLES`).
pub const PIPELINE_TABLES: u8 = 4;

/// Table holding service matches and the conntrack catch-all.
pub const TABLE_SERVICE: u8 = 1;

/// Table holding pod → uplink egress rules.
pub const TABLE_EGRESS: u8 = 2;

/// Table holding uplink → pod ingress rules.
pub const TABLE_INGRESS: u8 = 3;

/// Priority of the fall-through `goto_table` rules.
pub const PRIORITY_FALLTHROUGH: u16 = 0;

/// Priority of the conntrack/NAT catch-all rule in `TABLE_SERVICE`.
pub const PRIORITY_CONNTRACK: u16 = 90;

/// Priority of per-pod forwarding rules and per-service match rules.
pub const PRIORITY_FORWARD: u16 = 100;

/// Priority of the ARP variants of the per-pod forwarding rules.
pub const PRIORITY_ARP: u16 = 150;

/// Bucket weight given to every endpoint of a select group.
pub const BUCKET_WEIGHT: u16 = 100;
