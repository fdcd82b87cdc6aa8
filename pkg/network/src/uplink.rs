use anyhow::Result;
use pkg_constants::network::{IPVLAN_PREFIX, UPLINK_POOL_SIZE, UPLINK_PREFIX};
use pkg_constants::ovs::TABLE_INGRESS;
use pkg_ovs::{FlowTable, Switch};
use std::collections::BTreeSet;
use tracing::{error, info};

use crate::link::Link;

/// The fixed pool of uplink ids `1..size`. Id `i` is the physical interface
/// `eth<i>`, attached to the switch at port number `i`; in ipvlan mode its
/// tap is `ipv<i>`.
///
/// Nothing is cached: occupancy is always re-derived from the switch or the
/// host link list, so the pool is only as right as that state.
#[derive(Debug, Clone)]
pub struct UplinkPool {
    size: u16,
    uplink_prefix: String,
    tap_prefix: String,
}

impl Default for UplinkPool {
    fn default() -> Self {
        Self::new(UPLINK_POOL_SIZE, UPLINK_PREFIX)
    }
}

impl UplinkPool {
    pub fn new(size: u16, uplink_prefix: impl Into<String>) -> Self {
        Self {
            size,
            uplink_prefix: uplink_prefix.into(),
            tap_prefix: IPVLAN_PREFIX.to_string(),
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> {
        1..self.size
    }

    pub fn contains(&self, id: u16) -> bool {
        id >= 1 && id < self.size
    }

    pub fn uplink_name(&self, id: u16) -> String {
        format!("{}{}", self.uplink_prefix, id)
    }

    pub fn tap_name(&self, id: u16) -> String {
        format!("{}{}", self.tap_prefix, id)
    }

    /// Pool id of an ipvlan tap name (`ipv3` → 3).
    pub fn tap_id(&self, name: &str) -> Option<u16> {
        let id = name.strip_prefix(&self.tap_prefix)?.parse().ok()?;
        self.contains(id).then_some(id)
    }

    /// `min({1..N-1} \ occupied)`
    pub fn lowest_free(&self, occupied: &BTreeSet<u16>) -> Option<u16> {
        self.ids().find(|id| !occupied.contains(id))
    }

    /// Uplink ids bound to a pod: the ingress ports of table-3 rules.
    pub fn switch_occupancy(&self, flows: &FlowTable) -> BTreeSet<u16> {
        flows
            .table(TABLE_INGRESS)
            .filter_map(|e| e.in_port())
            .filter_map(|p| u16::try_from(p).ok())
            .filter(|id| self.contains(*id))
            .collect()
    }

    /// The uplink paired with a pod-side port: the ingress port of the
    /// table-3 rule that outputs to `veth_ofport`.
    pub fn lookup_uplink_bound_to(&self, flows: &FlowTable, veth_ofport: u32) -> Option<u16> {
        flows
            .table(TABLE_INGRESS)
            .filter(|e| e.outputs().any(|p| p == veth_ofport))
            .filter_map(|e| e.in_port())
            .filter_map(|p| u16::try_from(p).ok())
            .find(|id| self.contains(*id))
    }

    /// Pick the lowest uplink id no ingress rule uses, from a fresh dump.
    pub async fn allocate_free_uplink(&self, switch: &Switch) -> Result<u16> {
        let flows = switch.dump_flows().await?;
        let occupied = self.switch_occupancy(&flows);
        match self.lowest_free(&occupied) {
            Some(id) => {
                info!("Allocated uplink {} (occupied: {:?})", id, occupied);
                Ok(id)
            }
            None => {
                error!("uplink pool exhausted, all of 1..{} are bound", self.size);
                anyhow::bail!("no free uplink");
            }
        }
    }

    /// Ids whose tap is no longer in the host namespace, i.e. was moved into
    /// a pod.
    pub fn ipvlan_occupancy(&self, host_links: &[Link]) -> BTreeSet<u16> {
        let present: BTreeSet<u16> = host_links.iter().filter_map(|l| self.tap_id(&l.name)).collect();
        self.ids().filter(|id| !present.contains(id)).collect()
    }
}
