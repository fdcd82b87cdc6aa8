use pkg_constants::ovs::{
    PIPELINE_TABLES, PRIORITY_CONNTRACK, PRIORITY_FALLTHROUGH, TABLE_EGRESS, TABLE_SERVICE,
};
use pkg_exec::StepReport;
use tracing::info;

use crate::flow::{Action, Flow, Match, Nat};
use crate::switch::Switch;

/// Fixed four-stage table chain:
///
/// | table | role |
/// |---|---|
/// | 0, 1 | service match, conntrack/NAT |
/// | 2 | pod → uplink egress |
/// | 3 | uplink → pod ingress |
pub struct Pipeline {
    switch: Switch,
    uplink_count: u16,
    uplink_prefix: String,
}

impl Pipeline {
    /// `uplink_count` is the pool size N; uplinks `1..N` are attached.
    pub fn new(switch: Switch, uplink_count: u16, uplink_prefix: impl Into<String>) -> Self {
        Self {
            switch,
            uplink_count,
            uplink_prefix: uplink_prefix.into(),
        }
    }

    /// Destroy and recreate the bridge, attach the uplinks at `ofport == id`,
    /// and install the fall-through chain.
    ///
    /// Only safe at node boot: it wipes every pod flow and service group.
    pub async fn initialize(&self) -> StepReport {
        let mut report = StepReport::default();
        info!(
            "Initializing pipeline on {} with {} uplinks",
            self.switch.bridge(),
            self.uplink_count.saturating_sub(1)
        );

        report.record(self.switch.del_bridge().await);
        report.record(self.switch.add_bridge().await);

        for id in 1..self.uplink_count {
            let iface = format!("{}{}", self.uplink_prefix, id);
            report.record(self.switch.add_port_with_ofport(&iface, id as u32).await);
            report.record(self.switch.port_up(&iface).await);
        }

        for flow in Self::fallthrough_flows() {
            report.record(self.switch.add_flow(&flow).await);
        }
        report
    }

    /// Install the table-1 catch-all that tracks every IP packet and carries
    /// its NAT state into the egress table.
    pub async fn install_conntrack(&self) -> StepReport {
        let mut report = StepReport::default();
        info!("Installing conntrack catch-all on {}", self.switch.bridge());
        report.record(self.switch.add_flow(&Self::conntrack_flow()).await);
        report
    }

    /// Lowest-priority `goto_table` rules chaining table i to i+1.
    pub fn fallthrough_flows() -> Vec<Flow> {
        (0..PIPELINE_TABLES - 1)
            .map(|t| Flow::new(t, PRIORITY_FALLTHROUGH).action(Action::GotoTable(t + 1)))
            .collect()
    }

    pub fn conntrack_flow() -> Flow {
        Flow::new(TABLE_SERVICE, PRIORITY_CONNTRACK)
            .matching(Match::Ip)
            .action(Action::Conntrack {
                commit: false,
                table: Some(TABLE_EGRESS),
                nat: Some(Nat::Existing),
            })
    }
}
