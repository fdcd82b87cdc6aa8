use anyhow::Result;
use pkg_constants::ovs::{BRIDGE_PROTOCOLS, OPENFLOW_VERSION};
use pkg_exec::{CommandOutput, CommandRunner};
use std::sync::Arc;

use crate::flow::{Flow, FlowTable};
use crate::group::Group;
use crate::ports::PortTable;

/// Facade over `ovs-vsctl` / `ovs-ofctl` for one bridge.
///
/// Mutating calls return the tool output so callers can tally failures;
/// queries return typed snapshots and fail when the tool does, since nothing
/// downstream can be derived from a missing snapshot.
#[derive(Clone)]
pub struct Switch {
    runner: Arc<dyn CommandRunner>,
    bridge: String,
}

impl Switch {
    pub fn new(runner: Arc<dyn CommandRunner>, bridge: impl Into<String>) -> Self {
        Self {
            runner,
            bridge: bridge.into(),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    async fn vsctl(&self, args: &[&str]) -> CommandOutput {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.execute("ovs-vsctl", &args, true).await
    }

    /// `ovs-ofctl -O <ver> [opts] <cmd> <bridge> [rest]`
    async fn ofctl(&self, opts: &[&str], cmd: &str, rest: &[String], verbose: bool) -> CommandOutput {
        let mut args = vec!["-O".to_string(), OPENFLOW_VERSION.to_string()];
        args.extend(opts.iter().map(|o| o.to_string()));
        args.push(cmd.to_string());
        args.push(self.bridge.clone());
        args.extend(rest.iter().cloned());
        self.runner.execute("ovs-ofctl", &args, verbose).await
    }

    // ─── Bridge and ports ───────────────────────────────────────────

    pub async fn del_bridge(&self) -> CommandOutput {
        self.vsctl(&["--if-exists", "del-br", &self.bridge]).await
    }

    /// Create the bridge in secure fail-mode with OpenFlow 1.3 enabled.
    pub async fn add_bridge(&self) -> CommandOutput {
        let protocols = format!("protocols={}", BRIDGE_PROTOCOLS);
        self.vsctl(&[
            "add-br",
            &self.bridge,
            "--",
            "set",
            "Bridge",
            &self.bridge,
            "fail-mode=secure",
            &protocols,
        ])
        .await
    }

    pub async fn add_port(&self, iface: &str) -> CommandOutput {
        self.vsctl(&["--may-exist", "add-port", &self.bridge, iface]).await
    }

    /// Attach `iface` asking the switch for a fixed port number.
    pub async fn add_port_with_ofport(&self, iface: &str, ofport: u32) -> CommandOutput {
        let request = format!("ofport_request={}", ofport);
        self.vsctl(&[
            "--may-exist",
            "add-port",
            &self.bridge,
            iface,
            "--",
            "set",
            "Interface",
            iface,
            &request,
        ])
        .await
    }

    pub async fn del_port(&self, iface: &str) -> CommandOutput {
        self.vsctl(&["--if-exists", "del-port", &self.bridge, iface]).await
    }

    pub async fn port_up(&self, iface: &str) -> CommandOutput {
        self.ofctl(&[], "mod-port", &[iface.to_string(), "up".to_string()], true)
            .await
    }

    // ─── Flows and groups ───────────────────────────────────────────

    pub async fn add_flow(&self, flow: &Flow) -> CommandOutput {
        self.ofctl(&[], "add-flow", &[flow.render()], true).await
    }

    /// Delete every rule matching `selector` (non-strict).
    pub async fn del_flows(&self, selector: &str) -> CommandOutput {
        self.ofctl(&[], "del-flows", &[selector.to_string()], true)
            .await
    }

    pub async fn add_group(&self, group: &Group) -> CommandOutput {
        self.ofctl(&[], "add-group", &[group.render()], true).await
    }

    pub async fn del_group(&self, id: u32) -> CommandOutput {
        self.ofctl(&[], "del-groups", &[Group::selector(id)], true)
            .await
    }

    // ─── Snapshots ──────────────────────────────────────────────────

    pub async fn dump_flows(&self) -> Result<FlowTable> {
        let out = self.ofctl(&["--no-names"], "dump-flows", &[], false).await;
        if !out.success {
            anyhow::bail!("dump-flows on {} failed: {}", self.bridge, out.output.trim());
        }
        Ok(FlowTable::parse(&out.output))
    }

    pub async fn show(&self) -> Result<PortTable> {
        let out = self.ofctl(&[], "show", &[], false).await;
        if !out.success {
            anyhow::bail!("show on {} failed: {}", self.bridge, out.output.trim());
        }
        Ok(PortTable::parse(&out.output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Action, Match};
    use pkg_exec::fake::ScriptedRunner;

    #[tokio::test]
    async fn builds_tool_command_lines() {
        let runner = Arc::new(ScriptedRunner::succeed_all());
        let switch = Switch::new(runner.clone(), "br0");

        switch.add_port_with_ofport("eth3", 3).await;
        switch
            .add_flow(&Flow::new(0, 0).action(Action::GotoTable(1)))
            .await;
        switch.del_flows(&Flow::new(2, 100).matching(Match::InPort(9)).selector()).await;
        switch.del_group(104).await;

        assert_eq!(
            runner.lines(),
            vec![
                "ovs-vsctl --may-exist add-port br0 eth3 -- set Interface eth3 ofport_request=3",
                "ovs-ofctl -O OpenFlow13 add-flow br0 table=0,priority=0,actions=goto_table:1",
                "ovs-ofctl -O OpenFlow13 del-flows br0 table=2,in_port=9",
                "ovs-ofctl -O OpenFlow13 del-groups br0 group_id=104",
            ]
        );
    }

    #[tokio::test]
    async fn failed_dump_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new(|_| CommandOutput::failed("no bridge")));
        let switch = Switch::new(runner, "br0");
        assert!(switch.dump_flows().await.is_err());
        assert!(switch.show().await.is_err());
    }
}
