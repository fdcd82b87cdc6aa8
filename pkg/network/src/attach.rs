use anyhow::{Result, anyhow};
use pkg_constants::network::{DOCKER_BRIDGE, POD_INTERFACE, UPLINK_POOL_SIZE, UPLINK_PREFIX};
use pkg_constants::ovs::{DEFAULT_BRIDGE, PRIORITY_ARP, PRIORITY_FORWARD, TABLE_EGRESS, TABLE_INGRESS};
use pkg_constants::paths::DEFAULT_PLUGIN_LOCK;
use pkg_exec::{CommandRunner, StepReport, argv};
use pkg_ovs::{Action, Flow, Match, Pipeline, Switch};
use pkg_types::config::AttachMode;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::link::{host_links, in_netns, netns_links, resolve_host_veth};
use crate::lock::AdvisoryLock;
use crate::runtime::{PodDetails, inspect_pod};
use crate::uplink::UplinkPool;

/// Resolved plugin settings.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub bridge: String,
    pub docker_bridge: String,
    /// Pool size N; uplinks `1..N` are usable.
    pub uplink_count: u16,
    pub uplink_prefix: String,
    pub mode: AttachMode,
    pub lock_file: PathBuf,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            docker_bridge: DOCKER_BRIDGE.to_string(),
            uplink_count: UPLINK_POOL_SIZE,
            uplink_prefix: UPLINK_PREFIX.to_string(),
            mode: AttachMode::default(),
            lock_file: PathBuf::from(DEFAULT_PLUGIN_LOCK),
        }
    }
}

/// The pod a lifecycle hook was invoked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub container_id: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ns={}, podname={}, containerid={}",
            self.namespace, self.name, self.container_id
        )
    }
}

/// What setup wired together for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAttachment {
    pub container_id: String,
    pub pod: PodDetails,
    /// Host end of the pod's veth. Unknown when an ipvlan re-setup found the
    /// pod already attached.
    pub host_veth: Option<String>,
    /// Switch port of the veth (switch mode only).
    pub veth_ofport: Option<u32>,
    pub uplink: u16,
    pub uplink_mac: Option<String>,
}

/// The four per-pod forwarding rules pairing a veth port with an uplink:
/// egress in table 2 rewrites the source MAC to the uplink's, ingress in
/// table 3 rewrites the destination MAC to the pod's. ARP variants sit
/// above them and also patch the ARP hardware-address field.
pub fn pod_flows(veth_ofport: u32, pod_mac: &str, uplink: u16, uplink_mac: &str) -> Vec<Flow> {
    let uplink = uplink as u32;
    vec![
        Flow::new(TABLE_EGRESS, PRIORITY_FORWARD)
            .matching(Match::InPort(veth_ofport))
            .action(Action::ModDlSrc(uplink_mac.to_string()))
            .action(Action::Output(uplink)),
        Flow::new(TABLE_EGRESS, PRIORITY_ARP)
            .matching(Match::Arp)
            .matching(Match::InPort(veth_ofport))
            .action(Action::ModDlSrc(uplink_mac.to_string()))
            .action(Action::SetField {
                value: uplink_mac.to_string(),
                field: "arp_sha".to_string(),
            })
            .action(Action::Output(uplink)),
        Flow::new(TABLE_INGRESS, PRIORITY_FORWARD)
            .matching(Match::InPort(uplink))
            .action(Action::ModDlDst(pod_mac.to_string()))
            .action(Action::Output(veth_ofport)),
        Flow::new(TABLE_INGRESS, PRIORITY_ARP)
            .matching(Match::Arp)
            .matching(Match::InPort(uplink))
            .action(Action::ModDlDst(pod_mac.to_string()))
            .action(Action::SetField {
                value: pod_mac.to_string(),
                field: "arp_tha".to_string(),
            })
            .action(Action::Output(veth_ofport)),
    ]
}

/// Per-pod network attachment: the `init | status | setup | teardown`
/// transitions of the plugin.
///
/// Tool failures are tallied in the returned [`StepReport`] and the workflow
/// carries on; only values a later step cannot do without (pod pid, veth
/// name, switch port, a free uplink) end a transition early with `Err`. The
/// advisory lock is held from allocation through flow install and released
/// on every path.
pub struct Attacher {
    config: AttachConfig,
    runner: Arc<dyn CommandRunner>,
    switch: Switch,
    pool: UplinkPool,
    lock: AdvisoryLock,
}

impl Attacher {
    pub fn new(config: AttachConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let switch = Switch::new(runner.clone(), config.bridge.clone());
        let pool = UplinkPool::new(config.uplink_count, config.uplink_prefix.clone());
        let lock = AdvisoryLock::new(config.lock_file.clone());
        Self {
            config,
            runner,
            switch,
            pool,
            lock,
        }
    }

    pub fn with_lock(mut self, lock: AdvisoryLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    async fn run(&self, program: &str, args: &[&str]) -> pkg_exec::CommandOutput {
        self.runner.execute(program, &argv(args), true).await
    }

    async fn run_in_netns(&self, pid: u32, cmd: &[&str]) -> pkg_exec::CommandOutput {
        self.runner.execute("nsenter", &in_netns(pid, cmd), true).await
    }

    // ─── init / status ──────────────────────────────────────────────

    pub async fn init(&self) -> StepReport {
        info!("Init called ({} mode)", self.config.mode);
        match self.config.mode {
            AttachMode::Switch => {
                Pipeline::new(
                    self.switch.clone(),
                    self.config.uplink_count,
                    self.config.uplink_prefix.clone(),
                )
                .initialize()
                .await
            }
            AttachMode::Ipvlan => self.init_ipvlan().await,
        }
    }

    /// Observability hook only.
    pub fn status(&self, pod: &PodRef) -> StepReport {
        info!("Status called: {}", pod);
        StepReport::default()
    }

    // ─── setup / teardown ───────────────────────────────────────────

    pub async fn setup(&self, pod: &PodRef) -> Result<(PodAttachment, StepReport)> {
        info!("Setup called: {}", pod);
        match self.config.mode {
            AttachMode::Switch => self.setup_switch(pod).await,
            AttachMode::Ipvlan => self.setup_ipvlan(pod).await,
        }
    }

    pub async fn teardown(&self, pod: &PodRef) -> Result<StepReport> {
        info!("Teardown called: {}", pod);
        match self.config.mode {
            AttachMode::Switch => self.teardown_switch(pod).await,
            AttachMode::Ipvlan => self.teardown_ipvlan(pod).await,
        }
    }

    async fn setup_switch(&self, pod: &PodRef) -> Result<(PodAttachment, StepReport)> {
        let mut report = StepReport::default();
        let details = inspect_pod(self.runner.as_ref(), &pod.container_id).await?;
        let veth = resolve_host_veth(self.runner.as_ref(), details.pid).await?;

        let _guard = self.lock.acquire().await?;

        info!("Moving pod interface {} to {}", veth, self.switch.bridge());
        report.record(
            self.run("brctl", &["delif", &self.config.docker_bridge, &veth])
                .await,
        );
        report.record(self.switch.add_port(&veth).await);

        let ports = self.switch.show().await?;
        let veth_ofport = ports.ofport_of(&veth).ok_or_else(|| {
            error!("{} has no port on {}", veth, self.switch.bridge());
            anyhow!("{} is not attached to {}", veth, self.switch.bridge())
        })?;

        let flows = self.switch.dump_flows().await?;
        let uplink = match self.pool.lookup_uplink_bound_to(&flows, veth_ofport) {
            Some(id) => {
                info!("{} (port {}) is already bound to uplink {}", veth, veth_ofport, id);
                id
            }
            None => self.pool.allocate_free_uplink(&self.switch).await?,
        };

        let uplink_name = self.pool.uplink_name(uplink);
        let uplink_mac = ports
            .by_name(&uplink_name)
            .map(|p| p.mac.clone())
            .ok_or_else(|| {
                error!("uplink {} has no port on {}", uplink_name, self.switch.bridge());
                anyhow!("no MAC for uplink {}", uplink_name)
            })?;

        info!("Add flows for pod port {} via uplink {}", veth_ofport, uplink_name);
        for flow in pod_flows(veth_ofport, &details.mac, uplink, &uplink_mac) {
            report.record(self.switch.add_flow(&flow).await);
        }

        Ok((
            PodAttachment {
                container_id: pod.container_id.clone(),
                pod: details,
                host_veth: Some(veth),
                veth_ofport: Some(veth_ofport),
                uplink,
                uplink_mac: Some(uplink_mac),
            },
            report,
        ))
    }

    async fn teardown_switch(&self, pod: &PodRef) -> Result<StepReport> {
        let mut report = StepReport::default();
        let details = inspect_pod(self.runner.as_ref(), &pod.container_id).await?;
        let veth = resolve_host_veth(self.runner.as_ref(), details.pid).await?;

        let _guard = self.lock.acquire().await?;

        let ports = self.switch.show().await?;
        let veth_ofport = ports
            .ofport_of(&veth)
            .ok_or_else(|| anyhow!("{} is not attached to {}", veth, self.switch.bridge()))?;
        let flows = self.switch.dump_flows().await?;

        info!("Delete flows for pod port {}", veth_ofport);
        let egress = Flow::new(TABLE_EGRESS, PRIORITY_FORWARD).matching(Match::InPort(veth_ofport));
        report.record(self.switch.del_flows(&egress.selector()).await);
        match self.pool.lookup_uplink_bound_to(&flows, veth_ofport) {
            Some(uplink) => {
                let ingress =
                    Flow::new(TABLE_INGRESS, PRIORITY_FORWARD).matching(Match::InPort(uplink as u32));
                report.record(self.switch.del_flows(&ingress.selector()).await);
            }
            None => warn!("no uplink bound to port {}, ingress rules left alone", veth_ofport),
        }

        info!("Removing pod interface {} from {}", veth, self.switch.bridge());
        report.record(self.switch.del_port(&veth).await);
        Ok(report)
    }

    // ─── ipvlan mode ────────────────────────────────────────────────

    async fn init_ipvlan(&self) -> StepReport {
        let mut report = StepReport::default();
        info!("Creating ipvlan tap interfaces for uplinks 1..{}", self.pool.size());
        for id in self.pool.ids() {
            let tap = self.pool.tap_name(id);
            report.record(self.run("ip", &["link", "delete", &tap]).await);
            report.record(self.add_tap(id).await);
        }
        report
    }

    async fn add_tap(&self, id: u16) -> pkg_exec::CommandOutput {
        let tap = self.pool.tap_name(id);
        let parent = self.pool.uplink_name(id);
        self.run(
            "ip",
            &["link", "add", &tap, "link", &parent, "type", "ipvlan", "mode", "l2"],
        )
        .await
    }

    /// The pool tap currently inside the pod's namespace, if any.
    async fn tap_in_pod(&self, pid: u32) -> Result<Option<u16>> {
        let links = netns_links(self.runner.as_ref(), pid, None).await?;
        Ok(links.iter().find_map(|l| self.pool.tap_id(&l.name)))
    }

    async fn setup_ipvlan(&self, pod: &PodRef) -> Result<(PodAttachment, StepReport)> {
        let mut report = StepReport::default();
        let details = inspect_pod(self.runner.as_ref(), &pod.container_id).await?;

        if let Some(id) = self.tap_in_pod(details.pid).await? {
            info!("pod already holds uplink tap {}", self.pool.tap_name(id));
            return Ok((
                PodAttachment {
                    container_id: pod.container_id.clone(),
                    pod: details,
                    host_veth: None,
                    veth_ofport: None,
                    uplink: id,
                    uplink_mac: None,
                },
                report,
            ));
        }
        let veth = resolve_host_veth(self.runner.as_ref(), details.pid).await?;

        let _guard = self.lock.acquire().await?;

        let host = host_links(self.runner.as_ref()).await?;
        let uplink = self
            .pool
            .lowest_free(&self.pool.ipvlan_occupancy(&host))
            .ok_or_else(|| {
                error!("no free ipvlan tap in 1..{}", self.pool.size());
                anyhow!("no free uplink")
            })?;
        let tap = self.pool.tap_name(uplink);
        let pid = details.pid.to_string();
        let cidr = details.cidr();
        let gateway = details.gateway.to_string();

        report.record(
            self.run("brctl", &["delif", &self.config.docker_bridge, &veth])
                .await,
        );
        report.record(self.run("ip", &["link", "set", &tap, "netns", &pid]).await);
        report.record(
            self.run_in_netns(details.pid, &["ip", "link", "delete", POD_INTERFACE])
                .await,
        );
        report.record(
            self.run_in_netns(details.pid, &["ip", "address", "add", &cidr, "dev", &tap])
                .await,
        );
        report.record(
            self.run_in_netns(details.pid, &["ip", "link", "set", &tap, "up"])
                .await,
        );
        report.record(
            self.run_in_netns(
                details.pid,
                &["ip", "route", "add", "default", "via", &gateway, "dev", &tap],
            )
            .await,
        );

        Ok((
            PodAttachment {
                container_id: pod.container_id.clone(),
                pod: details,
                host_veth: Some(veth),
                veth_ofport: None,
                uplink,
                uplink_mac: None,
            },
            report,
        ))
    }

    async fn teardown_ipvlan(&self, pod: &PodRef) -> Result<StepReport> {
        let mut report = StepReport::default();
        let details = inspect_pod(self.runner.as_ref(), &pod.container_id).await?;
        let uplink = self
            .tap_in_pod(details.pid)
            .await?
            .ok_or_else(|| anyhow!("no uplink tap in netns of pid {}", details.pid))?;
        let tap = self.pool.tap_name(uplink);

        let _guard = self.lock.acquire().await?;

        report.record(
            self.run_in_netns(details.pid, &["ip", "link", "delete", &tap])
                .await,
        );
        report.record(self.add_tap(uplink).await);
        Ok(report)
    }
}
