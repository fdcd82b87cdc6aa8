use anyhow::{Result, anyhow};
use pkg_constants::network::POD_INTERFACE;
use pkg_exec::CommandRunner;
use tracing::info;

/// One interface as listed by `ip -o link show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Text after `@` in the name column: `if12` for a veth peer, the parent
    /// interface for ipvlan/macvlan links.
    pub link: Option<String>,
    pub mac: Option<String>,
}

impl Link {
    /// Interface index of the veth peer (`eth0@if12` → 12).
    pub fn peer_index(&self) -> Option<u32> {
        self.link.as_deref()?.strip_prefix("if")?.parse().ok()
    }

    /// Parse one `ip -o link` line such as
    /// `12: veth1a2b@if11: <BROADCAST,UP> mtu 1500 ... link/ether ce:ad:.. brd ..`.
    pub fn parse(line: &str) -> Option<Self> {
        let (index, rest) = line.trim_start().split_once(": ")?;
        let index = index.parse().ok()?;
        let (name_col, rest) = rest.split_once(':')?;
        let (name, link) = match name_col.split_once('@') {
            Some((n, l)) => (n.to_string(), Some(l.to_string())),
            None => (name_col.to_string(), None),
        };
        let mac = rest
            .split_whitespace()
            .skip_while(|t| *t != "link/ether")
            .nth(1)
            .map(str::to_string);
        Some(Self {
            index,
            name,
            link,
            mac,
        })
    }

    /// Parse `ip -o link show` output; continuation lines are skipped.
    pub fn parse_all(output: &str) -> Vec<Self> {
        output.lines().filter_map(Self::parse).collect()
    }
}

fn ip_link_args(dev: Option<&str>) -> Vec<String> {
    let mut args = vec!["-o".to_string(), "link".to_string(), "show".to_string()];
    if let Some(dev) = dev {
        args.push(dev.to_string());
    }
    args
}

/// `nsenter --target <pid> --net <cmd...>`
pub fn in_netns(pid: u32, cmd: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--target".to_string(),
        pid.to_string(),
        "--net".to_string(),
    ];
    args.extend(cmd.iter().map(|c| c.to_string()));
    args
}

/// Links of the host namespace.
pub async fn host_links(runner: &dyn CommandRunner) -> Result<Vec<Link>> {
    let out = runner.execute("ip", &ip_link_args(None), false).await;
    if !out.success {
        anyhow::bail!("listing host links failed: {}", out.output.trim());
    }
    Ok(Link::parse_all(&out.output))
}

/// Links inside the network namespace of process `pid`, optionally a single
/// device.
pub async fn netns_links(runner: &dyn CommandRunner, pid: u32, dev: Option<&str>) -> Result<Vec<Link>> {
    let mut cmd = vec!["ip".to_string()];
    cmd.extend(ip_link_args(dev));
    let cmd: Vec<&str> = cmd.iter().map(String::as_str).collect();
    let out = runner.execute("nsenter", &in_netns(pid, &cmd), false).await;
    if !out.success {
        anyhow::bail!("listing links in netns of pid {} failed: {}", pid, out.output.trim());
    }
    Ok(Link::parse_all(&out.output))
}

/// Find the host-side end of the pod's veth: read the peer index of the
/// pod's default interface inside its namespace, then match it against the
/// host's link indexes.
pub async fn resolve_host_veth(runner: &dyn CommandRunner, pid: u32) -> Result<String> {
    let pod_links = netns_links(runner, pid, Some(POD_INTERFACE)).await?;
    let peer = pod_links
        .first()
        .and_then(Link::peer_index)
        .ok_or_else(|| anyhow!("no veth peer index for {} in netns of pid {}", POD_INTERFACE, pid))?;

    let host = host_links(runner).await?;
    let veth = host
        .into_iter()
        .find(|l| l.index == peer)
        .ok_or_else(|| anyhow!("no host link with index {} (peer of pid {})", peer, pid))?;
    info!("container veth tap interface is {}", veth.name);
    Ok(veth.name)
}
