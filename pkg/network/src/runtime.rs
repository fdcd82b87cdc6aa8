use anyhow::{Result, anyhow};
use pkg_exec::CommandRunner;
use std::net::Ipv4Addr;

/// `docker inspect` template yielding `pid,ip,prefix,gateway,mac`.
pub const INSPECT_FORMAT: &str = "{{.State.Pid}},{{.NetworkSettings.IPAddress}},{{.NetworkSettings.IPPrefixLen}},{{.NetworkSettings.Gateway}},{{.NetworkSettings.MacAddress}}";

/// Network identity of a running pod sandbox, as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDetails {
    /// Pid whose network namespace is the pod's.
    pub pid: u32,
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Ipv4Addr,
    pub mac: String,
}

impl PodDetails {
    /// `ip/prefix`, as `ip address add` takes it.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.prefix)
    }

    pub fn parse(inspect: &str) -> Result<Self> {
        let fields: Vec<&str> = inspect.trim().split(',').map(str::trim).collect();
        let [pid, ip, prefix, gateway, mac] = fields.as_slice() else {
            anyhow::bail!("unexpected inspect output: {:?}", inspect.trim());
        };
        let pid: u32 = pid.parse().map_err(|e| anyhow!("invalid pid {:?}: {}", pid, e))?;
        if pid == 0 {
            anyhow::bail!("container is not running (pid 0)");
        }
        Ok(Self {
            pid,
            ip: ip.parse().map_err(|e| anyhow!("invalid pod ip {:?}: {}", ip, e))?,
            prefix: prefix
                .parse()
                .map_err(|e| anyhow!("invalid prefix length {:?}: {}", prefix, e))?,
            gateway: gateway
                .parse()
                .map_err(|e| anyhow!("invalid gateway {:?}: {}", gateway, e))?,
            mac: mac.to_string(),
        })
    }
}

/// Ask the container runtime for the pod's namespace pid and addressing.
pub async fn inspect_pod(runner: &dyn CommandRunner, container_id: &str) -> Result<PodDetails> {
    let args = vec![
        "inspect".to_string(),
        "--format".to_string(),
        INSPECT_FORMAT.to_string(),
        container_id.to_string(),
    ];
    let out = runner.execute("docker", &args, false).await;
    if !out.success {
        anyhow::bail!("inspect of {} failed: {}", container_id, out.output.trim());
    }
    PodDetails::parse(&out.output)
        .map_err(|e| anyhow!("resolving pod details of {}: {}", container_id, e))
}
