//! What the controller reads out of the cluster's Service and Endpoints
//! objects.

use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::warn;

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// `None` (the API default) is TCP; unknown names are rejected.
    pub fn from_api(name: Option<&str>) -> Option<Self> {
        match name.unwrap_or("TCP") {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            "SCTP" => Some(Protocol::Sctp),
            _ => None,
        }
    }

    /// IP protocol number matched by the switch, `None` when unsupported.
    pub fn ip_proto(&self) -> Option<u8> {
        match self {
            Protocol::Tcp => Some(6),
            Protocol::Udp => Some(17),
            Protocol::Sctp => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// One exposed port of a service: traffic to `port` is rewritten to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    pub protocol: Protocol,
    pub port: u16,
    pub target: u16,
}

impl PortRule {
    /// Named target ports fall back to the service port.
    fn from_api(port: &ServicePort) -> Option<Self> {
        let protocol = Protocol::from_api(port.protocol.as_deref())?;
        let number = u16::try_from(port.port).ok()?;
        let target = match &port.target_port {
            Some(IntOrString::Int(p)) => u16::try_from(*p).ok()?,
            _ => number,
        };
        Some(Self {
            protocol,
            port: number,
            target,
        })
    }
}

/// `namespace/name`, shared by a Service and its Endpoints.
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

pub fn uid<K: ResourceExt>(obj: &K) -> String {
    obj.uid().unwrap_or_default()
}

/// The IPv4 cluster address, or `None` for headless, ExternalName,
/// unallocated and non-IPv4 services.
pub fn cluster_ipv4(svc: &Service) -> Option<Ipv4Addr> {
    let spec = svc.spec.as_ref()?;
    if spec.type_.as_deref() == Some("ExternalName") {
        return None;
    }
    spec.cluster_ip.as_deref()?.parse().ok()
}

pub fn port_rules(svc: &Service) -> Vec<PortRule> {
    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    ports
        .iter()
        .filter_map(|p| {
            let rule = PortRule::from_api(p);
            if rule.is_none() {
                warn!(
                    "{}: skipping port {} ({:?})",
                    object_key(svc),
                    p.port,
                    p.protocol
                );
            }
            rule
        })
        .collect()
}

/// Ready IPv4 addresses across all subsets. Not-ready and unparsable
/// addresses are left out.
pub fn ready_addresses(endpoints: &Endpoints) -> BTreeSet<Ipv4Addr> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|s| s.addresses.iter().flatten())
        .filter_map(|a| a.ip.parse().ok())
        .collect()
}
