use k8s_openapi::api::core::v1::{Endpoints, Service};
use pkg_constants::controller::GROUP_ID_BASE;
use pkg_constants::ovs::{PRIORITY_FORWARD, TABLE_SERVICE};
use pkg_ovs::{Action, Flow, Group, Match};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tracing::warn;

use crate::resource::{self, PortRule, Protocol};

/// Registry entry for a service, kept after deletion so its group id can be
/// handed to the next service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub cluster_ip: Option<Ipv4Addr>,
    pub ports: Vec<PortRule>,
    pub endpoints: BTreeSet<Ipv4Addr>,
    pub group_id: u32,
    pub deleted: bool,
    /// Order of deletion; the lowest is the oldest and recycled first.
    pub deleted_seq: u64,
}

impl ServiceRecord {
    fn from_service(svc: &Service, group_id: u32) -> Self {
        let mut record = Self {
            uid: resource::uid(svc),
            name: String::new(),
            namespace: String::new(),
            cluster_ip: None,
            ports: Vec::new(),
            endpoints: BTreeSet::new(),
            group_id,
            deleted: false,
            deleted_seq: 0,
        };
        record.update_spec(svc);
        record
    }

    fn update_spec(&mut self, svc: &Service) {
        self.name = svc.metadata.name.clone().unwrap_or_default();
        self.namespace = svc.metadata.namespace.clone().unwrap_or_default();
        self.cluster_ip = resource::cluster_ipv4(svc);
        self.ports = resource::port_rules(svc);
    }

    /// `namespace/name`, shared with the service's Endpoints object.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn group(&self) -> Group {
        Group::new(self.group_id, self.endpoints.iter().copied())
    }

    /// One table-1 rule per port, steering the virtual IP into the group.
    /// Headless services and protocols without an IP protocol match get no
    /// rule.
    pub fn flows(&self) -> Vec<Flow> {
        let Some(vip) = self.cluster_ip else {
            return Vec::new();
        };
        self.ports
            .iter()
            .filter_map(|p| {
                let Some(proto) = p.protocol.ip_proto() else {
                    warn!("{}: no flow for {} port {}", self.key(), p.protocol, p.port);
                    return None;
                };
                let dst = match p.protocol {
                    Protocol::Udp => Match::UdpDst(p.port),
                    _ => Match::TcpDst(p.port),
                };
                Some(
                    Flow::new(TABLE_SERVICE, PRIORITY_FORWARD)
                        .matching(Match::Ip)
                        .matching(Match::NwDst(vip))
                        .matching(Match::NwProto(proto))
                        .matching(dst)
                        .action(Action::ModTpDst(p.target))
                        .action(Action::Group(self.group_id)),
                )
            })
            .collect()
    }
}

/// Addresses gained and lost between two endpoint sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointDiff {
    pub added: BTreeSet<Ipv4Addr>,
    pub removed: BTreeSet<Ipv4Addr>,
}

impl EndpointDiff {
    pub fn between(old: &BTreeSet<Ipv4Addr>, new: &BTreeSet<Ipv4Addr>) -> Self {
        Self {
            added: new.difference(old).copied().collect(),
            removed: old.difference(new).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of [`ServiceRegistry::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A live record with this UID already exists.
    Duplicate,
    Admitted(ServiceRecord),
}

/// Outcome of applying an endpoint set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointUpdate {
    Applied {
        record: ServiceRecord,
        diff: EndpointDiff,
    },
    /// No live service owns these endpoints yet; the set is held until one
    /// is admitted.
    Parked { key: String },
    /// Endpoints removed before any service took them; nothing is held.
    Discarded { key: String },
}

/// In-memory service registry. Pure bookkeeping: every method is a
/// read-modify-write that returns what the caller needs to program the
/// switch afterwards.
///
/// Group ids are `base + registry size` at admission, except that the
/// oldest soft-deleted record's id is recycled first. Recycling replaces the
/// deleted record, so the ids in use are always exactly `base..base + len`.
#[derive(Debug)]
pub struct ServiceRegistry {
    base: u32,
    records: Vec<ServiceRecord>,
    deletions: u64,
    parked: HashMap<String, BTreeSet<Ipv4Addr>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(GROUP_ID_BASE)
    }
}

impl ServiceRegistry {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            records: Vec::new(),
            deletions: 0,
            parked: HashMap::new(),
        }
    }

    pub fn records(&self) -> &[ServiceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn live(&self, uid: &str) -> Option<&ServiceRecord> {
        self.records.iter().find(|r| !r.deleted && r.uid == uid)
    }

    fn live_mut(&mut self, uid: &str) -> Option<&mut ServiceRecord> {
        self.records.iter_mut().find(|r| !r.deleted && r.uid == uid)
    }

    pub fn parked(&self, key: &str) -> Option<&BTreeSet<Ipv4Addr>> {
        self.parked.get(key)
    }

    /// Register a new service and pick its group id.
    pub fn admit(&mut self, svc: &Service) -> Admission {
        if self.live(&resource::uid(svc)).is_some() {
            return Admission::Duplicate;
        }

        let index = if let Some(i) = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.deleted)
            .min_by_key(|(_, r)| r.deleted_seq)
            .map(|(i, _)| i)
        {
            let group_id = self.records[i].group_id;
            self.records[i] = ServiceRecord::from_service(svc, group_id);
            i
        } else {
            let group_id = self.base + self.records.len() as u32;
            self.records.push(ServiceRecord::from_service(svc, group_id));
            self.records.len() - 1
        };

        let record = &mut self.records[index];
        if let Some(endpoints) = self.parked.remove(&record.key()) {
            record.endpoints = endpoints;
        }
        Admission::Admitted(record.clone())
    }

    /// Soft-delete a live service; the returned record still holds what was
    /// programmed for it.
    pub fn retire(&mut self, svc: &Service) -> Option<ServiceRecord> {
        self.retire_uid(&resource::uid(svc))
    }

    pub fn retire_uid(&mut self, uid: &str) -> Option<ServiceRecord> {
        let seq = self.deletions + 1;
        let record = self.live_mut(uid)?;
        record.deleted = true;
        record.deleted_seq = seq;
        let retired = record.clone();
        self.deletions = seq;
        Some(retired)
    }

    /// Swap a live service's spec in place, keeping its group id and
    /// endpoints. Returns `(old, new)`.
    pub fn replace(&mut self, svc: &Service) -> Option<(ServiceRecord, ServiceRecord)> {
        let record = self.live_mut(&resource::uid(svc))?;
        let old = record.clone();
        record.update_spec(svc);
        Some((old, record.clone()))
    }

    pub fn apply_endpoints(&mut self, endpoints: &Endpoints) -> EndpointUpdate {
        self.apply_endpoint_set(&resource::object_key(endpoints), resource::ready_addresses(endpoints))
    }

    /// Store `addresses` as the endpoint set of the live service keyed
    /// `namespace/name`, or park them if there is none.
    pub fn apply_endpoint_set(&mut self, key: &str, addresses: BTreeSet<Ipv4Addr>) -> EndpointUpdate {
        match self.records.iter_mut().find(|r| !r.deleted && r.key() == key) {
            Some(record) => {
                let diff = EndpointDiff::between(&record.endpoints, &addresses);
                record.endpoints = addresses;
                EndpointUpdate::Applied {
                    record: record.clone(),
                    diff,
                }
            }
            None => {
                self.parked.insert(key.to_string(), addresses);
                EndpointUpdate::Parked {
                    key: key.to_string(),
                }
            }
        }
    }

    /// The Endpoints object keyed `namespace/name` is gone: a live service
    /// is left without backends, otherwise any held set is dropped.
    pub fn drop_endpoints(&mut self, key: &str) -> EndpointUpdate {
        if self.records.iter().any(|r| !r.deleted && r.key() == key) {
            return self.apply_endpoint_set(key, BTreeSet::new());
        }
        self.parked.remove(key);
        EndpointUpdate::Discarded {
            key: key.to_string(),
        }
    }

    /// Live records, in admission order.
    pub fn live_records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.records.iter().filter(|r| !r.deleted)
    }

    /// Keep only the held endpoint sets whose key passes `keep`.
    pub fn retain_parked(&mut self, keep: impl Fn(&str) -> bool) {
        self.parked.retain(|key, _| keep(key));
    }
}
