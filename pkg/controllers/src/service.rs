use k8s_openapi::api::core::v1::{Endpoints, Service};
use pkg_constants::controller::{EVENT_CHANNEL_CAPACITY, GROUP_ID_BASE, SERVICE_DEBOUNCE_MS, WATCH_RETRY_SECS};
use pkg_exec::StepReport;
use pkg_ovs::{Pipeline, Switch};
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::registry::{Admission, EndpointUpdate, ServiceRecord, ServiceRegistry};
use crate::resource;
use crate::watch::{self, Change};

/// Keeps the switch's service groups and table-1 rules equal to the
/// cluster's Services and Endpoints.
///
/// Events are applied one at a time. The registry lock covers only the
/// bookkeeping; switch programming runs after it is released.
pub struct ServiceController {
    switch: Switch,
    registry: Mutex<ServiceRegistry>,
    debounce: Duration,
    watch_retry: Duration,
}

impl ServiceController {
    pub fn new(switch: Switch) -> Self {
        Self {
            switch,
            registry: Mutex::new(ServiceRegistry::new(GROUP_ID_BASE)),
            debounce: Duration::from_millis(SERVICE_DEBOUNCE_MS),
            watch_retry: Duration::from_secs(WATCH_RETRY_SECS),
        }
    }

    pub fn with_group_base(mut self, base: u32) -> Self {
        self.registry = Mutex::new(ServiceRegistry::new(base));
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_watch_retry(mut self, retry: Duration) -> Self {
        self.watch_retry = retry;
        self
    }

    /// Snapshot of the registry.
    pub async fn records(&self) -> Vec<ServiceRecord> {
        self.registry.lock().await.records().to_vec()
    }

    /// Start the controller as a background task: one watcher per resource
    /// kind, [`Self::init`] on their first full lists, then the event loop.
    pub fn start(self, client: kube::Client, namespace: Option<String>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ServiceController started (bridge={}, debounce={}ms)",
                self.switch.bridge(),
                self.debounce.as_millis()
            );
            let (services_api, endpoints_api) = watch::apis(client, namespace.as_deref());
            let (svc_tx, mut svc_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let (ep_tx, mut ep_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            tokio::spawn(watch::forward("services", services_api, svc_tx, self.watch_retry));
            tokio::spawn(watch::forward("endpoints", endpoints_api, ep_tx, self.watch_retry));

            let Some(services) = first_snapshot(&mut svc_rx).await else {
                return;
            };
            let Some(endpoints) = first_snapshot(&mut ep_rx).await else {
                return;
            };
            let report = self.init(services, endpoints).await;
            info!(
                "ServiceController initialized: {} commands, {} failed",
                report.attempted, report.failed
            );

            self.run(svc_rx, ep_rx).await;
        })
    }

    /// Install the conntrack catch-all once, then every listed service with
    /// its endpoints.
    pub async fn init(&self, services: Vec<Service>, endpoints: Vec<Endpoints>) -> StepReport {
        let mut report = StepReport::default();
        info!(
            "Initializing {} services ({} endpoint objects)",
            services.len(),
            endpoints.len()
        );
        report.record(self.switch.add_flow(&Pipeline::conntrack_flow()).await);

        let admitted = {
            let mut registry = self.registry.lock().await;
            for ep in &endpoints {
                registry.apply_endpoints(ep);
            }
            services
                .iter()
                .filter_map(|svc| match registry.admit(svc) {
                    Admission::Admitted(record) => Some(record),
                    Admission::Duplicate => None,
                })
                .collect::<Vec<_>>()
        };
        for record in &admitted {
            report.merge(self.install(record).await);
        }
        report
    }

    /// Consume both change channels until both are closed.
    pub async fn run(
        &self,
        mut services: mpsc::Receiver<Change<Service>>,
        mut endpoints: mpsc::Receiver<Change<Endpoints>>,
    ) {
        let (mut svc_open, mut ep_open) = (true, true);
        while svc_open || ep_open {
            tokio::select! {
                change = services.recv(), if svc_open => match change {
                    Some(change) => {
                        tokio::time::sleep(self.debounce).await;
                        self.handle_service_change(change).await;
                    }
                    None => svc_open = false,
                },
                change = endpoints.recv(), if ep_open => match change {
                    Some(change) => {
                        self.handle_endpoints_change(change).await;
                    }
                    None => ep_open = false,
                },
            }
        }
        info!("ServiceController event channels closed");
    }

    pub async fn handle_service_change(&self, change: Change<Service>) -> StepReport {
        let report = match change {
            Change::Applied(svc) => self.service_applied(&svc).await,
            Change::Deleted(svc) => self.service_deleted(&svc).await,
            Change::Resynced(items) => self.services_resynced(items).await,
        };
        if !report.is_clean() {
            warn!(
                "services: {} of {} switch commands failed",
                report.failed, report.attempted
            );
        }
        report
    }

    pub async fn handle_endpoints_change(&self, change: Change<Endpoints>) -> StepReport {
        match change {
            Change::Applied(ep) => {
                self.endpoints_changed(&resource::object_key(&ep), resource::ready_addresses(&ep))
                    .await
            }
            Change::Deleted(ep) => self.endpoints_dropped(&resource::object_key(&ep)).await,
            Change::Resynced(items) => self.endpoints_resynced(items).await,
        }
    }

    async fn service_applied(&self, svc: &Service) -> StepReport {
        let known = self.registry.lock().await.live(&resource::uid(svc)).is_some();
        if known {
            self.service_modified(svc).await
        } else {
            self.service_added(svc).await
        }
    }

    async fn service_added(&self, svc: &Service) -> StepReport {
        let admission = self.registry.lock().await.admit(svc);
        match admission {
            Admission::Duplicate => {
                info!(
                    "Service {} ({}) already known, skipping",
                    resource::object_key(svc),
                    resource::uid(svc)
                );
                StepReport::default()
            }
            Admission::Admitted(record) => {
                info!(
                    "Service {} added: vip={:?} group={} endpoints={:?}",
                    record.key(),
                    record.cluster_ip,
                    record.group_id,
                    record.endpoints
                );
                self.install(&record).await
            }
        }
    }

    async fn service_deleted(&self, svc: &Service) -> StepReport {
        let retired = self.registry.lock().await.retire(svc);
        match retired {
            Some(record) => {
                info!("Service {} deleted, freeing group {}", record.key(), record.group_id);
                self.uninstall(&record).await
            }
            None => {
                warn!("Service {} deleted but was never installed", resource::object_key(svc));
                StepReport::default()
            }
        }
    }

    /// Full replace: the old rules go, the group id stays. A repeated
    /// delivery of an unchanged service touches nothing.
    async fn service_modified(&self, svc: &Service) -> StepReport {
        let replaced = self.registry.lock().await.replace(svc);
        match replaced {
            Some((old, new)) if old == new => StepReport::default(),
            Some((old, new)) => {
                info!("Service {} modified, reprogramming group {}", new.key(), new.group_id);
                let mut report = self.uninstall(&old).await;
                report.merge(self.install(&new).await);
                report
            }
            None => {
                info!("Service {} modified before it was added, adding", resource::object_key(svc));
                self.service_added(svc).await
            }
        }
    }

    /// A relist is the whole truth: live services missing from it were
    /// deleted while nobody was watching.
    async fn services_resynced(&self, items: Vec<Service>) -> StepReport {
        let listed: HashSet<String> = items.iter().map(resource::uid).collect();
        let vanished = {
            let mut registry = self.registry.lock().await;
            let stale: Vec<String> = registry
                .live_records()
                .filter(|r| !listed.contains(&r.uid))
                .map(|r| r.uid.clone())
                .collect();
            stale
                .iter()
                .filter_map(|uid| registry.retire_uid(uid))
                .collect::<Vec<_>>()
        };

        let mut report = StepReport::default();
        for record in &vanished {
            info!(
                "Service {} missing from relist, freeing group {}",
                record.key(),
                record.group_id
            );
            report.merge(self.uninstall(record).await);
        }
        for svc in &items {
            report.merge(self.service_applied(svc).await);
        }
        report
    }

    async fn endpoints_changed(&self, key: &str, addresses: BTreeSet<Ipv4Addr>) -> StepReport {
        let update = self.registry.lock().await.apply_endpoint_set(key, addresses);
        self.endpoints_updated(update).await
    }

    async fn endpoints_dropped(&self, key: &str) -> StepReport {
        let update = self.registry.lock().await.drop_endpoints(key);
        self.endpoints_updated(update).await
    }

    async fn endpoints_resynced(&self, items: Vec<Endpoints>) -> StepReport {
        let listed: HashSet<String> = items.iter().map(resource::object_key).collect();
        let mut report = StepReport::default();
        for ep in &items {
            report.merge(
                self.endpoints_changed(&resource::object_key(ep), resource::ready_addresses(ep))
                    .await,
            );
        }

        let orphaned = {
            let mut registry = self.registry.lock().await;
            registry.retain_parked(|key| listed.contains(key));
            registry
                .live_records()
                .map(ServiceRecord::key)
                .filter(|key| !listed.contains(key))
                .collect::<Vec<_>>()
        };
        for key in &orphaned {
            report.merge(self.endpoints_dropped(key).await);
        }
        report
    }

    async fn endpoints_updated(&self, update: EndpointUpdate) -> StepReport {
        match update {
            EndpointUpdate::Parked { key } => {
                info!("Endpoints {} have no service yet, holding them", key);
                StepReport::default()
            }
            EndpointUpdate::Discarded { key } => {
                info!("Endpoints {} deleted with no service, dropping them", key);
                StepReport::default()
            }
            EndpointUpdate::Applied { diff, .. } if diff.is_empty() => StepReport::default(),
            EndpointUpdate::Applied { record, diff } => {
                info!(
                    "Endpoints of {} changed: added {:?}, removed {:?}",
                    record.key(),
                    diff.added,
                    diff.removed
                );
                self.rebuild_group(&record).await
            }
        }
    }

    async fn install(&self, record: &ServiceRecord) -> StepReport {
        let mut report = StepReport::default();
        report.record(self.switch.add_group(&record.group()).await);
        for flow in record.flows() {
            report.record(self.switch.add_flow(&flow).await);
        }
        report
    }

    async fn uninstall(&self, record: &ServiceRecord) -> StepReport {
        let mut report = StepReport::default();
        for flow in record.flows() {
            report.record(self.switch.del_flows(&flow.selector()).await);
        }
        report.record(self.switch.del_group(record.group_id).await);
        report
    }

    /// Delete and recreate the group. Deleting a group also removes the
    /// rules pointing at it, so those are installed again.
    async fn rebuild_group(&self, record: &ServiceRecord) -> StepReport {
        let mut report = StepReport::default();
        report.record(self.switch.del_group(record.group_id).await);
        report.merge(self.install(record).await);
        report
    }
}

/// Wait for the first full list on `rx`. `None` once the watcher is gone.
async fn first_snapshot<K>(rx: &mut mpsc::Receiver<Change<K>>) -> Option<Vec<K>> {
    loop {
        if let Change::Resynced(items) = rx.recv().await? {
            return Some(items);
        }
    }
}
