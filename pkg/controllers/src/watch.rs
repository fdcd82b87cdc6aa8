use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, Resource};
use std::fmt::Debug;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A watcher event with the initial (or any later) relist folded into one
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K> {
    Applied(K),
    Deleted(K),
    /// A full list completed; objects missing from it no longer exist.
    Resynced(Vec<K>),
}

/// Collects `Init`/`InitApply`/`InitDone` into [`Change::Resynced`].
#[derive(Debug)]
pub struct Relist<K> {
    buffer: Option<Vec<K>>,
}

impl<K> Default for Relist<K> {
    fn default() -> Self {
        Self { buffer: None }
    }
}

impl<K> Relist<K> {
    pub fn absorb(&mut self, event: Event<K>) -> Option<Change<K>> {
        match event {
            Event::Apply(obj) => Some(Change::Applied(obj)),
            Event::Delete(obj) => Some(Change::Deleted(obj)),
            Event::Init => {
                self.buffer = Some(Vec::new());
                None
            }
            Event::InitApply(obj) => {
                self.buffer.get_or_insert_with(Vec::new).push(obj);
                None
            }
            Event::InitDone => Some(Change::Resynced(self.buffer.take().unwrap_or_default())),
        }
    }
}

/// Client for the API server at `url` (no kubeconfig lookup).
pub fn connect(url: &str) -> anyhow::Result<Client> {
    let config = kube::Config::new(url.parse()?);
    Ok(Client::try_from(config)?)
}

/// Service and Endpoints handles, cluster-wide when `namespace` is `None`.
pub fn apis(client: Client, namespace: Option<&str>) -> (Api<Service>, Api<Endpoints>) {
    match namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    }
}

/// Run a watcher on `api` and send its changes into `tx` until the receiver
/// goes away. After a failed list or watch the next attempt waits `retry`;
/// an expired watch makes the watcher relist, which arrives here as
/// [`Change::Resynced`].
pub async fn forward<K>(kind: &'static str, api: Api<K>, tx: mpsc::Sender<Change<K>>, retry: Duration)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut stream = pin!(watcher::watcher(api, watcher::Config::default()));
    let mut relist = Relist::default();
    info!("Watching {}", kind);

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                let Some(change) = relist.absorb(event) else {
                    continue;
                };
                if let Change::Resynced(items) = &change {
                    debug!("{} relisted: {} objects", kind, items.len());
                }
                if tx.send(change).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("{} watch failed: {}, retrying in {}s", kind, e, retry.as_secs());
                tokio::time::sleep(retry).await;
            }
        }
        if tx.is_closed() {
            return;
        }
    }
}
