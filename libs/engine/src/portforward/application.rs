use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::deployment::DeploymentWatcher;
use super::forwarder::{ForwarderFactory, KubeForwarderFactory};
use super::stale::{self, StaleReplicaSets, StaleTracker};
use super::{SharedWriter, StalePolicy, StatusSender};
use crate::error::Result;
use crate::labels::{ApplicationSelector, REVISION_ANNOTATION};

/// One live deployment watcher and the identity it was created for. When the
/// pod selector or the revision moves, the entry is torn down, awaited, and
/// replaced; two watchers never contend for the same forward target.
struct DeploymentEntry {
    match_labels: BTreeMap<String, String>,
    revision: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeploymentEntry {
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Watches the deployments of one application (or the dashboard) and owns a
/// [`DeploymentWatcher`] per live deployment.
///
/// The set of outdated replica sets is computed once at start-up and handed
/// down; with [`StalePolicy::Live`] the deployment watchers re-derive it per
/// pod event instead.
pub struct ApplicationWatcher<F: ForwarderFactory = KubeForwarderFactory> {
    client: Client,
    namespace: String,
    selector: ApplicationSelector,
    factory: F,
    status_tx: Option<StatusSender>,
    writer: SharedWriter,
    stale_policy: StalePolicy,
}

impl ApplicationWatcher {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        selector: ApplicationSelector,
        status_tx: Option<StatusSender>,
        writer: SharedWriter,
    ) -> Self {
        let namespace = namespace.into();
        let factory = KubeForwarderFactory::new(client.clone(), namespace.clone());
        Self::with_factory(client, namespace, selector, factory, status_tx, writer)
    }
}

impl<F: ForwarderFactory> ApplicationWatcher<F> {
    /// Like [`ApplicationWatcher::new`] with a custom forwarder backend.
    pub fn with_factory(
        client: Client,
        namespace: impl Into<String>,
        selector: ApplicationSelector,
        factory: F,
        status_tx: Option<StatusSender>,
        writer: SharedWriter,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            selector,
            factory,
            status_tx,
            writer,
            stale_policy: StalePolicy::default(),
        }
    }

    pub fn stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    /// Runs until the token fires or the deployment watch ends. Child
    /// watchers run under child tokens of `cancel` and wind down with it.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let snapshot = Arc::new(
            stale::find_stale_replica_sets(&self.client, &self.namespace, &self.selector).await?,
        );

        let selector = self.selector.to_label_selector();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let stream =
            watcher(deployments, watcher::Config::default().labels(&selector)).default_backoff();
        let mut stream = std::pin::pin!(stream);
        info!(namespace = %self.namespace, %selector, "watching deployments");

        let mut entries: HashMap<String, DeploymentEntry> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(deployment) | watcher::Event::InitApply(deployment))) => {
                        self.upsert(&mut entries, deployment, &snapshot, &cancel).await;
                    }
                    Ok(Some(watcher::Event::Delete(deployment))) => {
                        Self::remove(&mut entries, &deployment.name_any()).await;
                    }
                    Ok(Some(watcher::Event::Init | watcher::Event::InitDone)) => {}
                    Ok(None) => break,
                    Err(error) => error!(%error, "deployment watch failed, backing off"),
                },
            }
        }
        Ok(())
    }

    /// Handles an added/modified deployment: start a watcher for a new
    /// entry, keep an unchanged one, or replace one whose selector or
    /// revision moved. Replacement awaits the old watcher first.
    async fn upsert(
        &self,
        entries: &mut HashMap<String, DeploymentEntry>,
        deployment: Deployment,
        snapshot: &Arc<StaleReplicaSets>,
        cancel: &CancellationToken,
    ) {
        let name = deployment.name_any();
        let Some(match_labels) = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.clone())
        else {
            // a deployment without a pod selector has no pods to forward to
            return;
        };
        let revision = deployment
            .annotations()
            .get(REVISION_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        match entries.get(&name) {
            Some(entry) if entry.match_labels == match_labels && entry.revision == revision => {
                // semantically a no-op; keep the running watcher
                return;
            }
            Some(_) => {
                debug!(deployment = %name, "selector or revision changed, replacing watcher");
                Self::remove(entries, &name).await;
            }
            None => {}
        }

        let child = cancel.child_token();
        let tracker = StaleTracker::new(
            self.stale_policy,
            snapshot.clone(),
            self.client.clone(),
            self.namespace.clone(),
            self.selector.clone(),
        );
        let watcher = DeploymentWatcher::new(
            self.client.clone(),
            self.namespace.clone(),
            match_labels.clone(),
            tracker,
            self.factory.clone(),
            self.status_tx.clone(),
            self.writer.clone(),
            child.clone(),
        );
        let task = tokio::spawn(async move {
            if let Err(error) = watcher.run().await {
                error!(%error, "deployment watcher terminated");
            }
        });
        entries.insert(
            name,
            DeploymentEntry {
                match_labels,
                revision,
                cancel: child,
                task,
            },
        );
    }

    async fn remove(entries: &mut HashMap<String, DeploymentEntry>, name: &str) {
        if let Some(entry) = entries.remove(name) {
            entry.shutdown().await;
        }
    }
}
