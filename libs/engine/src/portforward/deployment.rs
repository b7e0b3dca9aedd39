use std::collections::{BTreeMap, HashMap};

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use radrun_k8s_util::selector::selector_string;

use super::forwarder::ForwarderFactory;
use super::pod::PodWatcher;
use super::stale::{StaleReplicaSets, StaleTracker};
use super::{SharedWriter, StatusSender, NO_ACTIVE_PODS_MESSAGE};
use crate::error::Result;

/// The pod watcher currently holding the deployment's forward, together with
/// the handles needed to replace it: push updates, cancel, await.
struct ActiveForward {
    pod_name: String,
    updates: watch::Sender<Pod>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Watches the pods behind one deployment and keeps the forward pointed at
/// the best replica.
///
/// The event loop is single-threaded: the pod cache and the active target
/// are only touched between awaits of the watch stream, so no locking is
/// needed. Replicas with a deletion timestamp or owned by an outdated
/// replica set never enter the cache.
pub struct DeploymentWatcher<F: ForwarderFactory> {
    client: Client,
    namespace: String,
    match_labels: BTreeMap<String, String>,
    stale: StaleTracker,
    factory: F,
    status_tx: Option<StatusSender>,
    writer: SharedWriter,
    cancel: CancellationToken,
    pods: HashMap<String, Pod>,
    active: Option<ActiveForward>,
}

impl<F: ForwarderFactory> DeploymentWatcher<F> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: Client,
        namespace: String,
        match_labels: BTreeMap<String, String>,
        stale: StaleTracker,
        factory: F,
        status_tx: Option<StatusSender>,
        writer: SharedWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            namespace,
            match_labels,
            stale,
            factory,
            status_tx,
            writer,
            cancel,
            pods: HashMap::new(),
            active: None,
        }
    }

    /// Runs the pod watch until the cancel handle fires or the watch ends.
    /// The active pod watcher is wound down and awaited before returning.
    pub async fn run(mut self) -> Result<()> {
        let selector = selector_string(&self.match_labels);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let stream = watcher(pods, watcher::Config::default().labels(&selector)).default_backoff();
        let mut stream = std::pin::pin!(stream);
        debug!(namespace = %self.namespace, %selector, "watching pods");

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                        let stale = self.stale.current().await;
                        match stale {
                            Ok(stale) => self.updated(pod, &stale).await,
                            Err(error) => {
                                let mut writer = self.writer.lock().await;
                                let _ = writer
                                    .write_all(
                                        format!("Error finding stale replica sets: {error}\n")
                                            .as_bytes(),
                                    )
                                    .await;
                            }
                        }
                    }
                    Ok(Some(watcher::Event::Delete(pod))) => self.deleted(&pod).await,
                    Ok(Some(watcher::Event::Init | watcher::Event::InitDone)) => {}
                    Ok(None) => break,
                    Err(error) => error!(%error, "pod watch failed, backing off"),
                },
            }
        }

        self.shutdown_active().await;
        Ok(())
    }

    /// Applies an added/modified pod event to the cache and the active
    /// target.
    async fn updated(&mut self, pod: Pod, stale: &StaleReplicaSets) {
        let name = pod.name_any();
        let deleting = pod.metadata.deletion_timestamp.is_some();

        if deleting {
            self.pods.remove(&name);
        } else if stale.is_stale_owner(&pod) {
            debug!(pod = %name, "ignoring replica of an outdated replica set");
        } else {
            self.pods.insert(name.clone(), pod.clone());
        }

        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.pod_name == name);
        if is_active && deleting {
            self.shutdown_active().await;
        } else if is_active {
            if let Some(active) = &self.active {
                active.updates.send_replace(pod);
            }
        }

        self.ensure_watcher().await;
    }

    /// Applies a deleted pod event.
    async fn deleted(&mut self, pod: &Pod) {
        let name = pod.name_any();
        self.pods.remove(&name);
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.pod_name == name)
        {
            self.shutdown_active().await;
        }
        self.ensure_watcher().await;
    }

    /// Starts a pod watcher for the best cached replica when none is active;
    /// reports when there is nothing to forward to.
    async fn ensure_watcher(&mut self) {
        if self.active.is_some() {
            return;
        }
        match self.select_best_pod().cloned() {
            Some(pod) => {
                let name = pod.name_any();
                debug!(pod = %name, "starting port-forward watcher");
                let cancel = self.cancel.child_token();
                let (updates, watcher) =
                    PodWatcher::new(pod, self.factory.clone(), self.status_tx.clone());
                let child = cancel.clone();
                let task = tokio::spawn(async move {
                    if let Err(error) = watcher.run(child).await {
                        error!(%error, "pod watcher terminated");
                    }
                });
                self.active = Some(ActiveForward {
                    pod_name: name,
                    updates,
                    cancel,
                    task,
                });
            }
            None => {
                let mut writer = self.writer.lock().await;
                let _ = writer.write_all(NO_ACTIVE_PODS_MESSAGE.as_bytes()).await;
            }
        }
    }

    /// Newest creation timestamp wins; ties break on the lexicographically
    /// smallest pod name.
    fn select_best_pod(&self) -> Option<&Pod> {
        self.pods.values().max_by(|a, b| {
            let a_created = a.creation_timestamp().map(|time| time.0);
            let b_created = b.creation_timestamp().map(|time| time.0);
            a_created
                .cmp(&b_created)
                .then_with(|| b.name_any().cmp(&a.name_any()))
        })
    }

    async fn shutdown_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            // dropping the sender closes the update channel
            drop(active.updates);
            let _ = active.task.await;
        }
    }

    #[cfg(test)]
    fn active_pod_name(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.pod_name.as_str())
    }
}
