//! Hierarchical watchers that keep exactly one TCP port-forward per
//! deployment pointed at its newest eligible replica.
//!
//! An [`ApplicationWatcher`] owns one [`DeploymentWatcher`] per live
//! deployment matching the application selector; each deployment watcher
//! caches its non-outdated pods, picks at most one as the forward target and
//! owns at most one [`PodWatcher`] for it. Cancellation flows down the tree,
//! and parents await their children after cancelling so that two watchers
//! never contend for the same target.

mod application;
mod deployment;
mod forwarder;
mod pod;
mod stale;

pub use application::ApplicationWatcher;
pub use deployment::DeploymentWatcher;
pub use forwarder::{ForwardedPort, Forwarder, ForwarderFactory, KubeForwarderFactory};
pub use pod::PodWatcher;
pub use stale::{find_stale_replica_sets, StaleReplicaSets};

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};

use crate::labels::RESOURCE_LABEL;

/// Written whenever a deployment has no replica left to forward to. Part of
/// the observable contract.
pub(crate) const NO_ACTIVE_PODS_MESSAGE: &str = "No active pods available for port-forwarding.\n";

/// Writer shared by the watcher tree and the log streamer.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub fn shared_writer<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Channel the engine emits [`StatusMessage`]s on when one is configured.
pub type StatusSender = mpsc::Sender<StatusMessage>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Connected,
    Disconnected,
}

/// One connect/disconnect notification per forwarded port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub container_name: String,
    pub replica_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl StatusMessage {
    pub(crate) fn new(kind: StatusKind, pod: &Pod, port: ForwardedPort) -> Self {
        let replica_name = pod.name_any();
        let container_name = match pod.labels().get(RESOURCE_LABEL) {
            Some(name) => name.clone(),
            // replica names are prefixed with the container name
            None => replica_name
                .split('-')
                .next()
                .unwrap_or_default()
                .to_owned(),
        };
        Self {
            kind,
            container_name,
            replica_name,
            local_port: port.local,
            remote_port: port.remote,
        }
    }
}

/// How deployment watchers decide whether a pod belongs to an outdated
/// replica set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StalePolicy {
    /// Consult the snapshot computed when the application watcher started.
    #[default]
    Snapshot,
    /// Re-derive the outdated set from the live cluster on every pod event.
    Live,
}


#[cfg(test)]
mod tests {
    use super::fixtures::running_pod;
    use super::*;

    #[test]
    fn test_container_name_from_resource_label() {
        let pod = running_pod("demo-abc123", "demo-rs1", "2022-01-01T00:00:00Z");
        let message = StatusMessage::new(
            StatusKind::Connected,
            &pod,
            ForwardedPort { local: 3000, remote: 3000 },
        );
        assert_eq!(message.container_name, "test-container");
        assert_eq!(message.replica_name, "demo-abc123");
    }

    #[test]
    fn test_container_name_falls_back_to_pod_name_prefix() {
        let mut pod = running_pod("demo-abc123", "demo-rs1", "2022-01-01T00:00:00Z");
        pod.metadata.labels = None;
        let message = StatusMessage::new(
            StatusKind::Disconnected,
            &pod,
            ForwardedPort { local: 8080, remote: 3000 },
        );
        assert_eq!(message.container_name, "demo");
        assert_eq!(message.local_port, 8080);
        assert_eq!(message.remote_port, 3000);
    }

    #[test]
    fn test_container_name_without_separator_is_whole_name() {
        let mut pod = running_pod("single", "demo-rs1", "2022-01-01T00:00:00Z");
        pod.metadata.labels = None;
        let message = StatusMessage::new(
            StatusKind::Connected,
            &pod,
            ForwardedPort { local: 3000, remote: 3000 },
        );
        assert_eq!(message.container_name, "single");
    }
}
