use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::forwarder::{ForwardedPort, Forwarder, ForwarderFactory};
use super::{StatusKind, StatusMessage, StatusSender};
use crate::error::Result;

/// Watches one selected pod, opening a forward for every container port once
/// the pod reaches `Running`.
///
/// The watcher only ever moves forward: no forwarder, then one forwarder,
/// then done. The forwarder is never replaced; a replica that faults or goes
/// away is handled by the owning deployment watcher selecting a new pod.
pub struct PodWatcher<F: ForwarderFactory> {
    updates: watch::Receiver<Pod>,
    factory: F,
    status_tx: Option<StatusSender>,
    forward: Option<JoinHandle<()>>,
}

impl<F: ForwarderFactory> PodWatcher<F> {
    /// Returns the update sender alongside the watcher; the owner pushes pod
    /// replacements through it and closes it by dropping it.
    pub fn new(pod: Pod, factory: F, status_tx: Option<StatusSender>) -> (watch::Sender<Pod>, Self) {
        let (tx, updates) = watch::channel(pod);
        (
            tx,
            Self {
                updates,
                factory,
                status_tx,
                forward: None,
            },
        )
    }

    /// Runs until cancelled. Does not return before a launched forwarder has
    /// fully wound down, so awaiting this task is awaiting the whole subtree.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let initial = self.updates.borrow_and_update().clone();
        self.handle_update(&initial, &cancel).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.updates.changed() => {
                    if changed.is_err() {
                        // sender closed; the owner cancels right after
                        cancel.cancelled().await;
                        break;
                    }
                    let pod = self.updates.borrow_and_update().clone();
                    self.handle_update(&pod, &cancel).await?;
                }
            }
        }

        if let Some(forward) = self.forward.take() {
            let _ = forward.await;
        }
        Ok(())
    }

    async fn handle_update(&mut self, pod: &Pod, cancel: &CancellationToken) -> Result<()> {
        if self.forward.is_some() {
            // forwarders are one-shot
            return Ok(());
        }
        let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
        if phase != Some("Running") {
            debug!(pod = %pod.name_any(), ?phase, "replica not running yet");
            return Ok(());
        }
        let ports = container_ports(pod);
        if ports.is_empty() {
            return Ok(());
        }

        let forwarder = self.factory.create(pod, &ports).await?;
        let status_tx = self.status_tx.clone();
        let stop = cancel.child_token();
        let pod = pod.clone();
        self.forward = Some(tokio::spawn(run_forwarder(forwarder, pod, status_tx, stop)));
        Ok(())
    }
}

/// The distinct container ports declared across the pod spec.
fn container_ports(pod: &Pod) -> Vec<u16> {
    let mut ports: Vec<u16> = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter_map(|container| container.ports.as_ref())
        .flatten()
        .filter_map(|port| u16::try_from(port.container_port).ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Drives one forwarder to completion: announce every port once the
/// handshake is done, serve until stopped or faulted, then announce the
/// disconnect for every port.
async fn run_forwarder(
    forwarder: Box<dyn Forwarder>,
    pod: Pod,
    status_tx: Option<StatusSender>,
    stop: CancellationToken,
) {
    let ports = forwarder.ports();
    let mut ready = forwarder.ready();

    let connected = {
        let status_tx = status_tx.clone();
        let pod = pod.clone();
        let ports = ports.clone();
        tokio::spawn(async move {
            if ready.wait_for(|ready| *ready).await.is_ok() {
                send_status(&status_tx, StatusKind::Connected, &pod, &ports).await;
            }
        })
    };

    if let Err(error) = forwarder.run(stop).await {
        warn!(%error, replica = %pod.name_any(), "port-forward terminated");
    }
    // the forwarder is gone now, so the ready sender is too; the helper can
    // no longer block on an unfired handshake
    let _ = connected.await;
    send_status(&status_tx, StatusKind::Disconnected, &pod, &ports).await;
}

async fn send_status(
    status_tx: &Option<StatusSender>,
    kind: StatusKind,
    pod: &Pod,
    ports: &[ForwardedPort],
) {
    let Some(status_tx) = status_tx else { return };
    for &port in ports {
        let _ = status_tx.send(StatusMessage::new(kind, pod, port)).await;
    }
}
