use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A single forwarded port pair. `local` is the port actually bound on
/// 127.0.0.1, `remote` the container port it tunnels to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ForwardedPort {
    pub local: u16,
    pub remote: u16,
}

/// Capability set of a port-forward backend: report its port pairs, signal
/// readiness once the transport handshake completes, and serve until stopped.
///
/// Forwarders are one-shot; a faulted forwarder is never re-run.
#[async_trait]
pub trait Forwarder: Send + 'static {
    /// The `(local, remote)` pairs this forwarder serves.
    fn ports(&self) -> Vec<ForwardedPort>;

    /// Receiver flipped to `true` once the transport handshake has completed.
    /// The sender is dropped when the forwarder exits, so waiting on it never
    /// hangs past the forwarder's lifetime.
    fn ready(&self) -> watch::Receiver<bool>;

    /// Serve until `stop` fires or a transport-level fault occurs.
    async fn run(self: Box<Self>, stop: CancellationToken) -> Result<()>;
}

/// Builds forwarders for a selected pod. Swapped for a double in tests.
#[async_trait]
pub trait ForwarderFactory: Clone + Send + Sync + 'static {
    async fn create(&self, pod: &Pod, ports: &[u16]) -> Result<Box<dyn Forwarder>>;
}

/// Factory for [`KubeForwarder`]s speaking to the real apiserver.
#[derive(Clone)]
pub struct KubeForwarderFactory {
    client: Client,
    namespace: String,
}

impl KubeForwarderFactory {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ForwarderFactory for KubeForwarderFactory {
    async fn create(&self, pod: &Pod, ports: &[u16]) -> Result<Box<dyn Forwarder>> {
        let pods = Api::namespaced(self.client.clone(), &self.namespace);
        let mut listeners = Vec::with_capacity(ports.len());
        for &remote in ports {
            let listener = bind_local(remote).await?;
            let local = listener.local_addr().map_err(Error::Listener)?.port();
            listeners.push((listener, ForwardedPort { local, remote }));
        }
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Box::new(KubeForwarder {
            pods,
            pod_name: pod.name_any(),
            listeners,
            ready_tx,
            ready_rx,
        }))
    }
}

/// Prefer a local port equal to the remote one; this is a best-effort hint,
/// so a conflict falls back to an ephemeral port.
async fn bind_local(remote: u16) -> Result<TcpListener> {
    if let Ok(listener) = TcpListener::bind(("127.0.0.1", remote)).await {
        return Ok(listener);
    }
    TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(Error::Listener)
}

/// Forwards local TCP connections to container ports of one pod. Each
/// accepted connection gets its own upgraded stream to the apiserver.
pub struct KubeForwarder {
    pods: Api<Pod>,
    pod_name: String,
    listeners: Vec<(TcpListener, ForwardedPort)>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Forwarder for KubeForwarder {
    fn ports(&self) -> Vec<ForwardedPort> {
        self.listeners.iter().map(|(_, port)| *port).collect()
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    async fn run(self: Box<Self>, stop: CancellationToken) -> Result<()> {
        let Self {
            pods,
            pod_name,
            listeners,
            ready_tx,
            ..
        } = *self;
        let remotes: Vec<u16> = listeners.iter().map(|(_, port)| port.remote).collect();

        // One probe handshake up front so readiness means the target accepts
        // upgraded streams; connections get their own session later.
        let probe = pods.portforward(&pod_name, &remotes).await?;
        drop(probe);
        let _ = ready_tx.send(true);

        let mut serve = JoinSet::new();
        for (listener, port) in listeners {
            serve.spawn(serve_port(
                pods.clone(),
                pod_name.clone(),
                listener,
                port,
                stop.clone(),
            ));
        }

        while let Some(joined) = serve.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    serve.abort_all();
                    return Err(error);
                }
                Err(_) => {}
            }
        }
        Ok(())
    }
}

async fn serve_port(
    pods: Api<Pod>,
    pod_name: String,
    listener: TcpListener,
    port: ForwardedPort,
    stop: CancellationToken,
) -> Result<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(Error::Listener)?;
                debug!(%peer, local = port.local, remote = port.remote, "accepted connection");
                let pods = pods.clone();
                let pod_name = pod_name.clone();
                connections.spawn(async move {
                    if let Err(error) = forward_connection(&pods, &pod_name, port.remote, stream).await {
                        warn!(%error, pod = %pod_name, remote = port.remote, "connection closed with error");
                    }
                });
            }
        }
    }
    connections.shutdown().await;
    Ok(())
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod_name: &str,
    remote: u16,
    mut stream: TcpStream,
) -> Result<()> {
    let mut forwarder = pods.portforward(pod_name, &[remote]).await?;
    let mut upstream = forwarder
        .take_stream(remote)
        .ok_or(Error::MissingStream(remote))?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream)
        .await
        .map_err(Error::Connection)?;
    Ok(())
}
