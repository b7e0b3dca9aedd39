pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the watcher tree and the forwarders.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube` client.
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Local listener setup or accept failure.
    #[error("local forward listener failed: {0}")]
    Listener(#[source] std::io::Error),

    /// The port-forward transport did not hand back a stream for the port.
    #[error("no port-forward stream for remote port {0}")]
    MissingStream(u16),

    /// A single forwarded connection broke mid-stream.
    #[error("forwarded connection failed: {0}")]
    Connection(#[source] std::io::Error),
}
