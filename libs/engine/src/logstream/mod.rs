//! Streams the logs of every pod belonging to an application to a shared
//! writer, one colored `<pod> <container> <message>` line at a time.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crossterm::style::{Color, Stylize};
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::LogParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::labels::APPLICATION_LABEL;
use crate::portforward::SharedWriter;

/// How far back the follow reaches on start.
const LOG_WINDOW_SECONDS: i64 = 48 * 60 * 60;

/// Follows the logs of all pods carrying the application label, including
/// init and ephemeral containers, for as long as the context lives.
///
/// Containers are tailed from the moment they are running; a container that
/// terminates is dropped and picked up again if it restarts. Log streams are
/// not unified with the port-forward state in any way.
pub struct LogStreamer {
    client: Client,
    namespace: String,
    application: String,
    writer: SharedWriter,
}

impl LogStreamer {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        application: impl Into<String>,
        writer: SharedWriter,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            application: application.into(),
            writer,
        }
    }

    /// Blocks until the token fires; cancellation is a clean exit.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let selector = format!("{APPLICATION_LABEL}={}", self.application);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let stream =
            watcher(pods.clone(), watcher::Config::default().labels(&selector)).default_backoff();
        let mut stream = std::pin::pin!(stream);
        debug!(namespace = %self.namespace, %selector, "following application logs");

        let mut tails: HashMap<String, JoinHandle<()>> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                        self.watch_containers(&pods, &mut tails, &pod);
                    }
                    Ok(Some(watcher::Event::Delete(pod))) => {
                        let prefix = format!("{}/", pod.name_any());
                        tails.retain(|key, task| {
                            if key.starts_with(&prefix) {
                                task.abort();
                                false
                            } else {
                                true
                            }
                        });
                    }
                    Ok(Some(watcher::Event::Init | watcher::Event::InitDone)) => {}
                    Ok(None) => break,
                    Err(error) => error!(%error, "pod watch failed, backing off"),
                },
            }
        }

        for (_, task) in tails.drain() {
            task.abort();
        }
        Ok(())
    }

    /// Opens a tail for every running container of the pod that is not
    /// already being followed, and reaps tails of terminated containers.
    fn watch_containers(
        &self,
        api: &Api<Pod>,
        tails: &mut HashMap<String, JoinHandle<()>>,
        pod: &Pod,
    ) {
        let Some(status) = &pod.status else { return };
        let pod_name = pod.name_any();
        let statuses = [
            &status.init_container_statuses,
            &status.container_statuses,
            &status.ephemeral_container_statuses,
        ];
        for container in statuses.into_iter().flatten().flatten() {
            let key = format!("{pod_name}/{}", container.name);
            if is_running(container) {
                if tails.contains_key(&key) {
                    continue;
                }
                let task = tokio::spawn(tail(
                    api.clone(),
                    pod_name.clone(),
                    container.name.clone(),
                    self.writer.clone(),
                ));
                tails.insert(key, task);
            } else if is_terminated(container) {
                if let Some(task) = tails.remove(&key) {
                    debug!(pod = %pod_name, container = %container.name, "container terminated");
                    task.abort();
                }
            }
        }
    }
}

fn is_running(container: &ContainerStatus) -> bool {
    container
        .state
        .as_ref()
        .is_some_and(|state| state.running.is_some())
}

fn is_terminated(container: &ContainerStatus) -> bool {
    container
        .state
        .as_ref()
        .is_some_and(|state| state.terminated.is_some())
}

async fn tail(api: Api<Pod>, pod: String, container: String, writer: SharedWriter) {
    let params = LogParams {
        container: Some(container.clone()),
        follow: true,
        since_seconds: Some(LOG_WINDOW_SECONDS),
        timestamps: false,
        ..LogParams::default()
    };

    match api.log_stream(&pod, &params).await {
        Ok(stream) => {
            debug!(%pod, %container, "following container log");
            let mut lines = stream.lines();
            while let Ok(Some(line)) = lines.try_next().await {
                let rendered = render_line(&pod, &container, &line);
                let mut writer = writer.lock().await;
                let _ = writer.write_all(rendered.as_bytes()).await;
            }
        }
        Err(error) => warn!(%error, %pod, %container, "failed to open log stream"),
    }
}

fn render_line(pod: &str, container: &str, message: &str) -> String {
    format!(
        "{} {} {message}\n",
        pod.with(color_for(pod)),
        container.with(color_for(container)),
    )
}

/// Stable per-name color so a pod keeps its color across lines.
fn color_for(name: &str) -> Color {
    const PALETTE: [Color; 6] = [
        Color::Cyan,
        Color::Green,
        Color::Magenta,
        Color::Yellow,
        Color::Blue,
        Color::Red,
    ];
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    PALETTE[(hasher.finish() % PALETTE.len() as u64) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container_status(name: &str, state: serde_json::Value) -> ContainerStatus {
        serde_json::from_value(json!({
            "name": name,
            "image": "test-image",
            "imageID": "",
            "ready": true,
            "restartCount": 0,
            "state": state,
        }))
        .expect("valid container status fixture")
    }

    #[test]
    fn test_running_and_terminated_states() {
        let running = container_status("web", json!({ "running": { "startedAt": "2022-01-01T00:00:00Z" } }));
        assert!(is_running(&running));
        assert!(!is_terminated(&running));

        let terminated = container_status("web", json!({ "terminated": { "exitCode": 0 } }));
        assert!(is_terminated(&terminated));
        assert!(!is_running(&terminated));

        let waiting = container_status("web", json!({ "waiting": {} }));
        assert!(!is_running(&waiting));
        assert!(!is_terminated(&waiting));
    }

    #[test]
    fn test_color_is_stable_per_name() {
        assert_eq!(color_for("demo-abc"), color_for("demo-abc"));
    }

    #[test]
    fn test_render_line_carries_message() {
        let line = render_line("demo-abc", "web", "hello");
        assert!(line.ends_with("hello\n"));
        assert!(line.contains("demo-abc"));
        assert!(line.contains("web"));
    }
}
