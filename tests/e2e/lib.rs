#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::apps::v1::Deployment;
    use kube::api::{Api, DeleteParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, Condition};
    use radrun_engine::labels::ApplicationSelector;
    use radrun_engine::portforward::{shared_writer, ApplicationWatcher, StatusKind, StatusMessage};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn is_deployment_ready() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| {
            if let Some(deployment) = &obj {
                if let Some(status) = &deployment.status {
                    return status.replicas == status.updated_replicas
                        && status.replicas == status.ready_replicas;
                }
            }
            false
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(60),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn app_deployment(name: &str, application: &str) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "labels": { "radapp.io/application": application },
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": {
                        "labels": {
                            "app": name,
                            "radapp.io/application": application,
                            "radapp.io/resource": name,
                        },
                    },
                    "spec": {
                        "containers": [{
                            "name": name,
                            "image": "nginx:stable",
                            "ports": [{ "containerPort": 80 }],
                        }],
                    },
                },
            },
        }))
        .unwrap()
    }

    async fn setup(name: &str, application: &str) -> (Client, Api<Deployment>) {
        let client = Client::try_default().await.unwrap();
        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        deployment_api
            .create(&PostParams::default(), &app_deployment(name, application))
            .await
            .unwrap();
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        (client, deployment_api)
    }

    async fn recv_status(
        status_rx: &mut mpsc::Receiver<StatusMessage>,
        secs: u64,
    ) -> StatusMessage {
        timeout(Duration::from_secs(secs), status_rx.recv())
            .await
            .expect("timed out waiting for a status message")
            .expect("status channel closed early")
    }

    #[tokio::test]
    async fn forward_connects_and_disconnects() {
        let name = "e2e-forward";
        let (client, deployment_api) = setup(name, "e2e-forward-app").await;

        let (status_tx, mut status_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let watcher = ApplicationWatcher::new(
            client,
            "default",
            ApplicationSelector::application("e2e-forward-app"),
            Some(status_tx),
            shared_writer(tokio::io::sink()),
        );
        let task = tokio::spawn(watcher.run(cancel.clone()));

        let connected = recv_status(&mut status_rx, 60).await;
        assert_eq!(connected.kind, StatusKind::Connected);
        assert_eq!(connected.container_name, name);
        assert_eq!(connected.remote_port, 80);

        cancel.cancel();
        let disconnected = recv_status(&mut status_rx, 30).await;
        assert_eq!(disconnected.kind, StatusKind::Disconnected);
        assert_eq!(disconnected.replica_name, connected.replica_name);

        timeout(Duration::from_secs(30), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        deployment_api
            .delete(name, &DeleteParams::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn parallel_watchers_do_not_interfere() {
        let (client, first_api) = setup("e2e-parallel-a", "e2e-parallel-a-app").await;
        let (_, second_api) = setup("e2e-parallel-b", "e2e-parallel-b-app").await;

        let (first_tx, mut first_rx) = mpsc::channel(1);
        let (second_tx, mut second_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let first = tokio::spawn(
            ApplicationWatcher::new(
                client.clone(),
                "default",
                ApplicationSelector::application("e2e-parallel-a-app"),
                Some(first_tx),
                shared_writer(tokio::io::sink()),
            )
            .run(cancel.child_token()),
        );
        let second = tokio::spawn(
            ApplicationWatcher::new(
                client,
                "default",
                ApplicationSelector::application("e2e-parallel-b-app"),
                Some(second_tx),
                shared_writer(tokio::io::sink()),
            )
            .run(cancel.child_token()),
        );

        let first_connected = recv_status(&mut first_rx, 60).await;
        let second_connected = recv_status(&mut second_rx, 60).await;
        assert_eq!(first_connected.container_name, "e2e-parallel-a");
        assert_eq!(second_connected.container_name, "e2e-parallel-b");

        // one cancellation winds both watchers down
        cancel.cancel();
        assert_eq!(recv_status(&mut first_rx, 30).await.kind, StatusKind::Disconnected);
        assert_eq!(recv_status(&mut second_rx, 30).await.kind, StatusKind::Disconnected);
        timeout(Duration::from_secs(30), first).await.unwrap().unwrap().unwrap();
        timeout(Duration::from_secs(30), second).await.unwrap().unwrap().unwrap();

        for (api, name) in [(first_api, "e2e-parallel-a"), (second_api, "e2e-parallel-b")] {
            api.delete(name, &DeleteParams::default()).await.unwrap();
        }
    }
}
