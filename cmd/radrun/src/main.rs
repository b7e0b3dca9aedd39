use radrun_engine::labels::ApplicationSelector;
use radrun_engine::logstream::LogStreamer;
use radrun_engine::portforward::{shared_writer, ApplicationWatcher, StatusKind, StatusMessage};
use radrun_engine::telemetry;
use radrun_k8s_util::client::new_client;

use clap::{crate_authors, crate_description, crate_version, Parser};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "radrun",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Application whose logs are streamed and whose deployments are
    /// port-forwarded
    application: String,

    /// Namespace the application runs in
    #[arg(short, long, default_value = "default", env)]
    namespace: String,

    /// Kubeconfig context to use instead of the current one
    #[arg(long, env = "RADRUN_CONTEXT")]
    context: Option<String>,

    /// Namespace the dashboard deployment runs in
    #[arg(long, default_value = "radius-system", env)]
    dashboard_namespace: String,

    /// Do not watch or forward the dashboard deployment
    #[arg(long, default_value_t = false)]
    skip_dashboard: bool,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,radrun=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,
}

/// Runs one engine task; its failure takes the whole workflow down instead of
/// leaving the siblings running headless.
async fn run_until(
    task: impl std::future::Future<Output = radrun_engine::Result<()>>,
    cancel: CancellationToken,
) -> radrun_engine::Result<()> {
    let result = task.await;
    if result.is_err() {
        cancel.cancel();
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(&args.log_filter, args.log_format)?;

    let client = new_client(args.context.as_deref()).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                cancel.cancel();
            }
        });
    }

    let writer = shared_writer(tokio::io::stdout());
    let (status_tx, mut status_rx) = mpsc::channel::<StatusMessage>(1);
    let printer = tokio::spawn(async move {
        while let Some(message) = status_rx.recv().await {
            match message.kind {
                StatusKind::Connected => println!(
                    "{} [port-forward] connected localhost:{} -> {}:{}",
                    message.container_name,
                    message.local_port,
                    message.replica_name,
                    message.remote_port,
                ),
                StatusKind::Disconnected => println!(
                    "{} [port-forward] disconnected localhost:{}",
                    message.container_name, message.local_port,
                ),
            }
        }
    });

    let application = ApplicationWatcher::new(
        client.clone(),
        &args.namespace,
        ApplicationSelector::application(&args.application),
        Some(status_tx.clone()),
        writer.clone(),
    )
    .run(cancel.child_token());

    let dashboard = {
        let watcher = (!args.skip_dashboard).then(|| {
            ApplicationWatcher::new(
                client.clone(),
                &args.dashboard_namespace,
                ApplicationSelector::Dashboard,
                Some(status_tx.clone()),
                writer.clone(),
            )
        });
        let cancel = cancel.child_token();
        async move {
            match watcher {
                Some(watcher) => watcher.run(cancel).await,
                None => Ok(()),
            }
        }
    };

    let logs = LogStreamer::new(client, &args.namespace, &args.application, writer).run(cancel.child_token());

    // only the watchers hold senders now, so the printer drains and stops
    // once they do
    drop(status_tx);

    let (application, dashboard, logs) = tokio::join!(
        run_until(application, cancel.clone()),
        run_until(dashboard, cancel.clone()),
        run_until(logs, cancel.clone()),
    );
    application?;
    dashboard?;
    logs?;
    printer.await?;
    Ok(())
}
