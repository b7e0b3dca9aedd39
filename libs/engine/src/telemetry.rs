use serde::Serialize;
use thiserror::Error;
use tracing::dispatcher::SetGlobalDefaultError;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// An error type representing issues that can occur during tracing
/// initialization.
#[derive(Error, Debug)]
pub enum Error {
    /// Error encountered when setting the global tracing subscriber.
    #[error("SetGlobalDefaultError: {0}")]
    SetGlobalDefaultError(#[source] SetGlobalDefaultError),
}

/// Specifies the format of log output, either JSON or plain-text.
///
/// This enum derives `clap::ValueEnum` for use in command-line argument
/// parsing, and is serialized in lowercase when used with `serde`.
#[derive(clap::ValueEnum, Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON-formatted log output.
    Json,

    /// Plain-text log output.
    Text,
}

/// Initializes the logging subsystem.
///
/// Diagnostics go to stderr so that stdout stays reserved for the streamed
/// application logs and the watcher's own output lines. The filter string is
/// an `EnvFilter` directive, e.g. `"info,kube=debug,radrun=debug"`.
pub fn init(log_filter: &str, log_format: LogFormat) -> Result<(), Error> {
    let logger = match log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let filter = EnvFilter::new(log_filter);

    let collector = Registry::default().with(logger).with(filter);
    tracing::subscriber::set_global_default(collector).map_err(Error::SetGlobalDefaultError)
}
