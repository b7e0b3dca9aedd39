//! Reactive log streaming and port-forwarding for applications running in a
//! Kubernetes cluster.
//!
//! The [`portforward`] module maintains one TCP forward per deployment,
//! following replicas as they come and go; [`logstream`] tails the logs of
//! every pod belonging to the application. Both run until their cancellation
//! token fires.

pub mod error;
pub mod labels;
pub mod logstream;
pub mod portforward;
pub mod telemetry;

pub use error::{Error, Result};
