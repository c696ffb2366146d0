//! Reconciliation core for the local service-tunnel controller: data
//! model, registry, reconciler, request processor, and lifecycle. No
//! concrete Kubernetes client, host-file editor, or platform networking
//! lives here — only the trait boundaries in [`ports`] that `tunnelctl-kube`
//! and `tunnelctl-net` implement.

pub mod channel;
pub mod error;
pub mod models;
pub mod ports;
mod processor;
mod reconciler;
mod registry;
mod watcher;
mod worker;

pub use error::{
    Error,
    Result,
};
pub use models::{
    ConnectionSnapshot,
    PodIdentity,
    Request,
    ServiceId,
    TunnelSpec,
    TunnelStatus,
};
pub use registry::SharedRegistry;
pub use worker::Worker;
