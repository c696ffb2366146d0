//! The `ClusterApi`/`Forwarder` adapters over a real Kubernetes cluster:
//! an all-namespaces endpoints watch, a point lookup, and the
//! portforward primitive that backs each tunnel.

mod client;
mod forwarder;

pub use client::KubeClusterApi;
pub use forwarder::KubeForwarder;
