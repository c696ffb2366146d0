//! Trait boundaries the core consumes from its external collaborators.
//! Nothing in this crate depends on a concrete Kubernetes client,
//! host-file editor, IP-pool primitive, or streaming-tunnel primitive —
//! only on these traits, so `tunnelctl-kube` and `tunnelctl-net` can each
//! implement their half without the core knowing about `kube` or `ipnet`
//! at all.

use std::net::IpAddr;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::models::{
    PodIdentity,
    ServiceId,
};

/// One cluster-reported backend address, as surfaced by an endpoints
/// object: `{targetRef: {kind, name, namespace}}`. Only `Pod` targets are
/// meaningful to the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    pub target_kind: String,
    pub target_ref: Option<PodIdentity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
}

/// The cluster's published endpoints object for one service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointsObject {
    pub service: ServiceId,
    pub subsets: Vec<EndpointSubset>,
}

impl EndpointsObject {
    pub fn empty(service: ServiceId) -> Self {
        Self {
            service,
            subsets: Vec::new(),
        }
    }

    /// The set of pods currently referenced: iterate all subsets, then all
    /// addresses, keeping only `Pod`-kind targets.
    pub fn live_pods(&self) -> Vec<PodIdentity> {
        self.subsets
            .iter()
            .flat_map(|s| s.addresses.iter())
            .filter(|a| a.target_kind == "Pod")
            .filter_map(|a| a.target_ref.clone())
            .collect()
    }
}

pub type EndpointsStream = Pin<Box<dyn Stream<Item = EndpointsObject> + Send>>;

/// A single forwarded tunnel, bound to one connection's loopback address:
/// a blocking `forward_ports` and an idempotent, synchronous `close`.
/// Takes `&self` rather than `&mut self` so a `Connection` can hold an
/// `Arc<dyn Forwarder>` shared between the spawned forward task and the
/// processor's stop procedure; implementors manage their own interior
/// mutability.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Blocks (without holding up the processor — the caller spawns this
    /// onto its own task) until the tunnel stops, either because `close`
    /// was called or because the underlying stream failed.
    async fn forward_ports(&self) -> Result<()>;

    /// Idempotent; safe to call after `forward_ports` has already
    /// returned.
    fn close(&self);
}

/// The cluster API surface the core consumes: a watch over all
/// namespaces' endpoints, a point lookup, and the portforward upgrade
/// that produces a `Forwarder`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// A watch over endpoints across all namespaces, collapsed to the
    /// single Update event kind the core cares about.
    async fn watch_endpoints(&self) -> Result<EndpointsStream>;

    /// A synchronous point lookup, used when a `Create` request carries
    /// no explicit endpoint.
    async fn get_endpoints(&self, service: &ServiceId) -> Result<EndpointsObject>;

    /// The portforward upgrade to a bidirectional stream, handed to a
    /// `Forwarder` bound on `address` for each of `ports`
    /// (`address:p -> pod:p`).
    async fn open_tunnel(
        &self, pod: &PodIdentity, address: IpAddr, ports: &[u16],
    ) -> Result<Box<dyn Forwarder>>;
}

/// Allocate/release addresses from a configured loopback range.
pub trait IpPool: Send + Sync {
    fn acquire_any(&self) -> Result<IpAddr>;
    fn acquire_specific(&self, addr: IpAddr) -> Result<()>;
    fn release(&self, addr: IpAddr) -> Result<()>;
}

/// Add/remove `(address -> hostnames)` bindings in the system host file.
pub trait HostAliasManager: Send + Sync {
    fn add(&self, addr: IpAddr, hostnames: &[String]) -> Result<()>;
    fn remove(&self, hostnames: &[String]) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// Per-address interface plumbing on platforms where the loopback does
/// not already route the whole pool range. A no-op implementation is
/// valid and expected on platforms that do.
pub trait PlatformAdapter: Send + Sync {
    fn alias_up(&self, addr: IpAddr) -> Result<()>;
    fn alias_down(&self, addr: IpAddr) -> Result<()>;
}
