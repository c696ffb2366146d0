use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Endpoints as K8sEndpoints,
    Pod,
};
use kube::{
    Api,
    Client,
};
use kube_runtime::watcher::{
    self,
    Config as WatcherConfig,
};
use kube_runtime::WatchStreamExt;
use tracing::warn;
use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::models::{
    PodIdentity,
    ServiceId,
};
use tunnelctl_core::ports::{
    ClusterApi,
    EndpointAddress,
    EndpointSubset,
    EndpointsObject,
    EndpointsStream,
    Forwarder,
};

use crate::forwarder::KubeForwarder;

/// Watches, looks up, and opens portforward tunnels against a real
/// cluster, via the ambient kubeconfig (`Client::try_default`).
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Cluster(format!("failed to build Kubernetes client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn watch_endpoints(&self) -> Result<EndpointsStream> {
        let api: Api<K8sEndpoints> = Api::all(self.client.clone());

        let stream = watcher::watcher(api, WatcherConfig::default())
            .default_backoff()
            .applied_objects()
            .filter_map(|item| async move {
                match item {
                    Ok(endpoints) => Some(to_endpoints_object(endpoints)),
                    Err(err) => {
                        warn!(error = %err, "endpoints watch stream reported an error");
                        None
                    }
                }
            });

        Ok(Box::pin(stream))
    }

    async fn get_endpoints(&self, service: &ServiceId) -> Result<EndpointsObject> {
        let api: Api<K8sEndpoints> = Api::namespaced(self.client.clone(), &service.namespace);
        let endpoints = api
            .get(&service.name)
            .await
            .map_err(|e| Error::Cluster(format!("failed to get endpoints for {service}: {e}")))?;
        Ok(to_endpoints_object(endpoints))
    }

    async fn open_tunnel(
        &self, pod: &PodIdentity, address: std::net::IpAddr, ports: &[u16],
    ) -> Result<Box<dyn Forwarder>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        Ok(Box::new(KubeForwarder::new(api, pod.name.clone(), address, ports.to_vec())))
    }
}

fn to_endpoints_object(endpoints: K8sEndpoints) -> EndpointsObject {
    let service = ServiceId::new(
        endpoints.metadata.name.clone().unwrap_or_default(),
        endpoints.metadata.namespace.clone().unwrap_or_default(),
    );

    let subsets = endpoints
        .subsets
        .unwrap_or_default()
        .into_iter()
        .map(|subset| EndpointSubset {
            addresses: subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .map(|address| {
                    let kind = address
                        .target_ref
                        .as_ref()
                        .and_then(|r| r.kind.clone())
                        .unwrap_or_default();
                    let target_ref = address.target_ref.and_then(|r| {
                        if r.kind.as_deref() == Some("Pod") {
                            Some(PodIdentity::new(r.name.unwrap_or_default(), r.namespace.unwrap_or_default()))
                        } else {
                            None
                        }
                    });
                    EndpointAddress {
                        target_kind: kind,
                        target_ref,
                    }
                })
                .collect(),
        })
        .collect();

    EndpointsObject { service, subsets }
}
