use std::net::IpAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::ports::Forwarder;

/// One loopback-address tunnel, possibly covering several ports
/// (`address:p -> pod:p` for each `p`). Each port gets its own listener
/// task; `forward_ports` joins them all and returns once every listener
/// has stopped (via `close`, or a listener failing outright).
pub struct KubeForwarder {
    pods: Api<Pod>,
    pod_name: String,
    address: IpAddr,
    ports: Vec<u16>,
    cancel: CancellationToken,
}

impl KubeForwarder {
    pub fn new(pods: Api<Pod>, pod_name: String, address: IpAddr, ports: Vec<u16>) -> Self {
        Self {
            pods,
            pod_name,
            address,
            ports,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Forwarder for KubeForwarder {
    async fn forward_ports(&self) -> Result<()> {
        let mut listeners = Vec::with_capacity(self.ports.len());
        for &port in &self.ports {
            let pods = self.pods.clone();
            let pod_name = self.pod_name.clone();
            let address = self.address;
            let cancel = self.cancel.clone();
            listeners.push(tokio::spawn(async move {
                run_listener(pods, pod_name, address, port, cancel).await
            }));
        }

        let mut first_error = None;
        for listener in listeners {
            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if first_error.is_none() => first_error = Some(err),
                Ok(Err(_)) => {}
                Err(join_err) if first_error.is_none() => {
                    first_error = Some(Error::Tunnel(join_err.to_string()));
                }
                Err(_) => {}
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Binds one loopback `address:port`, accepting connections until
/// cancelled; one listener per port.
async fn run_listener(
    pods: Api<Pod>, pod_name: String, address: IpAddr, port: u16, cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind((address, port))
        .await
        .map_err(|e| Error::Tunnel(format!("failed to bind {address}:{port}: {e}")))?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| Error::Tunnel(format!("accept on {address}:{port} failed: {e}")))?;
                let pods = pods.clone();
                let pod_name = pod_name.clone();
                tokio::spawn(async move {
                    if let Err(err) = proxy_connection(pods, pod_name, port, stream).await {
                        debug!(error = %err, port, "tunnel connection ended with an error");
                    }
                });
            }
        }
    }
}

async fn proxy_connection(pods: Api<Pod>, pod_name: String, port: u16, mut client: TcpStream) -> Result<()> {
    let _ = client.set_nodelay(true);

    let mut portforwarder = pods
        .portforward(&pod_name, &[port])
        .await
        .map_err(|e| Error::Tunnel(format!("failed to open portforward to {pod_name}:{port}: {e}")))?;

    let mut upstream = portforwarder
        .take_stream(port)
        .ok_or_else(|| Error::Tunnel(format!("no upstream stream for {pod_name}:{port}")))?;

    tokio::io::copy_bidirectional(&mut client, &mut upstream)
        .await
        .map_err(|e| Error::Tunnel(e.to_string()))?;

    Ok(())
}
