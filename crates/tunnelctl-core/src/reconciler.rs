use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::DroppingReceiver;
use crate::models::{
    ConnectionSnapshot,
    Request,
    TunnelSpec,
};
use crate::ports::EndpointsObject;
use crate::registry::SharedRegistry;

/// The reaper: consumes endpoint events and enqueues recreate requests.
/// Never touches the registry directly — only reads published snapshots
/// and writes to the request channel.
pub async fn run(
    shared: SharedRegistry, mut events: DroppingReceiver<EndpointsObject>,
    requests: mpsc::Sender<Request>, cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconciler observed cancellation, stopping");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Some(request) = decide(&shared, &event) {
                            debug!(service = %event.service, "reconciler enqueuing recreate");
                            if requests.send(request).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

/// The decision table, applied to one endpoints update. Returns `None`
/// when no connection is registered for the event's service (discard)
/// or when the bound pod is still live.
pub fn decide(shared: &SharedRegistry, event: &EndpointsObject) -> Option<Request> {
    let key = event.service.key();
    let snapshot = shared.get(&key)?;
    let live = event.live_pods();

    match &snapshot.pod {
        Some(bound) => {
            if live.iter().any(|p| p == bound) {
                None
            } else {
                let reason = format!("endpoints '{}' was removed", bound.key());
                Some(Request::recreate(spec_from(&snapshot), reason))
            }
        }
        None => {
            if live.is_empty() {
                None
            } else {
                Some(Request::recreate(
                    spec_from(&snapshot),
                    "found endpoints, service originally had none",
                ))
            }
        }
    }
}

fn spec_from(snapshot: &ConnectionSnapshot) -> TunnelSpec {
    TunnelSpec::new(
        snapshot.service.clone(),
        snapshot.hostnames.clone(),
        snapshot.ports.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        PodIdentity,
        ServiceId,
        TunnelStatus,
    };
    use crate::ports::{
        EndpointAddress,
        EndpointSubset,
    };

    fn snapshot(service: ServiceId, pod: Option<PodIdentity>) -> ConnectionSnapshot {
        ConnectionSnapshot {
            service,
            pod,
            ip: "127.0.0.2".parse().unwrap(),
            hostnames: vec!["web.local".into()],
            ports: vec![8080],
            status: TunnelStatus::Running,
            status_reason: None,
        }
    }

    fn endpoints_with(service: ServiceId, pods: Vec<PodIdentity>) -> EndpointsObject {
        EndpointsObject {
            service,
            subsets: vec![EndpointSubset {
                addresses: pods
                    .into_iter()
                    .map(|p| EndpointAddress {
                        target_kind: "Pod".into(),
                        target_ref: Some(p),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn unknown_service_is_discarded() {
        let shared = SharedRegistry::new();
        let service = ServiceId::new("web", "default");
        let event = EndpointsObject::empty(service);
        assert!(decide(&shared, &event).is_none());
    }

    #[test]
    fn bound_pod_still_live_takes_no_action() {
        let shared = SharedRegistry::new();
        let service = ServiceId::new("web", "default");
        let pod = PodIdentity::new("web-1", "default");
        shared.publish(&service.key(), snapshot(service.clone(), Some(pod.clone())));

        let event = endpoints_with(service, vec![pod]);
        assert!(decide(&shared, &event).is_none());
    }

    #[test]
    fn bound_pod_removed_enqueues_recreate_with_pod_key_reason() {
        let shared = SharedRegistry::new();
        let service = ServiceId::new("web", "default");
        let pod = PodIdentity::new("web-1", "default");
        shared.publish(&service.key(), snapshot(service.clone(), Some(pod)));

        let replacement = PodIdentity::new("web-2", "default");
        let event = endpoints_with(service, vec![replacement]);

        let request = decide(&shared, &event).expect("expected a recreate request");
        match request {
            Request::Create {
                recreate,
                recreate_reason,
                ..
            } => {
                assert!(recreate);
                assert_eq!(recreate_reason, "endpoints 'default/web-1' was removed");
            }
            Request::Delete { .. } => panic!("expected a Create request"),
        }
    }

    #[test]
    fn waiting_connection_with_no_live_pods_takes_no_action() {
        let shared = SharedRegistry::new();
        let service = ServiceId::new("web", "default");
        shared.publish(&service.key(), snapshot(service.clone(), None));

        let event = EndpointsObject::empty(service);
        assert!(decide(&shared, &event).is_none());
    }

    #[test]
    fn waiting_connection_gains_endpoints_enqueues_recreate() {
        let shared = SharedRegistry::new();
        let service = ServiceId::new("web", "default");
        shared.publish(&service.key(), snapshot(service.clone(), None));

        let pod = PodIdentity::new("web-1", "default");
        let event = endpoints_with(service, vec![pod]);

        let request = decide(&shared, &event).expect("expected a recreate request");
        match request {
            Request::Create {
                recreate,
                recreate_reason,
                ..
            } => {
                assert!(recreate);
                assert_eq!(recreate_reason, "found endpoints, service originally had none");
            }
            Request::Delete { .. } => panic!("expected a Create request"),
        }
    }

    #[test]
    fn re_receiving_same_event_after_convergence_is_idempotent() {
        let shared = SharedRegistry::new();
        let service = ServiceId::new("web", "default");
        let pod = PodIdentity::new("web-1", "default");
        // Simulates post-recreate state: conn.pod now matches the live set.
        shared.publish(&service.key(), snapshot(service.clone(), Some(pod.clone())));

        let event = endpoints_with(service, vec![pod]);
        assert!(decide(&shared, &event).is_none());
        assert!(decide(&shared, &event).is_none());
    }
}
