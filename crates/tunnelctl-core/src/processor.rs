//! The request processor: the only task that ever holds a `&mut Registry`,
//! and therefore the only task that ever mutates the IP pool, host file,
//! or platform alias state. Everything else in this crate only reads
//! published `ConnectionSnapshot`s.

use std::net::IpAddr;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};

use crate::error::{
    Error,
    Result,
};
use crate::models::{
    PodIdentity,
    Request,
    ServiceId,
    TunnelSpec,
    TunnelStatus,
};
use crate::ports::{
    ClusterApi,
    HostAliasManager,
    IpPool,
    PlatformAdapter,
};
use crate::registry::{
    Connection,
    Registry,
};

pub struct Processor {
    registry: Registry,
    cluster: Arc<dyn ClusterApi>,
    ip_pool: Arc<dyn IpPool>,
    host_aliases: Arc<dyn HostAliasManager>,
    platform: Arc<dyn PlatformAdapter>,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl Processor {
    pub fn new(
        registry: Registry, cluster: Arc<dyn ClusterApi>, ip_pool: Arc<dyn IpPool>,
        host_aliases: Arc<dyn HostAliasManager>, platform: Arc<dyn PlatformAdapter>,
        requests: mpsc::Sender<Request>, cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            cluster,
            ip_pool,
            host_aliases,
            platform,
            requests,
            cancel,
        }
    }

    /// The processor's main loop: serialize every request through
    /// `handle`, then — once the channel closes or cancellation fires
    /// between requests — run the shutdown teardown. Cancellation is only
    /// observed between requests, never mid-request, so an in-flight
    /// `Create`/`Delete` always finishes before shutdown begins.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<Request>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = receiver.recv() => {
                    match request {
                        Some(request) => self.handle(request).await,
                        None => break,
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Create {
                spec,
                recreate,
                recreate_reason,
            } => {
                let service = spec.service.clone();
                if let Err(err) = self.create(spec, recreate, recreate_reason).await {
                    warn!(service = %service, error = %err, "create request failed");
                }
            }
            Request::Delete { service } => {
                if let Err(err) = self.delete(&service).await {
                    warn!(service = %service, error = %err, "delete request failed");
                }
            }
        }
    }

    /// Builds one tunnel end to end, unwinding anything already acquired
    /// if a later step fails.
    async fn create(&mut self, spec: TunnelSpec, recreate: bool, recreate_reason: String) -> Result<()> {
        let key = spec.service.key();

        if self.registry.contains(&key) {
            if !recreate {
                return Err(Error::AlreadyExists(spec.service));
            }
            info!(service = %spec.service, reason = %recreate_reason, "recreating tunnel");
            if let Some(conn) = self.registry.get_mut(&key) {
                conn.status = TunnelStatus::Recreating;
                conn.status_reason = Some(recreate_reason);
            }
            // Publish the `Recreating` snapshot, then take the connection out
            // of the live map without unpublishing it: a status inspector
            // keeps seeing this `Recreating` entry for the whole
            // stop-then-rebuild window below, instead of the service
            // disappearing from the registry in between.
            self.registry.publish_status(&key);
            if let Some(old) = self.registry.take_for_replacement(&key) {
                if let Some(err) = self.stop_connection(old).await {
                    warn!(service = %spec.service, error = %err, "teardown during recreate reported errors");
                }
            }
        }

        // Cleanup-on-failure state: unwound in reverse acquisition order if
        // any later step errors.
        let mut acquired_ip: Option<IpAddr> = None;
        let mut alias_up = false;
        let mut hosts_added = false;

        let outcome = self
            .try_create(&spec, &mut acquired_ip, &mut alias_up, &mut hosts_added)
            .await;

        match outcome {
            Ok(connection) => {
                self.registry.publish(key, connection);
                Ok(())
            }
            Err(err) => {
                if hosts_added {
                    if let Err(e) = self.host_aliases.remove(&spec.hostnames) {
                        warn!(service = %spec.service, error = %e, "cleanup: failed to remove host aliases");
                    }
                    let _ = self.host_aliases.flush();
                }
                if alias_up {
                    if let Some(ip) = acquired_ip {
                        if let Err(e) = self.platform.alias_down(ip) {
                            warn!(service = %spec.service, error = %e, "cleanup: failed to tear down platform alias");
                        }
                    }
                }
                if let Some(ip) = acquired_ip {
                    if let Err(e) = self.ip_pool.release(ip) {
                        warn!(service = %spec.service, error = %e, "cleanup: failed to release address");
                    }
                }
                // A failed recreate leaves no connection behind (the old one
                // was already stopped above); drop the stale `Recreating`
                // snapshot `take_for_replacement` left published rather than
                // showing a status inspector a tunnel that no longer exists.
                if recreate {
                    self.registry.unpublish(&key);
                }
                Err(err)
            }
        }
    }

    /// Acquires a loopback address, plumbs the platform alias, binds
    /// hostnames, selects a backend, and opens the tunnel. `acquired_ip`/
    /// `alias_up`/`hosts_added` are armed as each resource is claimed so
    /// the caller can unwind on error.
    async fn try_create(
        &mut self, spec: &TunnelSpec, acquired_ip: &mut Option<IpAddr>, alias_up: &mut bool,
        hosts_added: &mut bool,
    ) -> Result<Connection> {
        let ip = self
            .ip_pool
            .acquire_any()
            .map_err(|_| Error::ResourceExhausted(format!("no address available for {}", spec.service)))?;
        *acquired_ip = Some(ip);

        self.platform
            .alias_up(ip)
            .map_err(|e| Error::Platform(e.to_string()))?;
        *alias_up = true;

        if let Some((hostname, owner)) = self.registry.hostname_conflict(&spec.hostnames) {
            return Err(Error::Host(format!(
                "hostname '{hostname}' is already bound to service '{owner}'"
            )));
        }

        self.host_aliases
            .add(ip, &spec.hostnames)
            .map_err(|e| Error::Host(e.to_string()))?;
        self.host_aliases.flush().map_err(|e| Error::Host(e.to_string()))?;
        *hosts_added = true;

        let pod = self.select_backend(spec).await?;

        let Some(pod) = pod else {
            return Ok(Connection {
                service: spec.service.clone(),
                pod: None,
                ip,
                hostnames: spec.hostnames.clone(),
                ports: spec.ports.clone(),
                status: TunnelStatus::Waiting,
                status_reason: Some("No endpoints were found.".into()),
                handle: None,
                stopping: Arc::new(AtomicBool::new(false)),
            });
        };

        let handle: Arc<dyn crate::ports::Forwarder> = self
            .cluster
            .open_tunnel(&pod, ip, &spec.ports)
            .await
            .map_err(|e| Error::Tunnel(e.to_string()))?
            .into();

        let stopping = Arc::new(AtomicBool::new(false));
        self.spawn_forward_task(spec.clone(), handle.clone(), stopping.clone());

        Ok(Connection {
            service: spec.service.clone(),
            pod: Some(pod),
            ip,
            hostnames: spec.hostnames.clone(),
            ports: spec.ports.clone(),
            status: TunnelStatus::Running,
            status_reason: None,
            handle: Some(handle),
            stopping,
        })
    }

    /// Use the request's explicit endpoint if given, otherwise look up the
    /// service's current endpoints and take the first live pod. `None`
    /// means no backend is available yet (Waiting).
    async fn select_backend(&self, spec: &TunnelSpec) -> Result<Option<PodIdentity>> {
        if spec.endpoint.is_some() {
            return Ok(spec.endpoint.clone());
        }
        let endpoints = self
            .cluster
            .get_endpoints(&spec.service)
            .await
            .map_err(|e| Error::Cluster(e.to_string()))?;
        Ok(endpoints.live_pods().into_iter().next())
    }

    /// Drives the tunnel's forward loop on its own task until it exits
    /// (either via `close` during a deliberate teardown, or the stream
    /// failing on its own), then — unless the processor is shutting down
    /// or this exact connection was the one being torn down — asks the
    /// processor to recreate this connection. `stopping` is this
    /// connection's own flag: `stop_connection` sets it before calling
    /// `close`, so a deliberate teardown (`Delete`, or replacing this
    /// connection during a recreate) never produces a self-recreate for
    /// the generation that was just stopped. Without this check, every
    /// `close()` — including the one a `Delete` or recreate issues —
    /// wakes this same task, which would otherwise re-enqueue a `Create`
    /// for a service that was just removed.
    fn spawn_forward_task(
        &self, spec: TunnelSpec, handle: Arc<dyn crate::ports::Forwarder>, stopping: Arc<AtomicBool>,
    ) {
        let requests = self.requests.clone();
        let cancel = self.cancel.clone();
        let service = spec.service.clone();
        tokio::spawn(async move {
            let result = handle.forward_ports().await;
            if cancel.is_cancelled() || stopping.load(Ordering::SeqCst) {
                return;
            }
            let reason = match result {
                Ok(()) => "forwarder exited".to_string(),
                Err(err) => err.to_string(),
            };
            info!(service = %service, reason = %reason, "forwarder exited, requesting recreate");
            let _ = requests.send(Request::recreate(spec, reason)).await;
        });
    }

    /// Remove a service's tunnel entirely. `NotFound` if it isn't
    /// registered.
    async fn delete(&mut self, service: &ServiceId) -> Result<()> {
        let key = service.key();
        let connection = self.registry.remove(&key).ok_or_else(|| Error::NotFound(service.clone()))?;
        if let Some(err) = self.stop_connection(connection).await {
            return Err(err);
        }
        Ok(())
    }

    /// The stop procedure, in the order that ensures listeners stop
    /// before the addresses they're bound to are unbound. All four steps
    /// are attempted regardless of earlier failures; their errors are
    /// collected and returned as a single `Aggregate`, never
    /// short-circuited.
    async fn stop_connection(&mut self, connection: Connection) -> Option<Error> {
        let mut errors = Vec::new();

        // Mark this generation as deliberately stopping before waking its
        // forward task, so it skips the self-recreate it would otherwise
        // send once `close()` makes `forward_ports` return.
        connection.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = &connection.handle {
            handle.close();
        }

        if let Err(err) = self.ip_pool.release(connection.ip) {
            errors.push(Error::ResourceExhausted(err.to_string()));
        }
        if let Err(err) = self.platform.alias_down(connection.ip) {
            errors.push(Error::Platform(err.to_string()));
        }
        if let Err(err) = self.host_aliases.remove(&connection.hostnames) {
            errors.push(Error::Host(err.to_string()));
        }
        if let Err(err) = self.host_aliases.flush() {
            errors.push(Error::Host(err.to_string()));
        }

        Error::aggregate(errors)
    }

    /// Tear down every registered connection, logging but not propagating
    /// individual failures, then return once the registry is empty.
    async fn shutdown(&mut self) {
        for key in self.registry.keys() {
            if let Some(connection) = self.registry.remove(&key) {
                let service = connection.service.clone();
                if let Some(err) = self.stop_connection(connection).await {
                    warn!(service = %service, error = %err, "shutdown teardown reported errors");
                }
            }
        }
        debug_assert!(self.registry.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::ServiceId;
    use crate::ports::{
        EndpointsObject,
        EndpointsStream,
        Forwarder,
    };
    use crate::registry::SharedRegistry;

    struct FakeIpPool {
        next: Mutex<u8>,
        held: Mutex<HashSet<IpAddr>>,
    }

    impl FakeIpPool {
        fn new() -> Self {
            Self {
                next: Mutex::new(2),
                held: Mutex::new(HashSet::new()),
            }
        }
    }

    impl IpPool for FakeIpPool {
        fn acquire_any(&self) -> Result<IpAddr> {
            let mut next = self.next.lock().unwrap();
            let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, *next));
            *next += 1;
            self.held.lock().unwrap().insert(addr);
            Ok(addr)
        }

        fn acquire_specific(&self, addr: IpAddr) -> Result<()> {
            self.held.lock().unwrap().insert(addr);
            Ok(())
        }

        fn release(&self, addr: IpAddr) -> Result<()> {
            self.held.lock().unwrap().remove(&addr);
            Ok(())
        }
    }

    struct FakeHostAliases {
        bound: Mutex<Vec<String>>,
    }

    impl FakeHostAliases {
        fn new() -> Self {
            Self {
                bound: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostAliasManager for FakeHostAliases {
        fn add(&self, _addr: IpAddr, hostnames: &[String]) -> Result<()> {
            self.bound.lock().unwrap().extend(hostnames.iter().cloned());
            Ok(())
        }

        fn remove(&self, hostnames: &[String]) -> Result<()> {
            self.bound.lock().unwrap().retain(|h| !hostnames.contains(h));
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopPlatform;

    impl PlatformAdapter for NoopPlatform {
        fn alias_up(&self, _addr: IpAddr) -> Result<()> {
            Ok(())
        }

        fn alias_down(&self, _addr: IpAddr) -> Result<()> {
            Ok(())
        }
    }

    struct FakeForwarder {
        closed: std::sync::atomic::AtomicBool,
        notify: tokio::sync::Notify,
    }

    impl FakeForwarder {
        fn new() -> Self {
            Self {
                closed: std::sync::atomic::AtomicBool::new(false),
                notify: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl Forwarder for FakeForwarder {
        async fn forward_ports(&self) -> Result<()> {
            while !self.closed.load(std::sync::atomic::Ordering::SeqCst) {
                self.notify.notified().await;
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }

    struct FakeCluster {
        endpoints: Vec<PodIdentity>,
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn watch_endpoints(&self) -> Result<EndpointsStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn get_endpoints(&self, service: &ServiceId) -> Result<EndpointsObject> {
            use crate::ports::{
                EndpointAddress,
                EndpointSubset,
            };
            Ok(EndpointsObject {
                service: service.clone(),
                subsets: vec![EndpointSubset {
                    addresses: self
                        .endpoints
                        .iter()
                        .map(|p| EndpointAddress {
                            target_kind: "Pod".into(),
                            target_ref: Some(p.clone()),
                        })
                        .collect(),
                }],
            })
        }

        async fn open_tunnel(&self, _pod: &PodIdentity, _address: IpAddr, _ports: &[u16]) -> Result<Box<dyn Forwarder>> {
            Ok(Box::new(FakeForwarder::new()))
        }
    }

    fn make_processor(cluster: FakeCluster) -> (Processor, SharedRegistry, mpsc::Receiver<Request>) {
        let shared = SharedRegistry::new();
        let registry = Registry::new(shared.clone());
        let (tx, rx) = mpsc::channel(16);
        let processor = Processor::new(
            registry,
            Arc::new(cluster),
            Arc::new(FakeIpPool::new()),
            Arc::new(FakeHostAliases::new()),
            Arc::new(NoopPlatform),
            tx,
            CancellationToken::new(),
        );
        (processor, shared, rx)
    }

    #[tokio::test]
    async fn create_with_live_endpoint_publishes_running_connection() {
        let pod = PodIdentity::new("web-1", "default");
        let (mut processor, shared, _rx) = make_processor(FakeCluster {
            endpoints: vec![pod.clone()],
        });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec, false, String::new()).await.unwrap();

        let snapshot = shared.get(&service.key()).unwrap();
        assert_eq!(snapshot.status, TunnelStatus::Running);
        assert_eq!(snapshot.pod, Some(pod));
    }

    #[tokio::test]
    async fn create_with_no_endpoints_publishes_waiting_connection() {
        let (mut processor, shared, _rx) = make_processor(FakeCluster { endpoints: vec![] });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec, false, String::new()).await.unwrap();

        let snapshot = shared.get(&service.key()).unwrap();
        assert_eq!(snapshot.status, TunnelStatus::Waiting);
        assert!(snapshot.pod.is_none());
    }

    #[tokio::test]
    async fn duplicate_create_without_recreate_is_rejected() {
        let (mut processor, _shared, _rx) = make_processor(FakeCluster { endpoints: vec![] });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec.clone(), false, String::new()).await.unwrap();

        let err = processor.create(spec, false, String::new()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn recreate_ends_with_a_single_connection_and_a_fresh_handle() {
        let pod = PodIdentity::new("web-1", "default");
        let (mut processor, shared, _rx) = make_processor(FakeCluster {
            endpoints: vec![pod.clone()],
        });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec.clone(), false, String::new()).await.unwrap();
        let first_ip = shared.get(&service.key()).unwrap().ip;

        processor
            .create(spec, true, "endpoints 'default/web-1' was removed".into())
            .await
            .unwrap();

        assert_eq!(shared.all().len(), 1);
        let snapshot = shared.get(&service.key()).unwrap();
        assert_eq!(snapshot.status, TunnelStatus::Running);
        assert_ne!(snapshot.ip, first_ip);
    }

    #[tokio::test]
    async fn delete_removes_the_connection_and_releases_its_address() {
        let (mut processor, shared, _rx) = make_processor(FakeCluster { endpoints: vec![] });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec, false, String::new()).await.unwrap();
        assert!(shared.get(&service.key()).is_some());

        processor.delete(&service).await.unwrap();
        assert!(shared.get(&service.key()).is_none());
    }

    #[tokio::test]
    async fn delete_of_unknown_service_is_not_found() {
        let (mut processor, _shared, _rx) = make_processor(FakeCluster { endpoints: vec![] });
        let service = ServiceId::new("ghost", "default");
        let err = processor.delete(&service).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_does_not_resurrect_the_connection_via_its_own_stopped_forwarder() {
        let pod = PodIdentity::new("web-1", "default");
        let (mut processor, shared, mut rx) = make_processor(FakeCluster {
            endpoints: vec![pod],
        });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec, false, String::new()).await.unwrap();
        assert!(shared.get(&service.key()).is_some());

        processor.delete(&service).await.unwrap();
        assert!(shared.get(&service.key()).is_none());

        // `delete`'s `close()` wakes the deleted connection's forward task;
        // it must not enqueue a recreate for the service that was just
        // removed.
        let recreate = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(recreate.is_err(), "a deliberate delete must not produce a recreate request");
    }

    #[tokio::test]
    async fn recreate_does_not_cascade_into_a_further_recreate() {
        let pod = PodIdentity::new("web-1", "default");
        let (mut processor, shared, mut rx) = make_processor(FakeCluster {
            endpoints: vec![pod.clone()],
        });

        let service = ServiceId::new("web", "default");
        let spec = TunnelSpec::new(service.clone(), vec!["web.local".into()], vec![8080]);
        processor.create(spec.clone(), false, String::new()).await.unwrap();

        processor
            .create(spec, true, "endpoints 'default/web-1' was removed".into())
            .await
            .unwrap();

        assert_eq!(shared.all().len(), 1);
        // The stop-and-replace step's `close()` wakes the outgoing
        // generation's forward task; it must not queue a second recreate
        // behind the one this call already performed.
        let spurious = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(spurious.is_err(), "the stopped generation must not self-recreate");
    }

    #[tokio::test]
    async fn create_rejects_a_hostname_already_bound_to_another_service() {
        let (mut processor, shared, _rx) = make_processor(FakeCluster { endpoints: vec![] });

        let first = ServiceId::new("web", "default");
        let first_spec = TunnelSpec::new(first, vec!["shared.local".into()], vec![8080]);
        processor.create(first_spec, false, String::new()).await.unwrap();

        let second = ServiceId::new("api", "default");
        let second_spec = TunnelSpec::new(second.clone(), vec!["shared.local".into()], vec![9090]);
        let err = processor.create(second_spec, false, String::new()).await.unwrap_err();
        assert!(matches!(err, Error::Host(_)));

        assert!(shared.get(&second.key()).is_none());
        assert_eq!(shared.all().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_tears_down_every_registered_connection() {
        let (mut processor, shared, _rx) = make_processor(FakeCluster { endpoints: vec![] });

        for name in ["a", "b", "c"] {
            let service = ServiceId::new(name, "default");
            let spec = TunnelSpec::new(service, vec![format!("{name}.local")], vec![8080]);
            processor.create(spec, false, String::new()).await.unwrap();
        }
        assert_eq!(shared.all().len(), 3);

        processor.shutdown().await;
        assert!(shared.all().is_empty());
    }
}
