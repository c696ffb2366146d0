//! The lifecycle: wires the watcher, reconciler, and processor together
//! at startup, and drives an orderly shutdown that drains the
//! processor's current request before tearing down every connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::bounded_dropping;
use crate::models::{
    ConnectionSnapshot,
    Request,
};
use crate::ports::{
    ClusterApi,
    HostAliasManager,
    IpPool,
    PlatformAdapter,
};
use crate::processor::Processor;
use crate::registry::{
    Registry,
    SharedRegistry,
};
use crate::{
    reconciler,
    watcher,
};

/// The request channel blocks its producer once full, rather than
/// dropping — distinct from the reaper channel below.
const REQUEST_CHANNEL_CAPACITY: usize = 1024;

const REAPER_CHANNEL_CAPACITY: usize = 1024;

/// A running controller instance: the request sender callers use to drive
/// `Create`/`Delete`, a read-only view of the registry for status queries,
/// and the handles needed to bring everything down cleanly.
pub struct Worker {
    requests: mpsc::Sender<Request>,
    registry: SharedRegistry,
    cancel: CancellationToken,
    watcher_task: JoinHandle<()>,
    reconciler_task: JoinHandle<()>,
    processor_task: JoinHandle<()>,
}

impl Worker {
    /// Construct the request and reaper channels, spawn the watcher,
    /// reconciler, and processor tasks, and return a handle. Reserving
    /// the canonical loopback address is the `IpPool` implementation's
    /// responsibility at construction time, not the lifecycle's.
    pub fn start(
        cluster: Arc<dyn ClusterApi>, ip_pool: Arc<dyn IpPool>, host_aliases: Arc<dyn HostAliasManager>,
        platform: Arc<dyn PlatformAdapter>,
    ) -> Self {
        let shared = SharedRegistry::new();
        let registry = Registry::new(shared.clone());
        let cancel = CancellationToken::new();

        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = bounded_dropping(REAPER_CHANNEL_CAPACITY);

        let watcher_task = tokio::spawn(watcher::run(cluster.clone(), event_tx, cancel.clone()));
        let reconciler_task = tokio::spawn(reconciler::run(
            shared.clone(),
            event_rx,
            request_tx.clone(),
            cancel.clone(),
        ));

        let processor = Processor::new(
            registry,
            cluster,
            ip_pool,
            host_aliases,
            platform,
            request_tx.clone(),
            cancel.clone(),
        );
        let processor_task = tokio::spawn(processor.run(request_rx));

        Self {
            requests: request_tx,
            registry: shared,
            cancel,
            watcher_task,
            reconciler_task,
            processor_task,
        }
    }

    /// Submit a request, blocking if the processor is behind.
    pub async fn submit(&self, request: Request) -> Result<(), mpsc::error::SendError<Request>> {
        self.requests.send(request).await
    }

    /// A clone-able sender, for callers (e.g. the CLI) that want to hold
    /// their own handle independent of this `Worker`.
    pub fn requests(&self) -> mpsc::Sender<Request> {
        self.requests.clone()
    }

    pub fn status(&self, key: &str) -> Option<ConnectionSnapshot> {
        self.registry.get(key)
    }

    pub fn status_all(&self) -> Vec<ConnectionSnapshot> {
        self.registry.all()
    }

    /// Cancel, then wait for the processor to drain its current request
    /// and tear down every connection, before letting the watcher and
    /// reconciler observe cancellation and exit. Per-connection teardown
    /// errors are logged by the processor and are not surfaced here.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.processor_task.await;
        let _ = self.watcher_task.await;
        let _ = self.reconciler_task.await;
    }
}
