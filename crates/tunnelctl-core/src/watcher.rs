use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
};

use crate::channel::DroppingSender;
use crate::ports::{
    ClusterApi,
    EndpointsObject,
};

/// Periodic resync interval, long enough to avoid hammering the cluster
/// API but short enough to recover from a missed or silently dropped
/// watch event.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// A passive producer: subscribes to the cluster's endpoints across all
/// namespaces and pushes every update onto the reaper channel,
/// re-establishing the watch on error, stream end, or resync interval.
pub async fn run(
    cluster: Arc<dyn ClusterApi>, sender: DroppingSender<EndpointsObject>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!("endpoint watcher observed cancellation, stopping");
            return;
        }

        let stream = match cluster.watch_endpoints().await {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to open endpoints watch, retrying after resync interval");
                if wait_or_cancel(&cancel).await {
                    return;
                }
                continue;
            }
        };

        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("endpoint watcher observed cancellation, stopping");
                    return;
                }
                item = stream.next() => {
                    match item {
                        Some(event) => sender.send(event),
                        None => {
                            debug!("endpoints watch stream ended, resyncing");
                            break;
                        }
                    }
                }
            }
        }

        if wait_or_cancel(&cancel).await {
            return;
        }
    }
}

/// Waits for the resync interval, returning `true` if cancellation fired
/// first.
async fn wait_or_cancel(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(RESYNC_INTERVAL) => false,
    }
}
