use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{
    Arc,
    RwLock,
};

use crate::models::{
    ConnectionSnapshot,
    PodIdentity,
    ServiceId,
    TunnelStatus,
};
use crate::ports::Forwarder;

/// The live record for one managed service. Only the processor ever holds
/// a `&mut Connection`; everyone else sees a `ConnectionSnapshot` published
/// through `SharedRegistry`.
pub(crate) struct Connection {
    pub service: ServiceId,
    pub pod: Option<PodIdentity>,
    pub ip: IpAddr,
    pub hostnames: Vec<String>,
    pub ports: Vec<u16>,
    pub status: TunnelStatus,
    pub status_reason: Option<String>,
    /// Shared with the spawned forward task so the processor's stop
    /// procedure can call `close` without owning `forward_ports`'s future.
    pub handle: Option<Arc<dyn Forwarder>>,
    /// Set by the processor before it ever calls `handle.close()` on this
    /// connection (recreate's teardown of the outgoing connection, or
    /// `Delete`). The connection's own spawned forward task checks this
    /// after `forward_ports` returns, so a deliberate teardown never
    /// produces a self-recreate for the generation that was just stopped —
    /// only an *unrequested* exit (the tunnel dying on its own) does.
    pub stopping: Arc<AtomicBool>,
}

impl Connection {
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            service: self.service.clone(),
            pod: self.pod.clone(),
            ip: self.ip,
            hostnames: self.hostnames.clone(),
            ports: self.ports.clone(),
            status: self.status,
            status_reason: self.status_reason.clone(),
        }
    }
}

/// The cheaply-cloneable, read-only handle status inspectors hold — a
/// snapshot of each connection, published only by the processor.
#[derive(Clone, Default)]
pub struct SharedRegistry {
    snapshots: Arc<RwLock<HashMap<String, ConnectionSnapshot>>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ConnectionSnapshot> {
        self.snapshots
            .read()
            .expect("shared registry lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn all(&self) -> Vec<ConnectionSnapshot> {
        self.snapshots
            .read()
            .expect("shared registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn publish(&self, key: &str, snapshot: ConnectionSnapshot) {
        self.snapshots
            .write()
            .expect("shared registry lock poisoned")
            .insert(key.to_string(), snapshot);
    }

    pub(crate) fn unpublish(&self, key: &str) {
        self.snapshots
            .write()
            .expect("shared registry lock poisoned")
            .remove(key);
    }
}

/// `ServiceId.Key() -> Connection`. Owned exclusively by the processor
/// task; the single-writer discipline is enforced by construction (no
/// other type in this crate can obtain a `&mut Registry`) rather than by a
/// lock around this map.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Connection>,
    shared: SharedRegistry,
}

impl Registry {
    pub fn new(shared: SharedRegistry) -> Self {
        Self {
            entries: HashMap::new(),
            shared,
        }
    }

    pub fn shared(&self) -> SharedRegistry {
        self.shared.clone()
    }

    pub fn get(&self, key: &str) -> Option<&Connection> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Connection> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite the connection and publish its snapshot. At
    /// most one `Connection` exists per `ServiceId` at any instant.
    pub fn publish(&mut self, key: String, connection: Connection) {
        let snapshot = connection.snapshot();
        self.shared.publish(&key, snapshot);
        self.entries.insert(key, connection);
    }

    /// Publish a status change on an already-registered connection without
    /// touching anything else.
    pub fn publish_status(&mut self, key: &str) {
        if let Some(conn) = self.entries.get(key) {
            self.shared.publish(key, conn.snapshot());
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Connection> {
        self.shared.unpublish(key);
        self.entries.remove(key)
    }

    /// Remove the connection from the live map without touching its
    /// published snapshot: a recreate keeps the outgoing connection's
    /// `Recreating` snapshot visible to status inspectors for the whole
    /// stop-then-rebuild window, rather than unpublishing it and leaving
    /// the service with no registry entry in between.
    pub fn take_for_replacement(&mut self, key: &str) -> Option<Connection> {
        self.entries.remove(key)
    }

    /// The first hostname in `hostnames` already bound to some *other*
    /// service's connection, if any, paired with that service's key.
    /// Duplicate hostname bindings across distinct services are rejected
    /// so host-file cleanup by hostname stays unambiguous: tearing down
    /// one service's connection must never remove a hostname another,
    /// still-live connection owns.
    pub fn hostname_conflict(&self, hostnames: &[String]) -> Option<(String, String)> {
        for (key, conn) in &self.entries {
            for hostname in hostnames {
                if conn.hostnames.contains(hostname) {
                    return Some((hostname.clone(), key.clone()));
                }
            }
        }
        None
    }

    /// Unpublish a snapshot left over from a `take_for_replacement` whose
    /// replacement never arrived (the recreate failed).
    pub fn unpublish(&mut self, key: &str) {
        self.shared.unpublish(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(service: ServiceId) -> Connection {
        Connection {
            service,
            pod: None,
            ip: "127.0.0.2".parse().unwrap(),
            hostnames: vec!["web.local".into()],
            ports: vec![8080],
            status: TunnelStatus::Waiting,
            status_reason: Some("No endpoints were found.".into()),
            handle: None,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn publish_and_remove_round_trip_through_shared_snapshots() {
        let shared = SharedRegistry::new();
        let mut registry = Registry::new(shared.clone());
        let service = ServiceId::new("web", "default");

        registry.publish(service.key(), conn(service.clone()));
        assert!(registry.contains(&service.key()));
        assert_eq!(shared.all().len(), 1);
        assert_eq!(shared.get(&service.key()).unwrap().status, TunnelStatus::Waiting);

        registry.remove(&service.key());
        assert!(!registry.contains(&service.key()));
        assert!(shared.get(&service.key()).is_none());
        assert!(shared.all().is_empty());
    }

    #[test]
    fn take_for_replacement_keeps_the_published_snapshot_visible() {
        let shared = SharedRegistry::new();
        let mut registry = Registry::new(shared.clone());
        let service = ServiceId::new("web", "default");
        registry.publish(service.key(), conn(service.clone()));

        if let Some(c) = registry.get_mut(&service.key()) {
            c.status = TunnelStatus::Recreating;
            c.status_reason = Some("endpoints 'default/web-1' was removed".into());
        }
        registry.publish_status(&service.key());

        // Taking the connection out for replacement must not erase the
        // `Recreating` snapshot a status inspector can still see.
        let taken = registry.take_for_replacement(&service.key());
        assert!(taken.is_some());
        assert!(!registry.contains(&service.key()));
        let snap = shared.get(&service.key()).expect("Recreating snapshot should remain published");
        assert_eq!(snap.status, TunnelStatus::Recreating);

        // Only an explicit unpublish (the failed-recreate path) removes it.
        registry.unpublish(&service.key());
        assert!(shared.get(&service.key()).is_none());
    }

    #[test]
    fn publish_status_updates_snapshot_in_place() {
        let shared = SharedRegistry::new();
        let mut registry = Registry::new(shared.clone());
        let service = ServiceId::new("web", "default");
        registry.publish(service.key(), conn(service.clone()));

        if let Some(c) = registry.get_mut(&service.key()) {
            c.status = TunnelStatus::Recreating;
            c.status_reason = Some("endpoints 'default/web-1' was removed".into());
        }
        registry.publish_status(&service.key());

        let snap = shared.get(&service.key()).unwrap();
        assert_eq!(snap.status, TunnelStatus::Recreating);
        assert_eq!(
            snap.status_reason.as_deref(),
            Some("endpoints 'default/web-1' was removed")
        );
    }

    #[test]
    fn hostname_conflict_detects_a_hostname_owned_by_another_service() {
        let shared = SharedRegistry::new();
        let mut registry = Registry::new(shared.clone());
        let web = ServiceId::new("web", "default");
        registry.publish(web.key(), conn(web.clone()));

        let conflict = registry
            .hostname_conflict(&["web.local".to_string()])
            .expect("web.local is already bound to 'web'");
        assert_eq!(conflict, ("web.local".to_string(), web.key()));

        assert!(registry.hostname_conflict(&["other.local".to_string()]).is_none());
    }
}
