//! Add/remove `(address -> hostnames)` bindings in the system host file,
//! via the `hostsfile` crate's tagged-block writer. `flush` is an
//! explicit, synchronous step the processor calls after every
//! `add`/`remove`; the processor's single-writer discipline already
//! serializes these calls, so there is nothing to batch.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use hostsfile::HostsBuilder;
use tracing::debug;
use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::ports::HostAliasManager;

const HOSTS_TAG: &str = "tunnelctl";

pub struct HostsFileAliasManager {
    entries: Mutex<HashMap<String, IpAddr>>,
}

impl HostsFileAliasManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for HostsFileAliasManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAliasManager for HostsFileAliasManager {
    fn add(&self, addr: IpAddr, hostnames: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().expect("host alias lock poisoned");
        for hostname in hostnames {
            entries.insert(hostname.clone(), addr);
        }
        Ok(())
    }

    fn remove(&self, hostnames: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().expect("host alias lock poisoned");
        for hostname in hostnames {
            entries.remove(hostname);
        }
        Ok(())
    }

    /// Rewrites the whole `tunnelctl`-tagged block in one pass.
    fn flush(&self) -> Result<()> {
        let entries = self.entries.lock().expect("host alias lock poisoned");

        let mut builder = HostsBuilder::new(HOSTS_TAG);
        for (hostname, addr) in entries.iter() {
            builder.add_hostname(*addr, hostname);
        }

        debug!(count = entries.len(), "flushing host file entries");
        builder.write().map_err(|e| Error::Host(e.to_string()))
    }
}
