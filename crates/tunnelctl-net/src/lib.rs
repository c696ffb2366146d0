//! Concrete adapters for the trait boundaries `tunnelctl-core` leaves
//! abstract: a loopback `IpPool`, a host-file-backed `HostAliasManager`,
//! and a per-OS `PlatformAdapter`.

mod host_aliases;
mod ip_pool;
mod platform;

pub use host_aliases::HostsFileAliasManager;
pub use ip_pool::LoopbackPool;
pub use platform::current_platform_adapter;
