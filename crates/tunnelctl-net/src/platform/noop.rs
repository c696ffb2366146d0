use std::net::IpAddr;

use tunnelctl_core::error::Result;
use tunnelctl_core::ports::PlatformAdapter;

/// "Full-range loopback" platforms: the loopback interface already routes
/// the whole pool range, so both operations are no-ops.
pub struct NoopPlatformAdapter;

impl PlatformAdapter for NoopPlatformAdapter {
    fn alias_up(&self, _addr: IpAddr) -> Result<()> {
        Ok(())
    }

    fn alias_down(&self, _addr: IpAddr) -> Result<()> {
        Ok(())
    }
}
