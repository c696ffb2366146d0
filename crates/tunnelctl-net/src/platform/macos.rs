use std::net::IpAddr;
use std::process::Command;

use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::ports::PlatformAdapter;

/// macOS's `lo0` does not route the whole pool range; each address needs
/// an explicit alias.
pub struct MacosPlatformAdapter;

impl PlatformAdapter for MacosPlatformAdapter {
    fn alias_up(&self, addr: IpAddr) -> Result<()> {
        run(&["lo0", "alias", &addr.to_string()])
    }

    fn alias_down(&self, addr: IpAddr) -> Result<()> {
        run(&["lo0", "-alias", &addr.to_string()])
    }
}

fn run(args: &[&str]) -> Result<()> {
    let output = Command::new("/sbin/ifconfig")
        .args(args)
        .output()
        .map_err(|e| Error::Platform(format!("failed to run ifconfig: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Platform(format!("ifconfig {}: {stderr}", args.join(" "))));
    }
    Ok(())
}
