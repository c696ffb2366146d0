use std::net::IpAddr;
use std::process::Command;

use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::ports::PlatformAdapter;

/// Windows's loopback adapter needs each address added via `netsh`.
pub struct WindowsPlatformAdapter;

impl PlatformAdapter for WindowsPlatformAdapter {
    fn alias_up(&self, addr: IpAddr) -> Result<()> {
        run(&["interface", "ipv4", "add", "address", "Loopback", &addr.to_string(), "255.0.0.0"])
    }

    fn alias_down(&self, addr: IpAddr) -> Result<()> {
        run(&["interface", "ipv4", "delete", "address", "Loopback", &addr.to_string()])
    }
}

fn run(args: &[&str]) -> Result<()> {
    let output = Command::new("netsh")
        .args(args)
        .output()
        .map_err(|e| Error::Platform(format!("failed to run netsh: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Platform(format!("netsh {}: {stderr}", args.join(" "))));
    }
    Ok(())
}
