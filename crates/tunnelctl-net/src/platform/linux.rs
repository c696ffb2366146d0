use std::net::IpAddr;
use std::process::Command;

use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::ports::PlatformAdapter;

/// Linux routes the whole `127.0.0.0/8` range to `lo` by default, but the
/// addresses still need an explicit `/32` route added before anything can
/// bind them.
pub struct LinuxPlatformAdapter;

impl PlatformAdapter for LinuxPlatformAdapter {
    fn alias_up(&self, addr: IpAddr) -> Result<()> {
        run("ip", &["addr", "add", &format!("{addr}/32"), "dev", "lo"])
    }

    fn alias_down(&self, addr: IpAddr) -> Result<()> {
        run("ip", &["addr", "del", &format!("{addr}/32"), "dev", "lo"])
    }
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Platform(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Platform(format!("{program} {}: {stderr}", args.join(" "))));
    }
    Ok(())
}
