//! Platform alias detection and plumbing. Detected once, by OS identity,
//! at the call site that picks an implementation; the processor never
//! branches on OS strings itself, only on the `PlatformAdapter` trait
//! object it is handed at start-up.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod noop;
#[cfg(target_os = "windows")]
mod windows;

use std::sync::Arc;

use tunnelctl_core::ports::PlatformAdapter;

/// Picks the adapter for the running OS: "per-address alias" platforms
/// get the real plumbing, "full-range loopback" platforms get a no-op.
pub fn current_platform_adapter() -> Arc<dyn PlatformAdapter> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxPlatformAdapter)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::MacosPlatformAdapter)
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(windows::WindowsPlatformAdapter)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Arc::new(noop::NoopPlatformAdapter)
    }
}
