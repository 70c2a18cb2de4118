//! Ambient device facts (memory, hardware identifier)

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::warn;

/// Raw readings from the operating system
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceFacts {
    pub physical_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub hardware_id: String,
}

/// Source of device facts. Implemented by [`SystemProbe`] for the running
/// host and by [`DeviceFacts`] itself for fixed readings.
pub trait DeviceProbe: Send + Sync {
    fn facts(&self) -> DeviceFacts;
}

impl DeviceProbe for DeviceFacts {
    fn facts(&self) -> DeviceFacts {
        self.clone()
    }
}

/// Reads facts from the host OS. Memory comes from `sysinfo` on every
/// platform it supports; the hardware id is the machine model where the OS
/// exposes one, the CPU architecture otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn facts(&self) -> DeviceFacts {
        let (physical, available) = memory();
        if physical == 0 {
            warn!("Could not read physical memory on this platform");
        }

        DeviceFacts {
            physical_memory_bytes: physical,
            available_memory_bytes: available,
            hardware_id: hardware_model().unwrap_or_else(|| std::env::consts::ARCH.to_string()),
        }
    }
}

/// `(total, available)` in bytes.
fn memory() -> (u64, u64) {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    (sys.total_memory(), sys.available_memory())
}

#[cfg(target_os = "linux")]
fn hardware_model() -> Option<String> {
    let name = std::fs::read_to_string("/sys/devices/virtual/dmi/id/product_name").ok()?;
    non_empty(&name)
}

#[cfg(target_os = "macos")]
fn hardware_model() -> Option<String> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.model"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    non_empty(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn hardware_model() -> Option<String> {
    None
}

#[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(dead_code))]
fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
