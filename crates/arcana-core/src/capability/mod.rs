//! Device capability gate
//!
//! Decides whether local inference may be attempted on this device. The gate
//! is a pure function of a [`CapabilitySnapshot`]; the snapshot itself is
//! rebuilt from a [`DeviceProbe`] on every check and never cached.

mod probe;

use serde::Serialize;
use std::collections::HashSet;

use crate::config::CapabilityConfig;

pub use probe::{DeviceFacts, DeviceProbe, SystemProbe};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time view of the device's inference-relevant facts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilitySnapshot {
    pub physical_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub hardware_id: String,
    /// Physical memory reaches the configured floor
    pub meets_minimum_requirement: bool,
}

/// Outcome of [`CapabilityGate::evaluate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityVerdict {
    pub capable: bool,
    /// User-facing explanation, present only when not capable
    pub reason: Option<String>,
}

impl CapabilityVerdict {
    fn capable() -> Self {
        Self {
            capable: true,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            capable: false,
            reason: Some(reason),
        }
    }
}

/// Allow-list plus memory-floor predicate
#[derive(Debug, Clone)]
pub struct CapabilityGate {
    allowed_hardware: HashSet<String>,
    min_physical_memory_bytes: u64,
}

impl CapabilityGate {
    pub fn new(config: &CapabilityConfig) -> Self {
        Self {
            allowed_hardware: config.allowed_hardware.iter().cloned().collect(),
            min_physical_memory_bytes: config.min_physical_memory_bytes,
        }
    }

    /// Build a fresh snapshot from the probe's current readings.
    pub fn snapshot(&self, probe: &dyn DeviceProbe) -> CapabilitySnapshot {
        let facts = probe.facts();
        CapabilitySnapshot {
            meets_minimum_requirement: facts.physical_memory_bytes
                >= self.min_physical_memory_bytes,
            physical_memory_bytes: facts.physical_memory_bytes,
            available_memory_bytes: facts.available_memory_bytes,
            hardware_id: facts.hardware_id,
        }
    }

    /// Capable when the hardware is allow-listed, or, for hardware the list
    /// does not know yet, when physical memory reaches the floor.
    pub fn evaluate(&self, snapshot: &CapabilitySnapshot) -> CapabilityVerdict {
        if self.allowed_hardware.contains(&snapshot.hardware_id) {
            return CapabilityVerdict::capable();
        }
        if snapshot.physical_memory_bytes >= self.min_physical_memory_bytes {
            return CapabilityVerdict::capable();
        }

        CapabilityVerdict::rejected(format!(
            "On-device readings need a newer device: {} has {:.1} GB of memory, {:.1} GB required",
            display_hardware(&snapshot.hardware_id),
            snapshot.physical_memory_bytes as f64 / GIB,
            self.min_physical_memory_bytes as f64 / GIB,
        ))
    }
}

fn display_hardware(hardware_id: &str) -> &str {
    if hardware_id.is_empty() {
        "this device"
    } else {
        hardware_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn gate() -> CapabilityGate {
        CapabilityGate::new(&CapabilityConfig {
            allowed_hardware: vec!["iPhone16,2".to_string()],
            min_physical_memory_bytes: 8 * GB,
        })
    }

    fn facts(hardware_id: &str, physical: u64) -> DeviceFacts {
        DeviceFacts {
            physical_memory_bytes: physical,
            available_memory_bytes: physical / 2,
            hardware_id: hardware_id.to_string(),
        }
    }

    #[test]
    fn test_allow_listed_hardware_is_capable_regardless_of_memory() {
        let gate = gate();
        let snapshot = gate.snapshot(&facts("iPhone16,2", 6 * GB));
        assert!(!snapshot.meets_minimum_requirement);

        let verdict = gate.evaluate(&snapshot);
        assert!(verdict.capable);
        assert!(verdict.reason.is_none());
    }

    #[test]
    fn test_unlisted_hardware_with_enough_memory_is_capable() {
        let gate = gate();
        let snapshot = gate.snapshot(&facts("iPhone99,1", 8 * GB));
        assert!(snapshot.meets_minimum_requirement);
        assert!(gate.evaluate(&snapshot).capable);
    }

    #[test]
    fn test_unlisted_hardware_below_floor_is_rejected_with_reason() {
        let gate = gate();
        let snapshot = gate.snapshot(&facts("iPhone14,5", 4 * GB));
        let verdict = gate.evaluate(&snapshot);
        assert!(!verdict.capable);
        let reason = verdict.reason.expect("reason");
        assert!(reason.contains("iPhone14,5"));
        assert!(reason.contains("8.0 GB required"));
    }

    #[test]
    fn test_unknown_hardware_reason_is_readable() {
        let gate = gate();
        let verdict = gate.evaluate(&gate.snapshot(&facts("", GB)));
        assert!(verdict.reason.expect("reason").contains("this device"));
    }
}
