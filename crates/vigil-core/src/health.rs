//! Overall health label
//!
//! Combines the host's resource pressure with the agent's own energy level
//! into a single `healthy | warning | critical` label.

use crate::assembler::{DerivedField, DerivedInputs};
use crate::probe::ProbeKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the built-in derived field
pub const OVERALL_HEALTH: &str = "overall_health";

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        }
    }

    /// Host pressure from usage percentages
    pub fn from_device(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        if cpu_percent > 90.0 || memory_percent > 90.0 || disk_percent > 95.0 {
            HealthLevel::Critical
        } else if cpu_percent > 70.0 || memory_percent > 75.0 || disk_percent > 85.0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    /// Agent condition from its 0-100 energy level
    pub fn from_energy(energy_level: f64) -> Self {
        if energy_level < 20.0 {
            HealthLevel::Critical
        } else if energy_level < 50.0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn device_level(inputs: &DerivedInputs<'_>, key: &str) -> Option<HealthLevel> {
    Some(HealthLevel::from_device(
        inputs.number(key, "cpu_percent")?,
        inputs.number(key, "memory_percent")?,
        inputs.number(key, "disk_percent")?,
    ))
}

/// `overall_health` over a device probe and a self-state probe.
///
/// The device payload needs `cpu_percent`, `memory_percent` and
/// `disk_percent`; the self-state payload needs `energy_level`. The worse of
/// the two labels wins.
pub fn overall_health(device: impl Into<ProbeKey>, self_state: impl Into<ProbeKey>) -> DerivedField {
    let device = device.into();
    let self_state = self_state.into();
    let inputs = vec![device.clone(), self_state.clone()];
    DerivedField::new(OVERALL_HEALTH, inputs, move |inputs| {
        let host = device_level(inputs, device.as_str())?;
        let agent = HealthLevel::from_energy(inputs.number(self_state.as_str(), "energy_level")?);
        Some(Value::from(host.max(agent).as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{SnapshotAssembler, SnapshotMeta};
    use crate::probe::{ProbeFailure, ProbeOutput};
    use crate::snapshot::SnapshotEntry;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use uuid::Uuid;

    fn entry(kind: &str, data: Value) -> SnapshotEntry {
        SnapshotEntry::value(ProbeOutput::new(kind, data), true, Duration::ZERO, Utc::now())
    }

    fn assess(device: SnapshotEntry, self_state: SnapshotEntry) -> Option<Value> {
        let assembler = SnapshotAssembler::new().with_derived(overall_health("device", "self"));
        let meta = SnapshotMeta {
            query_id: Uuid::new_v4(),
            scope: None,
            taken_at: Utc::now(),
        };
        let snapshot = assembler.assemble(
            meta,
            vec![(ProbeKey::from("device"), device), (ProbeKey::from("self"), self_state)],
            BTreeSet::new(),
        );
        snapshot.derived(OVERALL_HEALTH).cloned()
    }

    #[test]
    fn test_device_thresholds() {
        assert_eq!(HealthLevel::from_device(10.0, 10.0, 10.0), HealthLevel::Healthy);
        assert_eq!(HealthLevel::from_device(71.0, 10.0, 10.0), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_device(10.0, 10.0, 86.0), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_device(10.0, 91.0, 10.0), HealthLevel::Critical);
        assert_eq!(HealthLevel::from_device(10.0, 10.0, 96.0), HealthLevel::Critical);
    }

    #[test]
    fn test_energy_thresholds() {
        assert_eq!(HealthLevel::from_energy(80.0), HealthLevel::Healthy);
        assert_eq!(HealthLevel::from_energy(49.9), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_energy(5.0), HealthLevel::Critical);
    }

    #[test]
    fn test_worse_label_wins() {
        let device = entry("device", json!({"cpu_percent": 20.0, "memory_percent": 30.0, "disk_percent": 40.0}));
        let tired = entry("self", json!({"energy_level": 35.0}));
        assert_eq!(assess(device, tired), Some(json!("warning")));

        let hot = entry("device", json!({"cpu_percent": 95.0, "memory_percent": 30.0, "disk_percent": 40.0}));
        let rested = entry("self", json!({"energy_level": 90.0}));
        assert_eq!(assess(hot, rested), Some(json!("critical")));
    }

    #[test]
    fn test_omitted_without_inputs() {
        let device = entry("device", json!({"cpu_percent": 20.0, "memory_percent": 30.0, "disk_percent": 40.0}));
        assert_eq!(assess(device, SnapshotEntry::failure(ProbeFailure::Timeout)), None);

        // Payload present but missing a field
        let partial = entry("device", json!({"cpu_percent": 20.0}));
        let rested = entry("self", json!({"energy_level": 90.0}));
        assert_eq!(assess(partial, rested), None);
    }
}
