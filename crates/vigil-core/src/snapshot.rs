//! The merged view handed back to callers

use crate::probe::{ProbeFailure, ProbeKey, ProbeOutput, ProbeResult};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// One probe's contribution to a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub result: ProbeResult,
    /// False for last-known-good values and for failures
    pub fresh: bool,
    #[serde(rename = "age_secs", serialize_with = "serialize_secs")]
    pub age: Option<Duration>,
    pub produced_at: Option<DateTime<Utc>>,
}

fn serialize_secs<S: Serializer>(age: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match age {
        Some(age) => serializer.serialize_some(&age.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

impl SnapshotEntry {
    pub fn value(output: ProbeOutput, fresh: bool, age: Duration, produced_at: DateTime<Utc>) -> Self {
        Self {
            result: ProbeResult::Value(output),
            fresh,
            age: Some(age),
            produced_at: Some(produced_at),
        }
    }

    pub fn failure(failure: ProbeFailure) -> Self {
        Self {
            result: ProbeResult::Failure(failure),
            fresh: false,
            age: None,
            produced_at: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        !self.fresh && self.result.value().is_some()
    }
}

/// Result of one query.
///
/// Maps are ordered so two snapshots built from the same results serialize
/// identically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub query_id: Uuid,
    pub scope: Option<String>,
    pub taken_at: DateTime<Utc>,
    pub entries: BTreeMap<ProbeKey, SnapshotEntry>,
    pub derived: BTreeMap<String, Value>,
    /// Requested keys skipped because they are disabled
    pub disabled: BTreeSet<ProbeKey>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    /// The payload for `key`, fresh or stale
    pub fn value(&self, key: &str) -> Option<&ProbeOutput> {
        self.get(key).and_then(|entry| entry.result.value())
    }

    pub fn is_fresh(&self, key: &str) -> bool {
        self.get(key).map_or(false, |entry| entry.fresh)
    }

    pub fn derived(&self, name: &str) -> Option<&Value> {
        self.derived.get(name)
    }

    /// Keys that produced no value at all
    pub fn failures(&self) -> impl Iterator<Item = (&ProbeKey, &ProbeFailure)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.result.failure().map(|failure| (key, failure)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> Snapshot {
        let mut entries = BTreeMap::new();
        entries.insert(
            ProbeKey::from("cpu_load"),
            SnapshotEntry::value(
                ProbeOutput::new("device", json!({"load": 0.4})),
                true,
                Duration::from_millis(1500),
                Utc::now(),
            ),
        );
        entries.insert(ProbeKey::from("weather"), SnapshotEntry::failure(ProbeFailure::Timeout));
        Snapshot {
            query_id: Uuid::new_v4(),
            scope: None,
            taken_at: Utc::now(),
            entries,
            derived: BTreeMap::new(),
            disabled: BTreeSet::new(),
        }
    }

    #[test]
    fn test_accessors() {
        let snapshot = snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.is_fresh("cpu_load"));
        assert!(!snapshot.is_fresh("weather"));
        assert_eq!(snapshot.value("cpu_load").unwrap().number("load"), Some(0.4));
        assert!(snapshot.value("weather").is_none());

        let failures: Vec<_> = snapshot.failures().map(|(key, _)| key.as_str()).collect();
        assert_eq!(failures, vec!["weather"]);
    }

    #[test]
    fn test_entry_serialization() {
        let snapshot = snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["entries"]["cpu_load"]["age_secs"], json!(1.5));
        assert_eq!(json["entries"]["cpu_load"]["result"]["value"]["kind"], json!("device"));
        assert_eq!(json["entries"]["weather"]["result"], json!({"failure": "timeout"}));
        assert_eq!(json["entries"]["weather"]["age_secs"], Value::Null);
    }

    #[test]
    fn test_stale_entry() {
        let entry = SnapshotEntry::value(ProbeOutput::new("x", json!(1)), false, Duration::ZERO, Utc::now());
        assert!(entry.is_stale());
        assert!(!SnapshotEntry::failure(ProbeFailure::Timeout).is_stale());
    }
}
