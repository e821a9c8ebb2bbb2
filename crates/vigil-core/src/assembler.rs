//! Snapshot assembly and derived fields
//!
//! A derived field is a pure function over several probes' values, e.g. an
//! overall health label computed from device and self-state readings. It is
//! only computed when every input it declares has a value in the snapshot.

use crate::probe::{ProbeKey, ProbeOutput};
use crate::snapshot::{Snapshot, SnapshotEntry};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

type ComputeFn = dyn Fn(&DerivedInputs<'_>) -> Option<Value> + Send + Sync;

/// Values a derived field's inputs resolved to
pub struct DerivedInputs<'a> {
    values: BTreeMap<&'a str, &'a ProbeOutput>,
}

impl<'a> DerivedInputs<'a> {
    pub fn get(&self, key: &str) -> Option<&'a ProbeOutput> {
        self.values.get(key).copied()
    }

    pub fn number(&self, key: &str, field: &str) -> Option<f64> {
        self.get(key).and_then(|output| output.number(field))
    }
}

/// A named value computed from several probe results
#[derive(Clone)]
pub struct DerivedField {
    pub name: String,
    pub inputs: Vec<ProbeKey>,
    compute: Arc<ComputeFn>,
}

impl DerivedField {
    pub fn new<F>(name: impl Into<String>, inputs: impl IntoIterator<Item = impl Into<ProbeKey>>, compute: F) -> Self
    where
        F: Fn(&DerivedInputs<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            compute: Arc::new(compute),
        }
    }

    fn evaluate(&self, entries: &BTreeMap<ProbeKey, SnapshotEntry>) -> Option<Value> {
        let mut values = BTreeMap::new();
        for key in &self.inputs {
            let output = entries.get(key)?.result.value()?;
            values.insert(key.as_str(), output);
        }
        (self.compute)(&DerivedInputs { values })
    }
}

impl std::fmt::Debug for DerivedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedField")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// Identity of the query a snapshot answers
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub query_id: Uuid,
    pub scope: Option<String>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotAssembler {
    derived: Vec<DerivedField>,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_derived(mut self, field: DerivedField) -> Self {
        self.add(field);
        self
    }

    /// Add a derived field, replacing any with the same name
    pub fn add(&mut self, field: DerivedField) {
        self.derived.retain(|existing| existing.name != field.name);
        self.derived.push(field);
    }

    pub fn derived_names(&self) -> impl Iterator<Item = &str> {
        self.derived.iter().map(|field| field.name.as_str())
    }

    /// Merge per-probe results into a snapshot.
    ///
    /// The order of `results` does not matter.
    pub fn assemble(
        &self,
        meta: SnapshotMeta,
        results: impl IntoIterator<Item = (ProbeKey, SnapshotEntry)>,
        disabled: BTreeSet<ProbeKey>,
    ) -> Snapshot {
        let entries: BTreeMap<_, _> = results.into_iter().collect();

        let mut derived = BTreeMap::new();
        for field in &self.derived {
            match field.evaluate(&entries) {
                Some(value) => {
                    derived.insert(field.name.clone(), value);
                }
                None => tracing::debug!(field = %field.name, "derived field omitted, inputs unavailable"),
            }
        }

        Snapshot {
            query_id: meta.query_id,
            scope: meta.scope,
            taken_at: meta.taken_at,
            entries,
            derived,
            disabled,
        }
    }
}
