//! Vigil Core - Perception aggregation runtime
//!
//! Owns a registry of independent probes, memoizes each probe's output in a
//! TTL cache, and merges whatever is available into one snapshot per query.
//! A failing or slow probe degrades its own field, never the whole query.

pub mod assembler;
pub mod config;
pub mod context;
pub mod health;
pub mod history;
pub mod manager;
pub mod probe;
pub mod registry;
pub mod snapshot;

pub use assembler::{DerivedField, DerivedInputs, SnapshotAssembler, SnapshotMeta};
pub use config::{HttpSource, PerceptionConfig, ProbeSettings};
pub use context::{ProbeContext, QueryContext};
pub use health::{overall_health, HealthLevel, OVERALL_HEALTH};
pub use history::{Grade, HealthScore, HistoryPoint, HISTORY_POINTS};
pub use manager::{ManagerStats, PerceptionManager, ProbeRegistration};
pub use probe::{BlockingProbe, FnProbe, Probe, ProbeAdapter, ProbeFailure, ProbeKey, ProbeOutput, ProbeResult};
pub use registry::ProbeInfo;
pub use snapshot::{Snapshot, SnapshotEntry};

pub use vigil_cache::{CacheStats, CacheTier, Clock, ManualClock, SystemClock};

/// Core errors
///
/// Only structurally invalid requests end up here. Probe failures are
/// absorbed into the snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PerceptionError {
    #[error("Probe not registered: {0}")]
    NotRegistered(ProbeKey),

    #[error("Invalid probe key '{0}': must be non-empty and must not contain '@'")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PerceptionError>;
