//! Perception configuration
//!
//! Plain serde structs; the host owns where the file lives. Every field has a
//! default so an empty `{}` is a valid configuration.

use crate::{PerceptionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use vigil_cache::{CacheOptions, CacheTier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// TTL for probes registered without one and not listed under `probes`
    pub default_ttl_secs: u64,
    /// Upper bound on probe invocations running at once
    pub max_in_flight: usize,
    /// LRU bound on cached keys. Scoped probes add one key per scope.
    pub max_entries: Option<usize>,
    /// How long past its TTL a value may still serve as fallback.
    /// `null` means no bound.
    pub max_staleness_secs: Option<u64>,
    pub probe_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// Per-probe overrides, keyed by probe name
    pub probes: BTreeMap<String, ProbeSettings>,
    /// Shell commands exposed as probes, keyed by probe name
    pub commands: BTreeMap<String, String>,
    /// Remote JSON endpoints exposed as probes, keyed by probe name
    pub http: BTreeMap<String, HttpSource>,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            max_in_flight: 4,
            max_entries: Some(500),
            max_staleness_secs: Some(600),
            probe_timeout_ms: 1500,
            query_timeout_ms: 3000,
            probes: BTreeMap::new(),
            commands: BTreeMap::new(),
            http: BTreeMap::new(),
        }
    }
}

/// Overrides for one probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub enabled: Option<bool>,
    pub ttl_secs: Option<u64>,
    /// Named TTL preset, alternative to `ttl_secs`
    pub tier: Option<CacheTier>,
    pub timeout_ms: Option<u64>,
}

/// A remote JSON endpoint. With no `allowed_domains`, only the URL's own
/// host is allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSource {
    pub url: String,
    pub allowed_domains: Vec<String>,
}

impl ProbeSettings {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs
            .map(Duration::from_secs)
            .or_else(|| self.tier.map(CacheTier::ttl))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl PerceptionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        tracing::info!(path = %path.display(), probes = config.probes.len(), "loaded perception config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == 0 {
            return Err(PerceptionError::Config("default_ttl_secs must be positive".into()));
        }
        if self.max_in_flight == 0 {
            return Err(PerceptionError::Config("max_in_flight must be positive".into()));
        }
        if self.max_entries == Some(0) {
            return Err(PerceptionError::Config("max_entries must be positive when set".into()));
        }
        if self.probe_timeout_ms == 0 || self.query_timeout_ms == 0 {
            return Err(PerceptionError::Config("timeouts must be positive".into()));
        }
        for (name, settings) in &self.probes {
            if settings.ttl_secs == Some(0) {
                return Err(PerceptionError::Config(format!("probe '{}': ttl_secs must be positive", name)));
            }
            if settings.ttl_secs.is_some() && settings.tier.is_some() {
                return Err(PerceptionError::Config(format!(
                    "probe '{}': set either ttl_secs or tier, not both",
                    name
                )));
            }
            if settings.timeout_ms == Some(0) {
                return Err(PerceptionError::Config(format!("probe '{}': timeout_ms must be positive", name)));
            }
        }
        for (name, command) in &self.commands {
            if command.trim().is_empty() {
                return Err(PerceptionError::Config(format!("command probe '{}': command is empty", name)));
            }
        }
        for (name, source) in &self.http {
            if source.url.is_empty() {
                return Err(PerceptionError::Config(format!("http probe '{}': url is required", name)));
            }
            if self.commands.contains_key(name) {
                return Err(PerceptionError::Config(format!("probe '{}' is both a command and an http probe", name)));
            }
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness_secs.map(Duration::from_secs)
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            max_entries: self.max_entries,
            max_staleness: self.max_staleness(),
        }
    }

    pub fn settings(&self, probe: &str) -> Option<&ProbeSettings> {
        self.probes.get(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = PerceptionConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PerceptionConfig::default());
        assert_eq!(config.default_ttl(), Duration::from_secs(60));
        assert_eq!(config.max_staleness(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_probe_overrides() {
        let config = PerceptionConfig::from_json_str(
            r#"{
                "max_in_flight": 2,
                "max_staleness_secs": null,
                "probes": {
                    "device": { "tier": "hot" },
                    "weather": { "enabled": false, "ttl_secs": 900, "timeout_ms": 5000 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.max_staleness(), None);
        assert_eq!(config.settings("device").unwrap().ttl(), Some(Duration::from_secs(10)));

        let weather = config.settings("weather").unwrap();
        assert_eq!(weather.enabled, Some(false));
        assert_eq!(weather.ttl(), Some(Duration::from_secs(900)));
        assert_eq!(weather.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"max_in_flight": 0}"#),
            Err(PerceptionError::Config(_))
        ));
        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"probes": {"x": {"ttl_secs": 5, "tier": "cold"}}}"#),
            Err(PerceptionError::Config(_))
        ));
        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"probes": {"x": {"ttl_secs": 0}}}"#),
            Err(PerceptionError::Config(_))
        ));
        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"max_in_flight": "many"}"#),
            Err(PerceptionError::Json(_))
        ));
    }

    #[test]
    fn test_command_and_http_sources() {
        let config = PerceptionConfig::from_json_str(
            r#"{
                "commands": { "uptime": "uptime" },
                "http": { "weather": { "url": "https://api.weather.example/now", "allowed_domains": ["weather.example"] } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.commands["uptime"], "uptime");
        assert_eq!(config.http["weather"].allowed_domains, vec!["weather.example"]);

        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"commands": {"x": "  "}}"#),
            Err(PerceptionError::Config(_))
        ));
        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"http": {"x": {}}}"#),
            Err(PerceptionError::Config(_))
        ));
        assert!(matches!(
            PerceptionConfig::from_json_str(r#"{"commands": {"x": "date"}, "http": {"x": {"url": "http://a.example"}}}"#),
            Err(PerceptionError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_ttl_secs": 30}}"#).unwrap();

        let config = PerceptionConfig::from_path(file.path()).unwrap();
        assert_eq!(config.default_ttl(), Duration::from_secs(30));

        let missing = PerceptionConfig::from_path(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(PerceptionError::Io(_))));
    }
}
