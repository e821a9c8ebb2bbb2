//! Vigil Probes - built-in perception sources
//!
//! None of these are required by the core; a host picks the ones it wants.
//! `register_builtin` wires up the local ones with sensible TTL tiers, and
//! `register_configured` adds the command and HTTP probes named in the
//! configuration.

pub mod command;
pub mod device;
pub mod environment;
pub mod http;
pub mod self_state;

pub use command::{run_command, CommandDenied, CommandPolicy, CommandProbe};
pub use device::{device_probe, DeviceSource};
pub use environment::EnvironmentProbe;
pub use http::{HttpJsonProbe, HttpProbeError};
pub use self_state::{ActivityLog, SelfState, SelfStateProbe};

use anyhow::Context;
use std::sync::Arc;
use vigil_core::{CacheTier, PerceptionManager, ProbeRegistration};

pub const DEVICE: &str = "device";
pub const ENVIRONMENT: &str = "environment";
pub const SELF_STATE: &str = "self";

/// Register the device, environment and self-state probes.
///
/// Host metrics move fast, the calendar barely moves at all.
pub fn register_builtin(manager: &PerceptionManager, activity: ActivityLog) -> vigil_core::Result<()> {
    manager.register_with(ProbeRegistration::new(DEVICE, Arc::new(device_probe(DeviceSource::default()))).tier(CacheTier::Hot))?;
    manager.register_with(ProbeRegistration::new(ENVIRONMENT, Arc::new(EnvironmentProbe::default())).tier(CacheTier::Cold))?;
    manager.register_with(ProbeRegistration::new(SELF_STATE, Arc::new(SelfStateProbe::new(activity))).tier(CacheTier::Warm))?;
    Ok(())
}

/// Register the `commands` and `http` probes from the manager's
/// configuration. Returns how many were registered.
pub fn register_configured(manager: &PerceptionManager) -> anyhow::Result<usize> {
    let config = manager.config();
    let policy = Arc::new(CommandPolicy::default());
    let mut registered = 0;

    for (name, command) in &config.commands {
        let probe = CommandProbe::new(name.as_str(), command.as_str(), Arc::clone(&policy))
            .with_context(|| format!("command probe '{}'", name))?;
        manager.register_with(ProbeRegistration::new(name.as_str(), Arc::new(probe)))?;
        registered += 1;
    }

    for (name, source) in &config.http {
        let allowed: Vec<String> = if source.allowed_domains.is_empty() {
            reqwest::Url::parse(&source.url)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
                .into_iter()
                .collect()
        } else {
            source.allowed_domains.clone()
        };
        let probe = HttpJsonProbe::new(name.as_str(), &source.url, &allowed)
            .with_context(|| format!("http probe '{}'", name))?;
        manager.register_with(ProbeRegistration::new(name.as_str(), Arc::new(probe)).tier(CacheTier::Cold))?;
        registered += 1;
    }

    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{overall_health, PerceptionConfig, QueryContext, OVERALL_HEALTH};

    #[tokio::test]
    async fn test_builtin_probes_feed_overall_health() {
        let manager = PerceptionManager::new(PerceptionConfig::default())
            .unwrap()
            .with_derived(overall_health(DEVICE, SELF_STATE));
        register_builtin(&manager, ActivityLog::new()).unwrap();

        let keys: Vec<_> = manager.probes().into_iter().map(|p| p.key.to_string()).collect();
        assert_eq!(keys, vec!["device", "environment", "self"]);

        let snapshot = manager.query([ENVIRONMENT, SELF_STATE], &QueryContext::new()).await.unwrap();
        assert!(snapshot.is_fresh(ENVIRONMENT));
        assert!(snapshot.is_fresh(SELF_STATE));
        // Device was not queried
        assert!(snapshot.derived(OVERALL_HEALTH).is_none());
    }

    #[tokio::test]
    async fn test_configured_command_and_http_probes() {
        let config = PerceptionConfig::from_json_str(
            r#"{
                "commands": { "greeting": "echo hello" },
                "http": { "weather": { "url": "http://127.0.0.1:9/now" } },
                "probes": { "greeting": { "tier": "hot" } }
            }"#,
        )
        .unwrap();
        let manager = PerceptionManager::new(config).unwrap();
        assert_eq!(register_configured(&manager).unwrap(), 2);

        let probes = manager.probes();
        let keys: Vec<_> = probes.iter().map(|p| p.key.to_string()).collect();
        assert_eq!(keys, vec!["greeting", "weather"]);
        assert_eq!(probes[0].ttl_secs, 10.0);
        assert_eq!(probes[1].ttl_secs, 300.0);

        let snapshot = manager.query(["greeting"], &QueryContext::new()).await.unwrap();
        assert_eq!(snapshot.value("greeting").unwrap().data["output"], "hello");
    }

    #[test]
    fn test_configured_command_must_pass_policy() {
        let config = PerceptionConfig::from_json_str(r#"{"commands": {"wipe": "rm -rf /"}}"#).unwrap();
        let manager = PerceptionManager::new(config).unwrap();
        let err = register_configured(&manager).unwrap_err();
        assert!(format!("{:#}", err).contains("Command not in allowlist: rm"));
        assert!(manager.probes().is_empty());
    }
}
