//! Vigil CLI - perception snapshots from the command line
//!
//! Usage:
//!   vigil snapshot  - Take one snapshot of every (or some) probes
//!   vigil watch     - Print a snapshot every few seconds
//!   vigil probes    - List registered probes
//!   vigil stats     - Take a snapshot and show cache statistics

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{overall_health, PerceptionConfig, PerceptionManager, ProbeResult, QueryContext, Snapshot};
use vigil_probes::{register_builtin, register_configured, ActivityLog, DEVICE, SELF_STATE};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Perception aggregation for agent runtimes", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.vigil/config.json if it exists)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take one snapshot
    Snapshot {
        /// Comma-separated probe names (default: all)
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,

        /// Conversation / session scope
        #[arg(long)]
        scope: Option<String>,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Print a snapshot every interval until interrupted
    Watch {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,

        #[arg(long)]
        json: bool,
    },

    /// List registered probes
    Probes,

    /// Take a snapshot and print cache statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match config_path(cli.config, dirs::home_dir().as_deref()) {
        Some(path) => PerceptionConfig::from_path(&path).with_context(|| format!("loading {}", path.display()))?,
        None => PerceptionConfig::default(),
    };
    let manager = build_manager(config)?;

    match cli.command {
        Commands::Snapshot { keys, scope, json } => {
            let ctx = QueryContext {
                scope,
                deadline: None,
            };
            let snapshot = if keys.is_empty() {
                manager.query_all(&ctx).await
            } else {
                manager.query(&keys, &ctx).await?
            };
            print_snapshot(&snapshot, json)?;
        }

        Commands::Watch { interval_secs, json } => {
            println!("👁️  Vigil is watching (Ctrl-C to stop)...");
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = manager.query_all(&QueryContext::new()).await;
                        manager.record_history();
                        print_snapshot(&snapshot, json)?;
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::Probes => {
            for probe in manager.probes() {
                println!(
                    "{} {:<12} ttl {:>5}s  timeout {:>5}ms  {}{}",
                    if probe.enabled { "●" } else { "○" },
                    probe.key,
                    probe.ttl_secs,
                    probe.timeout_ms,
                    probe.description,
                    if probe.scoped { "  [scoped]" } else { "" },
                );
            }
        }

        Commands::Stats => {
            manager.query_all(&QueryContext::new()).await;
            manager.record_history();
            println!("{}", serde_json::to_string_pretty(&manager.stats())?);
        }
    }

    Ok(())
}

/// Explicit path wins; otherwise the home default, only if it exists
fn config_path(explicit: Option<PathBuf>, home: Option<&Path>) -> Option<PathBuf> {
    explicit.or_else(|| {
        let default = home?.join(".vigil").join("config.json");
        default.exists().then_some(default)
    })
}

fn build_manager(config: PerceptionConfig) -> anyhow::Result<PerceptionManager> {
    let manager = PerceptionManager::new(config)?.with_derived(overall_health(DEVICE, SELF_STATE));
    register_builtin(&manager, ActivityLog::new())?;
    let configured = register_configured(&manager)?;
    tracing::debug!(probes = manager.probes().len(), configured, "perception manager ready");
    Ok(manager)
}

fn print_snapshot(snapshot: &Snapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
    } else {
        print!("{}", render(snapshot));
    }
    Ok(())
}

fn render(snapshot: &Snapshot) -> String {
    let mut out = format!(
        "👁️  {} ({})\n",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.scope.as_deref().unwrap_or("global")
    );
    for (key, entry) in &snapshot.entries {
        let age = entry.age.map(|age| format!("{:.1}s", age.as_secs_f64())).unwrap_or_default();
        let line = match &entry.result {
            ProbeResult::Value(output) if entry.fresh => format!("  ✅ {} [{}] {}", key, age, output.data),
            ProbeResult::Value(output) => format!("  ⚠️  {} [stale {}] {}", key, age, output.data),
            ProbeResult::Failure(failure) => format!("  ❌ {}: {}", key, failure),
        };
        out.push_str(&line);
        out.push('\n');
    }
    for key in &snapshot.disabled {
        out.push_str(&format!("  ⏸  {} (disabled)\n", key));
    }
    for (name, value) in &snapshot.derived {
        out.push_str(&format!("  ◆ {} = {}\n", name, value));
    }
    out
}
