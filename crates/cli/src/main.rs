//! `trip-orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check an engine manifest for duplicates, unknown
//!   dependencies and cycles.
//! - `plan`    : print the execution waves for a goal.
//! - `simulate`: run a goal against stub engines and print the run summary.
//!
//! A manifest is a JSON array of engine descriptors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use engines::mock::MockEngine;
use engines::{Engine, EngineError};
use orchestrator::{
    EngineDescriptor, EngineRegistry, InMemoryStore, Orchestrator, OrchestratorConfig, RunSummary,
};

#[derive(Parser)]
#[command(
    name = "trip-orchestrator",
    about = "Dependency-aware orchestration of travel-planning engines",
    version
)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConfigOverrides {
    /// JSON file with orchestrator settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default cache TTL in seconds.
    #[arg(long, global = true, env = "CACHE_TTL")]
    cache_ttl: Option<u64>,

    /// Turn the fingerprint cache on or off.
    #[arg(long, global = true, env = "CACHE_ENABLED")]
    cache_enabled: Option<bool>,

    /// Deadline for a whole run in milliseconds.
    #[arg(long, global = true, env = "RUN_DEADLINE_MS")]
    run_deadline_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate an engine manifest.
    Validate {
        /// Path to the manifest JSON file.
        manifest: PathBuf,
    },
    /// Print the execution waves for a goal.
    Plan {
        manifest: PathBuf,
        /// Goal engine(s); repeat for several.
        #[arg(long, required = true)]
        goal: Vec<String>,
    },
    /// Run a goal against stub engines.
    Simulate {
        manifest: PathBuf,
        #[arg(long)]
        goal: String,
        /// Raw request payload as inline JSON.
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long, default_value = "cli")]
        user: String,
        /// Make this engine fail permanently; repeat for several.
        #[arg(long)]
        fail: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.overrides)?;

    match cli.command {
        Command::Validate { manifest } => {
            let registry = load_registry(&manifest, &[])?;
            println!("manifest is valid: {} engine(s), no cycles", registry.len());
        }
        Command::Plan { manifest, goal } => {
            let registry = load_registry(&manifest, &[])?;
            let required = registry.resolve(goal.as_slice())?;
            let plan = orchestrator::plan(&registry, &required)?;
            for (idx, wave) in plan.waves().iter().enumerate() {
                println!("wave {idx}: {}", wave.join(", "));
            }
        }
        Command::Simulate {
            manifest,
            goal,
            input,
            user,
            fail,
        } => {
            let raw_input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let registry = load_registry(&manifest, &fail)?;
            let orchestrator = Orchestrator::new(registry, Arc::new(InMemoryStore::new()), &config);

            let ctx = orchestrator.run_pipeline(&goal, raw_input, &user).await?;
            let outcome = orchestrator.outcome(&ctx);
            info!(status = %outcome.status(), "simulation finished");

            let summary = RunSummary::new(&ctx, &outcome);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn load_config(overrides: &ConfigOverrides) -> Result<OrchestratorConfig> {
    let mut config = match &overrides.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            OrchestratorConfig::from_json(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => OrchestratorConfig::default(),
    };

    if let Some(secs) = overrides.cache_ttl {
        config.cache.default_ttl = std::time::Duration::from_secs(secs);
    }
    if let Some(enabled) = overrides.cache_enabled {
        config.cache.enabled = enabled;
    }
    if let Some(ms) = overrides.run_deadline_ms {
        config.executor.run_deadline = std::time::Duration::from_millis(ms);
    }
    Ok(config)
}

/// Register every descriptor in `path` behind a stub engine.
///
/// Stubs answer with an object holding each declared `produces` key; engines
/// named in `failing` answer with a permanent error instead.
fn load_registry(path: &Path, failing: &[String]) -> Result<EngineRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read manifest {}", path.display()))?;
    let descriptors: Vec<EngineDescriptor> = serde_json::from_str(&text)
        .with_context(|| format!("invalid manifest {}", path.display()))?;

    for name in failing {
        if !descriptors.iter().any(|d| &d.name == name) {
            bail!("--fail names unknown engine `{name}`");
        }
    }

    let entries = descriptors
        .into_iter()
        .map(|descriptor| {
            let engine: Arc<dyn Engine> = if failing.contains(&descriptor.name) {
                Arc::new(MockEngine::failing(
                    descriptor.name.clone(),
                    EngineError::Permanent("simulated failure".into()),
                ))
            } else {
                Arc::new(MockEngine::returning(descriptor.name.clone(), stub_output(&descriptor)))
            };
            (descriptor, engine)
        })
        .collect();

    let mut registry = EngineRegistry::new();
    registry.register_all(entries)?;
    Ok(registry)
}

fn stub_output(descriptor: &EngineDescriptor) -> Value {
    let fields: Map<String, Value> = descriptor
        .produces
        .iter()
        .map(|key| (key.clone(), Value::String(format!("{}.{key}", descriptor.name))))
        .collect();
    Value::Object(fields)
}
