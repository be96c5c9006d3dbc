//! CLI command definitions and dispatch.

pub mod init;
pub mod policy;
pub mod recipe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mediaforge_core::telemetry::init_telemetry;
use mediaforge_core::{AdapterRegistry, DryRunAdapter, MediaforgeConfig, PolicyTable, Validator};
use serde_json::Value;

const BANNER: &str = r#"
   🎞️  MediaForge
   Validate, fix and run generative media recipes.
"#;

/// MediaForge CLI — recipe validation and pipeline execution.
#[derive(Parser)]
#[command(
    name = "mediaforge",
    version,
    about = "🎞️  MediaForge — Validate, fix and run generative media recipes",
    long_about = BANNER,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (overrides MEDIAFORGE_CONFIG and ~/.mediaforge/config.toml).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Increase log verbosity (-v, -vv).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 🎞️  Initialize a new MediaForge project in the current directory.
    Init(init::InitArgs),

    /// 📖 Validate, fix, plan and run recipes.
    #[command(subcommand)]
    Recipe(recipe::RecipeCommands),

    /// 📐 Inspect the model policy table.
    #[command(subcommand)]
    Policy(policy::PolicyCommands),
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Shared state handed to every command.
pub struct CommandContext {
    pub config: MediaforgeConfig,
    pub output: OutputFormat,
}

impl CommandContext {
    pub fn json(&self) -> bool {
        self.output == OutputFormat::Json
    }

    pub fn policy(&self) -> anyhow::Result<PolicyTable> {
        Ok(self.config.policy_table()?)
    }

    /// Adapters a run dispatches to: configured remote providers, or
    /// dry-run stand-ins for every known provider.
    pub fn registry(&self, dry_run: bool) -> anyhow::Result<AdapterRegistry> {
        if !dry_run {
            return Ok(self.config.adapter_registry()?);
        }
        let policy = self.policy()?;
        let mut registry = AdapterRegistry::new();
        for id in policy.models.keys().chain(self.config.providers.keys()) {
            registry.register(DryRunAdapter::new(id));
        }
        Ok(registry)
    }

    pub fn validator(&self, registry: Arc<AdapterRegistry>) -> anyhow::Result<Validator> {
        Ok(Validator::new(registry, Arc::new(self.policy()?)))
    }
}

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = MediaforgeConfig::discover(cli.config.as_deref())?;

    let mut telemetry = config.telemetry.clone();
    match cli.verbose {
        0 => {}
        1 => telemetry.log_filter = "info,mediaforge_core=debug".into(),
        _ => telemetry.log_filter = "debug".into(),
    }
    init_telemetry(&telemetry)?;

    let ctx = CommandContext {
        config,
        output: cli.output,
    };

    match cli.command {
        Commands::Init(args) => init::execute(args).await,
        Commands::Recipe(cmd) => recipe::execute(cmd, &ctx).await,
        Commands::Policy(cmd) => policy::execute(cmd, &ctx).await,
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Read a JSON or YAML document (by extension) as a JSON value.
pub fn read_document(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read '{}': {e}", path.display()))?;
    let value = if is_yaml(path) {
        serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("'{}' is not valid YAML: {e}", path.display()))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("'{}' is not valid JSON: {e}", path.display()))?
    };
    Ok(value)
}

/// Write a value as JSON or YAML (by extension).
pub fn write_document<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let rendered = if is_yaml(path) {
        serde_yaml::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)? + "\n"
    };
    std::fs::write(path, rendered)?;
    Ok(())
}
