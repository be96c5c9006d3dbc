//! `mediaforge recipe` — validate, fix, plan and run recipes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use colored::Colorize;
use mediaforge_core::{
    apply_fixes, ExecutionResult, Executor, FixAction, Issue, Recipe, StepGraph, StepStatus,
    ValidationResult,
};
use serde_json::{json, Value};

use super::{read_document, write_document, CommandContext};

/// `validate`, `fix` and `plan` check providers against the dry-run set
/// (policy-table models plus configured providers) unless `--configured`
/// is given, in which case only configured providers count, as in `run`.
#[derive(Subcommand)]
pub enum RecipeCommands {
    /// Validate a recipe file (providers checked against the dry-run set).
    Validate(ValidateArgs),
    /// Apply the validator's suggested fixes.
    Fix(FixArgs),
    /// Show the execution waves of a recipe.
    Plan(PlanArgs),
    /// Execute a recipe.
    Run(RunArgs),
    /// Print the JSON Schema of the recipe document.
    Schema,
}

/// Which providers a recipe is checked against.
#[derive(Args, Clone, Copy)]
pub struct ProviderScope {
    /// Accept only providers configured under [providers.<id>], as `recipe run` does.
    #[arg(long)]
    pub configured: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Recipe file (JSON or YAML).
    pub file: PathBuf,
    #[command(flatten)]
    pub scope: ProviderScope,
}

#[derive(Args)]
pub struct FixArgs {
    /// Recipe file (JSON or YAML).
    pub file: PathBuf,
    /// Write the fixed recipe here instead of printing it.
    #[arg(long, short)]
    pub write: Option<PathBuf>,
    /// Apply every fix without asking.
    #[arg(long, short)]
    pub yes: bool,
    #[command(flatten)]
    pub scope: ProviderScope,
}

#[derive(Args)]
pub struct PlanArgs {
    /// Recipe file (JSON or YAML).
    pub file: PathBuf,
    #[command(flatten)]
    pub scope: ProviderScope,
}

#[derive(Args)]
pub struct RunArgs {
    /// Recipe file (JSON or YAML).
    pub file: PathBuf,
    /// Input data as JSON string.
    #[arg(long, short)]
    pub input: Option<String>,
    /// Input from file (JSON or YAML).
    #[arg(long, conflicts_with = "input")]
    pub input_file: Option<PathBuf>,
    /// Use dry-run adapters instead of the configured providers.
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(cmd: RecipeCommands, ctx: &CommandContext) -> anyhow::Result<()> {
    match cmd {
        RecipeCommands::Validate(args) => validate(args, ctx),
        RecipeCommands::Fix(args) => fix(args, ctx),
        RecipeCommands::Plan(args) => plan(args, ctx),
        RecipeCommands::Run(args) => run(args, ctx).await,
        RecipeCommands::Schema => {
            let schema = schemars::schema_for!(Recipe);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

fn validate(args: ValidateArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let document = read_document(&args.file)?;
    let validator = ctx.validator(Arc::new(ctx.registry(!args.scope.configured)?))?;
    let result = validator.validate_document(&document);

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\n  {} Validating {}\n", "📖", args.file.display().to_string().bold());
        print_report(&result);
    }

    if !result.valid {
        anyhow::bail!("{} has {} error(s)", args.file.display(), result.errors.len());
    }
    Ok(())
}

fn fix(args: FixArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let recipe = load_recipe(&args.file)?;
    let validator = ctx.validator(Arc::new(ctx.registry(!args.scope.configured)?))?;
    let result = validator.validate(&recipe);

    if result.fixes.is_empty() {
        println!("  {} Nothing to fix.", "✓".green().bold());
        return Ok(());
    }

    let mut accepted = Vec::new();
    for fix in &result.fixes {
        let take = args.yes
            || dialoguer::Confirm::new()
                .with_prompt(format!("  {} {}?", action_label(fix.action), fix.description))
                .default(true)
                .interact()?;
        if take {
            accepted.push(fix.clone());
        }
    }
    if accepted.is_empty() {
        println!("  {} No fixes applied.", "→".dimmed());
        return Ok(());
    }

    let fixed = apply_fixes(&recipe, &accepted)?;
    let after = validator.validate(&fixed);

    match args.write {
        Some(ref out) => {
            write_document(out, &fixed)?;
            println!(
                "  {} Applied {} fix(es), wrote {}",
                "✓".green().bold(),
                accepted.len(),
                out.display().to_string().cyan()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&fixed)?),
    }

    if !after.valid {
        eprintln!(
            "  {} {} error(s) remain after fixing.",
            "⚠".yellow().bold(),
            after.errors.len()
        );
    }
    Ok(())
}

fn plan(args: PlanArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let recipe = load_recipe(&args.file)?;
    let validator = ctx.validator(Arc::new(ctx.registry(!args.scope.configured)?))?;
    let result = validator.validate(&recipe);
    if !result.valid {
        report_invalid(&result, ctx)?;
        anyhow::bail!("Cannot plan an invalid recipe");
    }

    let waves = StepGraph::build(&recipe)?.waves()?;
    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&json!({ "recipe": recipe.id, "waves": waves }))?);
        return Ok(());
    }

    println!("\n  {} Plan for {}\n", "🗺️", recipe.name.bold());
    for (n, wave) in waves.iter().enumerate() {
        println!("  {} {}", format!("Wave {}", n + 1).cyan().bold(), "─".repeat(30).dimmed());
        for id in wave {
            if let Some(step) = recipe.step(id) {
                println!(
                    "    • {} {} {}",
                    id.bold(),
                    step.provider.dimmed(),
                    step.effective_operation().to_string().dimmed()
                );
            }
        }
    }
    println!();
    Ok(())
}

async fn run(args: RunArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let recipe = load_recipe(&args.file)?;
    let inputs = match (args.input, args.input_file) {
        (Some(raw), _) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}"))?,
        (None, Some(path)) => read_document(&path)?,
        (None, None) => json!({}),
    };

    let registry = Arc::new(ctx.registry(args.dry_run)?);
    if registry.is_empty() {
        anyhow::bail!("No providers configured. Add [providers.<id>] to your config or use --dry-run");
    }
    let validation = ctx.validator(registry.clone())?.validate(&recipe);
    if !validation.valid {
        report_invalid(&validation, ctx)?;
        anyhow::bail!("Refusing to run an invalid recipe");
    }

    if !ctx.json() {
        let mode = if args.dry_run { " (dry run)" } else { "" };
        println!("\n  {} Running {}{}\n", "🔥", recipe.name.bold(), mode.dimmed());
    }

    let executor = Executor::new(registry);
    let run_id = uuid::Uuid::new_v4().to_string();
    let result = run_with_progress(&executor, &run_id, recipe, inputs, ctx.json()).await?;

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_execution(&result);
    }

    if !result.success {
        anyhow::bail!("Run {} did not succeed", result.run_id);
    }
    Ok(())
}

async fn run_with_progress(
    executor: &Executor,
    run_id: &str,
    recipe: Recipe,
    inputs: Value,
    quiet: bool,
) -> anyhow::Result<ExecutionResult> {
    let pb = if quiet {
        indicatif::ProgressBar::hidden()
    } else {
        indicatif::ProgressBar::new(recipe.steps.len() as u64)
    };
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/dim}] {pos}/{len} steps {msg}")?
            .progress_chars("█▓░"),
    );

    let mut handle = {
        let executor = executor.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move { executor.execute_plan_with_id(&run_id, &recipe, inputs).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            joined = &mut handle => break joined?,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if executor.cancel_execution(run_id).await {
                    pb.println(format!("  {} Cancelling, waiting for in-flight steps...", "→".dimmed()));
                }
            }
            _ = ticker.tick() => {
                if let Some(progress) = executor.execution_progress(run_id).await {
                    pb.set_position((progress.succeeded + progress.failed) as u64);
                    pb.set_message(format!("{} running", progress.running));
                }
            }
        }
    };
    pb.finish_and_clear();
    Ok(result)
}

fn load_recipe(path: &Path) -> anyhow::Result<Recipe> {
    let document = read_document(path)?;
    serde_json::from_value(document)
        .map_err(|e| anyhow::anyhow!("'{}' is not a valid recipe: {e}", path.display()))
}

fn action_label(action: FixAction) -> colored::ColoredString {
    match action {
        FixAction::Add => "add".green().bold(),
        FixAction::Remove => "remove".red().bold(),
        FixAction::Modify => "modify".yellow().bold(),
    }
}

fn issue_line(issue: &Issue) -> String {
    match issue.path {
        Some(ref path) => format!("{} {}", issue.message, path.dimmed()),
        None => issue.message.clone(),
    }
}

/// Print a failed validation in the selected output format.
fn report_invalid(result: &ValidationResult, ctx: &CommandContext) -> anyhow::Result<()> {
    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print_report(result);
    }
    Ok(())
}

fn print_report(result: &ValidationResult) {
    for issue in &result.errors {
        println!("  {} {}", "✗".red().bold(), issue_line(issue));
    }
    for issue in &result.warnings {
        println!("  {} {}", "⚠".yellow().bold(), issue_line(issue));
    }
    if !result.fixes.is_empty() {
        println!();
        println!("  {} fix(es) available (`mediaforge recipe fix`):", result.fixes.len());
        for fix in &result.fixes {
            println!("    {} {} {}", action_label(fix.action), fix.description, fix.path.dimmed());
        }
    }
    println!();
    if result.valid {
        println!(
            "  {} Recipe is valid ({} warning(s)).",
            "✓".green().bold(),
            result.warnings.len()
        );
    } else {
        println!(
            "  {} Recipe is invalid ({} error(s)).",
            "✗".red().bold(),
            result.errors.len()
        );
    }
}

fn print_execution(result: &ExecutionResult) {
    for step in &result.steps {
        let (icon, detail) = match step.status {
            StepStatus::Succeeded if step.cached => ("✓".green().bold(), "cached".dimmed()),
            StepStatus::Succeeded => ("✓".green().bold(), "".normal()),
            StepStatus::Failed => (
                "✗".red().bold(),
                step.error.clone().unwrap_or_default().dimmed(),
            ),
            StepStatus::Pending | StepStatus::Running => ("○".dimmed(), "not run".dimmed()),
        };
        println!("  {} {} {}", icon, step.step_id.bold(), detail);
    }

    if !result.outputs.is_empty() {
        println!("\n  Outputs:");
        for (name, value) in &result.outputs {
            let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            println!("    {} {}", format!("{name}:").cyan(), shown);
        }
    }
    for error in &result.errors {
        println!("  {} {}", "✗".red().bold(), error);
    }

    println!();
    let status = if result.success {
        "succeeded".green().bold()
    } else if result.cancelled {
        "cancelled".yellow().bold()
    } else {
        "failed".red().bold()
    };
    println!(
        "  Run {} {} in {} ms",
        result.run_id.dimmed(),
        status,
        result.duration_ms
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Commands, OutputFormat};
    use clap::Parser;
    use mediaforge_core::{IssueCode, MediaforgeConfig, ProviderEndpoint, StepSpec};

    fn context(output: OutputFormat) -> CommandContext {
        let mut config = MediaforgeConfig::default();
        config.providers.insert(
            "house-model".into(),
            ProviderEndpoint::new("http://localhost:9000/house"),
        );
        CommandContext { config, output }
    }

    fn flux_recipe() -> Recipe {
        Recipe::new("r1", "Flux")
            .with_step(StepSpec::new("gen", "flux-pro").with_input("prompt", "a sunset"))
            .with_output("image", "$step.gen.url")
    }

    #[test]
    fn test_configured_flag_parses() {
        let cli = Cli::try_parse_from(["mediaforge", "recipe", "validate", "r.yaml", "--configured"])
            .unwrap();
        let Commands::Recipe(RecipeCommands::Validate(args)) = cli.command else {
            panic!("expected recipe validate");
        };
        assert!(args.scope.configured);

        let cli = Cli::try_parse_from(["mediaforge", "recipe", "plan", "r.yaml"]).unwrap();
        let Commands::Recipe(RecipeCommands::Plan(args)) = cli.command else {
            panic!("expected recipe plan");
        };
        assert!(!args.scope.configured);
    }

    #[test]
    fn test_configured_scope_matches_run() {
        let ctx = context(OutputFormat::Text);

        let dry = ctx.registry(true).unwrap();
        assert!(dry.contains("flux-pro"));
        assert!(dry.contains("house-model"));
        let configured = ctx.registry(false).unwrap();
        assert_eq!(configured.ids(), vec!["house-model"]);

        let recipe = flux_recipe();
        let loose = ctx.validator(Arc::new(dry)).unwrap().validate(&recipe);
        assert!(loose.valid);
        let strict = ctx.validator(Arc::new(configured)).unwrap().validate(&recipe);
        assert!(strict.has_code(IssueCode::UnknownProvider));
    }

    #[test]
    fn test_plan_rejects_invalid_recipe_in_json_mode() {
        let ctx = context(OutputFormat::Json);
        let path = std::env::temp_dir().join(format!("mediaforge-plan-{}.json", uuid::Uuid::new_v4()));
        write_document(&path, &flux_recipe()).unwrap();

        let args = PlanArgs {
            file: path.clone(),
            scope: ProviderScope { configured: true },
        };
        let err = plan(args, &ctx).unwrap_err();
        assert_eq!(err.to_string(), "Cannot plan an invalid recipe");

        std::fs::remove_file(path).unwrap();
    }
}
