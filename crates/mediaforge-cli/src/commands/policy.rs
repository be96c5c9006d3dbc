//! `mediaforge policy` — inspect the model policy table.

use clap::{Args, Subcommand};
use colored::Colorize;
use mediaforge_core::ModelPolicy;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::CommandContext;

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// List every model in the policy table.
    List,
    /// Show one model's capabilities.
    Show(ShowArgs),
}

#[derive(Args)]
pub struct ShowArgs {
    /// Model (provider) id.
    pub model: String,
}

#[derive(Tabled)]
struct ModelRow {
    #[tabled(rename = "Model")]
    id: String,
    #[tabled(rename = "Max size")]
    max_size: String,
    #[tabled(rename = "LoRA")]
    lora: &'static str,
    #[tabled(rename = "Alpha")]
    alpha: &'static str,
    #[tabled(rename = "Operations")]
    operations: String,
}

impl ModelRow {
    fn new(id: &str, model: &ModelPolicy) -> Self {
        Self {
            id: id.to_string(),
            max_size: max_size(model),
            lora: yes_no(model.supports_lora),
            alpha: yes_no(model.alpha_output),
            operations: operations(model),
        }
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn max_size(model: &ModelPolicy) -> String {
    let side = |v: Option<u64>| v.map_or_else(|| "any".to_string(), |v| v.to_string());
    format!("{}×{}", side(model.max_width), side(model.max_height))
}

fn operations(model: &ModelPolicy) -> String {
    if model.operations.is_empty() {
        return "any".into();
    }
    model
        .operations
        .iter()
        .map(|op| op.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub async fn execute(cmd: PolicyCommands, ctx: &CommandContext) -> anyhow::Result<()> {
    let table = ctx.policy()?;
    match cmd {
        PolicyCommands::List => {
            if ctx.json() {
                println!("{}", serde_json::to_string_pretty(&table)?);
                return Ok(());
            }
            println!(
                "\n  {} Model policy table {}\n",
                "📐",
                format!("v{}", table.version).dimmed()
            );
            let rows: Vec<ModelRow> = table
                .models
                .iter()
                .map(|(id, model)| ModelRow::new(id, model))
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
            println!(
                "\n  Background removal provider: {}\n",
                table.background_removal_provider.cyan()
            );
            Ok(())
        }
        PolicyCommands::Show(args) => {
            let Some(model) = table.model(&args.model) else {
                anyhow::bail!(
                    "Model '{}' is not in policy table v{}. Run `mediaforge policy list`.",
                    args.model,
                    table.version
                );
            };
            if ctx.json() {
                println!("{}", serde_json::to_string_pretty(model)?);
                return Ok(());
            }
            println!("\n  {} {}\n", "📐", args.model.bold());
            if let Some(ref description) = model.description {
                println!("  {}\n", description.dimmed());
            }
            println!("  Max size:     {}", max_size(model));
            println!("  LoRA:         {}", yes_no(model.supports_lora));
            println!("  Alpha output: {}", yes_no(model.alpha_output));
            println!("  Operations:   {}", operations(model));
            println!();
            Ok(())
        }
    }
}
