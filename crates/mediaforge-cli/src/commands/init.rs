//! `mediaforge init` — initialize a new MediaForge project.

use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct InitArgs {
    /// Project directory (defaults to current directory).
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Project name.
    #[arg(long, short)]
    pub name: Option<String>,

    /// Overwrite existing files without asking.
    #[arg(long, short)]
    pub force: bool,
}

const SAMPLE_RECIPE: &str = r#"# Sample MediaForge recipe.
# Validate: mediaforge recipe validate recipes/hero.yaml
# Rehearse: mediaforge recipe run recipes/hero.yaml --dry-run --input '{"prompt": "a lighthouse at dusk"}'

id: hero-image
name: Hero image
description: Generate a hero image and upscale it for print.
inputs:
  - id: prompt
    name: Prompt
    type: text
    required: true
  - id: width
    name: Width
    type: number
    required: false
    default: 1024
steps:
  - id: generate
    name: Generate
    provider: flux-pro
    operation: generate-image
    inputs:
      prompt: $input.prompt
      width: $input.width
      height: 768
    cache: true
  - id: upscale
    name: Upscale 4x
    provider: real-esrgan
    operation: upscale
    inputs:
      image: $step.generate.url
outputs:
  image: $step.upscale.url
  preview: $step.generate.url
"#;

pub async fn execute(args: InitArgs) -> anyhow::Result<()> {
    let project_dir = args.path.canonicalize().unwrap_or(args.path.clone());
    let project_name = args.name.unwrap_or_else(|| {
        project_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("my-media-project")
            .to_string()
    });

    println!();
    println!(
        "  {} Initializing MediaForge project: {}",
        "🎞️",
        project_name.bold()
    );
    println!();

    // Create mediaforge.toml
    let config = format!(
        r#"# MediaForge project configuration for {project_name}
# Picked up automatically from the working directory.

[telemetry]
enabled = false
# otlp_endpoint = "http://localhost:4317"
# log_filter = "warn,mediaforge_core=info"

# Replace the built-in model policy table.
# policy_file = "policies/models.toml"

# Providers reachable over HTTP. Each receives POST {{"operation", "inputs"}}.
# [providers.flux-pro]
# url = "https://gateway.example.com/v1/flux-pro"
# api_key_env = "FLUX_API_KEY"
# timeout_secs = 120
"#
    );

    tokio::fs::create_dir_all(&project_dir).await?;
    if write_file(&project_dir.join("mediaforge.toml"), &config, args.force).await? {
        println!("  {} Created {}", "✓".green().bold(), "mediaforge.toml".cyan());
    }

    // Create sample recipe
    let recipes_dir = project_dir.join("recipes");
    tokio::fs::create_dir_all(&recipes_dir).await?;
    if write_file(&recipes_dir.join("hero.yaml"), SAMPLE_RECIPE, args.force).await? {
        println!("  {} Created {}", "✓".green().bold(), "recipes/hero.yaml".cyan());
    }

    println!();
    println!("  Next steps:");
    println!("    {} mediaforge recipe validate recipes/hero.yaml", "$".dimmed());
    println!(
        "    {} mediaforge recipe run recipes/hero.yaml --dry-run --input '{{\"prompt\": \"sunset\"}}'",
        "$".dimmed()
    );
    println!();
    Ok(())
}

/// Write `contents` unless the file exists and the user declines.
async fn write_file(path: &Path, contents: &str, force: bool) -> anyhow::Result<bool> {
    if path.exists() && !force {
        let overwrite = dialoguer::Confirm::new()
            .with_prompt(format!("  {} exists. Overwrite?", path.display()))
            .default(false)
            .interact()?;
        if !overwrite {
            println!("  {} Kept {}", "→".dimmed(), path.display());
            return Ok(false);
        }
    }
    tokio::fs::write(path, contents).await?;
    Ok(true)
}
