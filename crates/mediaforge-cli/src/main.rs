//! MediaForge CLI — validate, fix and run generative media recipes from the terminal.
//!
//! 🎞️ `mediaforge` — the command-line interface for the MediaForge engine.

mod commands;

use clap::Parser;
use commands::{execute, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    execute(cli).await
}
