mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "crucible-cli")]
#[command(about = "Crucible CLI - Build, inspect and validate task datasets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a dataset from a directory of tasks
    Init {
        /// Directory with one subdirectory per task (prompt.md + backbone.<ext>)
        #[arg(short, long)]
        corpus: PathBuf,

        /// Dataset file to write
        #[arg(short, long, default_value = "dataset/tasks.json")]
        output: PathBuf,

        /// Overwrite an existing dataset
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Show per-task status and accuracy
    Report {
        #[arg(short, long, default_value = "dataset/tasks.json")]
        dataset: PathBuf,
    },

    /// Check dataset invariants (exits non-zero on violation)
    Validate {
        #[arg(short, long, default_value = "dataset/tasks.json")]
        dataset: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            corpus,
            output,
            force,
        } => {
            commands::init_dataset(&corpus, &output, force).await?;
        }
        Commands::Report { dataset } => {
            commands::report(&dataset).await?;
        }
        Commands::Validate { dataset } => {
            commands::validate(&dataset).await?;
        }
    }

    Ok(())
}
