// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Three commands are supported:
//   1. `train`   — trains a policy on recorded episodes
//   2. `eval`    — replays episodes through a trained checkpoint
//   3. `summary` — prints the parameter breakdown of a policy
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

// Declare the commands submodule
pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvalArgs, SummaryArgs, TrainArgs};

use crate::application::train_use_case::TrainConfig;

/// The main CLI struct — clap reads the fields and generates
/// argument parsing code automatically via the Parser derive macro.
#[derive(Parser, Debug)]
#[command(
    name = "act-policy",
    version = "0.1.0",
    about = "Train and evaluate action-chunking (ACT), CNN-MLP and diffusion policies on recorded episodes."
)]
pub struct Cli {
    /// The subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)   => run_train(args),
            Commands::Eval(args)    => run_eval(args),
            Commands::Summary(args) => run_summary(args),
        }
    }
}

/// Handles the `train` subcommand.
fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let config = TrainConfig::try_from(args)?;
    tracing::info!(
        "Starting {} training on episodes in: {}",
        config.policy_class,
        config.dataset_dir
    );
    let checkpoint_dir = config.checkpoint_dir.clone();
    let summary = TrainUseCase::new(config).execute()?;

    println!(
        "Training complete. Best loss {:.5} at epoch {}; checkpoints in '{}'.",
        summary.best.val_loss, summary.best.epoch, checkpoint_dir
    );
    Ok(())
}

/// Handles the `eval` subcommand.
fn run_eval(args: EvalArgs) -> Result<()> {
    use crate::application::eval_use_case::{EvalConfig, EvalUseCase};

    let report = EvalUseCase::new(EvalConfig::try_from(args)?).execute()?;
    println!(
        "\nMean L1 over {} episodes ({} checkpoint): {:.5}",
        report.episodes.len(),
        report.checkpoint,
        report.mean_l1
    );
    Ok(())
}

/// Handles the `summary` subcommand.
fn run_summary(args: SummaryArgs) -> Result<()> {
    use crate::application::summary_use_case::SummaryUseCase;

    let use_case = match &args.from_checkpoint {
        Some(dir) => SummaryUseCase::from_checkpoint(dir)?,
        None => SummaryUseCase::new(TrainConfig::try_from(args.train)?),
    };
    println!("{}", use_case.execute()?.render());
    Ok(())
}
