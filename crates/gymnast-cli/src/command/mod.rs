use clap::{Parser, Subcommand};
use tracing::Level;

use crate::telemetry;

use self::{evaluate::EvaluateArg, train::TrainArg};

mod evaluate;
mod train;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// Emit logs as newline-delimited JSON
    #[arg(long, global = true)]
    log_json: bool,
    /// Default log level when `RUST_LOG` is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Clone, Subcommand)]
enum Mode {
    /// Evolve a population over generations
    Train(#[clap(flatten)] TrainArg),
    /// Score a saved best candidate on a task
    Evaluate(#[clap(flatten)] EvaluateArg),
}

pub fn run() -> anyhow::Result<()> {
    let args = CommandArgs::parse();
    telemetry::init_tracing(args.log_json, args.log_level);
    match args.mode {
        Mode::Train(arg) => train::run(&arg)?,
        Mode::Evaluate(arg) => evaluate::run(&arg)?,
    }
    Ok(())
}
