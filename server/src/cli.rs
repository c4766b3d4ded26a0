//! Subcommand parsing: one binary, one `argh::FromArgs` subcommand enum,
//! rather than a separate binary crate per command.

use std::path::PathBuf;

use argh::FromArgs;

/// credit/payment/LLM-orchestration backend
#[derive(Debug, FromArgs)]
pub struct Args {
    #[argh(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
pub enum Command {
    Run(RunArgs),
    PlanSync(PlanSyncArgs),
}

/// serve the HTTP API
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
pub struct RunArgs {
    /// path to a `.env` file to load (defaults to discovering `.env` in the
    /// current directory or its parents)
    #[argh(option)]
    pub config: Option<PathBuf>,
    /// override the configured bind address, e.g. `0.0.0.0:8080`
    #[argh(option)]
    pub bind_addr: Option<String>,
    /// force JSON log output regardless of `LOG_FORMAT`
    #[argh(switch)]
    pub json_logs: bool,
}

/// sync the payment plan catalog and exit
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "plan-sync")]
pub struct PlanSyncArgs {
    /// path to a `.env` file to load (defaults to discovering `.env` in the
    /// current directory or its parents)
    #[argh(option)]
    pub config: Option<PathBuf>,
    /// path to the tokenization-provider YAML plan file; if omitted, only
    /// the card/subscription provider's catalog is synced
    #[argh(option)]
    pub tokenization_plan_file: Option<PathBuf>,
}
