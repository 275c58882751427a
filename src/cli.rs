//! CLI argument parsing for the orchestrator binary.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "test-genie",
    version,
    about = "Run validation phases against a scenario",
    after_help = "Examples:\n  test-genie run --scenario-dir scenarios/picker-wheel\n  test-genie run --scenario-dir . --phase structure --phase docs --fail-fast\n  test-genie run --scenario-dir . --json > summary.json\n  test-genie phases --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Phases(PhasesArgs),
}

/// Inputs for one orchestrated run.
#[derive(Parser, Debug)]
#[command(about = "Execute phases for a scenario and write pointers")]
pub struct RunArgs {
    /// Scenario root containing .vrooli/, api/, cli/, ui/ and test/
    #[arg(long, value_name = "DIR")]
    pub scenario_dir: PathBuf,

    /// Phase to run (repeatable, in order); default is every phase by weight
    #[arg(long = "phase", value_name = "NAME")]
    pub phases: Vec<String>,

    /// Skip remaining phases after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Deadline for the whole run
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Override every phase's default timeout
    #[arg(long, value_name = "SECS")]
    pub phase_timeout: Option<f64>,

    /// UI base URL; otherwise resolved through `vrooli scenario port`
    #[arg(long, value_name = "URL")]
    pub ui_url: Option<String>,

    /// Emit the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Inputs for listing the catalog.
#[derive(Parser, Debug)]
#[command(about = "List registered phases in run order")]
pub struct PhasesArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}
