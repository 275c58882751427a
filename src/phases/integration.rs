//! Scenario CLI smoke and bats suites.
use crate::adapter::{run_phase, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::{args, is_executable, CommandError, Log};
use crate::context::RunContext;
use crate::observe::{classify_error, FailureClass, Observation, RunReport};
use crate::phases::{display_rel, walk_files};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;

/// Locate the scenario CLI, installing it through `cli/install.sh` when a
/// cross-platform layout has not been built yet.
pub fn resolve_cli(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    observations: &mut Vec<Observation>,
) -> Result<String> {
    let local = env.paths().cli_dir().join(&env.scenario_name);
    if is_executable(&local) {
        return Ok(local.display().to_string());
    }
    if tools.commands.lookup(&env.scenario_name).is_ok() {
        return Ok(env.scenario_name.clone());
    }
    let cli_dir = env.paths().cli_dir();
    let installer = cli_dir.join("install.sh");
    if cli_dir.join("main.go").is_file() && installer.is_file() {
        observations.push(Observation::info("CLI not built; running cli/install.sh"));
        tools
            .commands
            .run(ctx, &cli_dir, log, "bash", &args([installer.display().to_string()]))
            .context("install scenario CLI")?;
        if is_executable(&local) {
            return Ok(local.display().to_string());
        }
        if tools.commands.lookup(&env.scenario_name).is_ok() {
            return Ok(env.scenario_name.clone());
        }
    }
    Err(CommandError::NotFound {
        tool: env.scenario_name.clone(),
    }
    .into())
}

#[derive(Debug, Default)]
pub struct IntegrationOutcome {
    pub observations: Vec<Observation>,
    pub cli: Option<String>,
    pub bats_files: Vec<String>,
    pub failure: Option<anyhow::Error>,
}

fn exercise(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
) -> Result<IntegrationOutcome> {
    let mut outcome = IntegrationOutcome::default();
    outcome
        .observations
        .push(Observation::section("🔌", "Exercising scenario CLI"));
    let cli = match resolve_cli(ctx, env, tools, log, &mut outcome.observations) {
        Ok(cli) => cli,
        Err(err) => {
            outcome
                .observations
                .push(Observation::error(format!("scenario CLI unavailable: {err:#}")));
            outcome.failure = Some(err);
            return Ok(outcome);
        }
    };
    outcome.cli = Some(cli.clone());

    for subcommand in ["help", "version"] {
        ctx.check()?;
        match tools
            .commands
            .capture(ctx, &env.scenario_dir, log, &cli, &args([subcommand]))
        {
            Ok(_) => outcome
                .observations
                .push(Observation::success(format!("{} {subcommand}", env.scenario_name))),
            Err(err) => {
                outcome.observations.push(Observation::error(format!(
                    "{} {subcommand} failed: {err:#}",
                    env.scenario_name
                )));
                outcome.failure.get_or_insert(err);
            }
        }
    }

    let bats_dir = env.paths().cli_dir().join("test");
    let bats: Vec<PathBuf> = if bats_dir.is_dir() {
        walk_files(&bats_dir, &[], |path| {
            path.extension().is_some_and(|ext| ext == "bats")
        })?
    } else {
        Vec::new()
    };
    if bats.is_empty() {
        outcome
            .observations
            .push(Observation::info("no cli/test/*.bats suites"));
        return Ok(outcome);
    }
    outcome
        .observations
        .push(Observation::section("🦇", "Running bats suites"));
    for file in &bats {
        ctx.check()?;
        let rel = display_rel(&env.scenario_dir, file);
        outcome.bats_files.push(rel.clone());
        match tools.commands.run(
            ctx,
            &env.scenario_dir,
            log,
            "bats",
            &args(["--tap".to_string(), file.display().to_string()]),
        ) {
            Ok(()) => outcome.observations.push(Observation::success(rel)),
            Err(err) => {
                outcome
                    .observations
                    .push(Observation::error(format!("{rel}: {err:#}")));
                outcome.failure.get_or_insert(err);
            }
        }
    }
    Ok(outcome)
}

fn extract(outcome: IntegrationOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "cli": outcome.cli,
        "bats_files": outcome.bats_files,
    });
    let Some(err) = outcome.failure else {
        return PhaseResult::success(outcome.observations).with_extras(extras);
    };
    let (class, remediation) = match classify_error(&err) {
        FailureClass::MissingDependency => (
            "missing_dependency",
            "Build or install the scenario CLI (cli/install.sh) and make sure bats is installed.",
        ),
        FailureClass::Timeout => (
            "timeout",
            "Raise the integration phase timeout or trim the bats suites.",
        ),
        _ => (
            "system",
            "Fix the failing CLI command or bats suite; the phase log has the full output.",
        ),
    };
    PhaseResult::failure(
        err.context("integration failed"),
        class,
        remediation,
        outcome.observations,
    )
    .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrationRunner;

impl PhaseRunner for IntegrationRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase(
            ctx,
            log,
            "integration",
            |log| exercise(ctx, env, tools, log),
            extract,
        )
    }
}
