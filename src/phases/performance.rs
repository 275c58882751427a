//! Build-duration budgets for the scenario's API and UI.
use crate::adapter::{run_phase_with_expectations, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::{args, display_command, Log};
use crate::config::{load_testing_config, PerformanceSettings};
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::phases::{package_manager, package_scripts};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One timed build.
#[derive(Debug, Clone, PartialEq)]
pub struct Build {
    pub target: &'static str,
    pub dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    /// `Duration::ZERO` disables the budget.
    pub budget: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub target: &'static str,
    pub elapsed: Duration,
    pub budget: Duration,
}

impl Measurement {
    pub fn over_budget(&self) -> bool {
        !self.budget.is_zero() && self.elapsed > self.budget
    }

    fn to_json(&self) -> Value {
        json!({
            "target": self.target,
            "elapsed_seconds": self.elapsed.as_secs_f64(),
            "budget_seconds": self.budget.as_secs_f64(),
            "over_budget": self.over_budget(),
        })
    }
}

/// Builds implied by the scenario layout. `go_out` receives Go binaries.
pub fn planned_builds(
    env: &Environment,
    settings: &PerformanceSettings,
    go_out: &Path,
) -> Result<Vec<Build>> {
    let paths = env.paths();
    let mut builds = Vec::new();
    let api = paths.api_dir();
    if api.join("go.mod").is_file() {
        builds.push(Build {
            target: "go",
            dir: api,
            program: "go".to_string(),
            args: args(["build".to_string(), "-o".to_string(), go_out.display().to_string(), "./...".to_string()]),
            budget: settings.go_build_budget(),
        });
    }
    let ui = paths.ui_dir();
    if package_scripts(&ui)?.contains_key("build") {
        let manager = package_manager(&ui);
        builds.push(Build {
            target: "ui",
            dir: ui,
            program: manager.to_string(),
            args: args(["run", "build"]),
            budget: settings.ui_build_budget(),
        });
    }
    Ok(builds)
}

#[derive(Debug, Default)]
pub struct PerformanceOutcome {
    pub observations: Vec<Observation>,
    pub measurements: Vec<Measurement>,
    pub failure: Option<(anyhow::Error, &'static str, String)>,
}

fn measure(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    settings: PerformanceSettings,
) -> Result<PerformanceOutcome> {
    let mut outcome = PerformanceOutcome::default();
    if !settings.enabled {
        outcome
            .observations
            .push(Observation::skip("performance checks disabled in .vrooli/testing.json"));
        return Ok(outcome);
    }
    let scratch = tempfile::Builder::new()
        .prefix("test-genie-build-")
        .tempdir()
        .context("create build output directory")?;
    let builds = planned_builds(env, &settings, scratch.path())?;
    if builds.is_empty() {
        outcome
            .observations
            .push(Observation::skip("no Go API or UI build script to time"));
        return Ok(outcome);
    }
    outcome
        .observations
        .push(Observation::section("⏱️", "Timing builds"));

    for build in &builds {
        ctx.check()?;
        let _ = writeln!(log, "--- {} build: {}", build.target, display_command(&build.program, &build.args));
        let started = Instant::now();
        if let Err(err) = tools
            .commands
            .run(ctx, &build.dir, log, &build.program, &build.args)
        {
            outcome
                .observations
                .push(Observation::error(format!("{} build failed: {err:#}", build.target)));
            outcome.failure = Some((
                err.context(format!("{} build failed", build.target)),
                "",
                format!("Fix the {} build; the phase log has the compiler output.", build.target),
            ));
            return Ok(outcome);
        }
        let measurement = Measurement {
            target: build.target,
            elapsed: started.elapsed(),
            budget: build.budget,
        };
        let line = format!(
            "{} build took {:.2}s (budget {:.2}s)",
            build.target,
            measurement.elapsed.as_secs_f64(),
            measurement.budget.as_secs_f64()
        );
        tracing::debug!(
            build = build.target,
            elapsed_secs = measurement.elapsed.as_secs_f64(),
            "build timed"
        );
        outcome.observations.push(if measurement.over_budget() {
            Observation::error(line)
        } else {
            Observation::success(line)
        });
        outcome.measurements.push(measurement);
    }

    let missed: Vec<&Measurement> = outcome
        .measurements
        .iter()
        .filter(|measurement| measurement.over_budget())
        .collect();
    if !missed.is_empty() {
        let targets = missed
            .iter()
            .map(|measurement| measurement.target)
            .collect::<Vec<_>>()
            .join(", ");
        outcome.failure = Some((
            anyhow!("build duration budget exceeded for {targets}"),
            "system",
            format!(
                "Speed up the {targets} build or raise the budget under performance in .vrooli/testing.json."
            ),
        ));
    }
    Ok(outcome)
}

fn extract(outcome: PerformanceOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "builds": outcome.measurements.iter().map(Measurement::to_json).collect::<Vec<_>>(),
    });
    match outcome.failure {
        None => PhaseResult::success(outcome.observations).with_extras(extras),
        Some((err, class, remediation)) => {
            PhaseResult::failure(err, class, remediation, outcome.observations).with_extras(extras)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceRunner;

impl PhaseRunner for PerformanceRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase_with_expectations(
            ctx,
            env,
            log,
            "performance",
            |dir| load_testing_config(dir).map(|config| config.performance),
            |settings, log| measure(ctx, env, tools, log, settings),
            extract,
        )
    }
}
