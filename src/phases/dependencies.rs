//! Required commands and declared resource health.
use crate::adapter::{run_phase, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::Log;
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::toolbox::Toolbox;
use crate::vrooli::{resource_status, VROOLI};
use crate::workspace::{load_service_manifest_optional, Environment};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::io::Write;
use std::path::Path;

const BASELINE: [&str; 3] = ["bash", "curl", "jq"];

/// A command the scenario needs and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub command: &'static str,
    pub reason: &'static str,
}

/// Baseline commands plus whatever the scenario's manifests imply.
pub fn required_commands(scenario_dir: &Path) -> Vec<Requirement> {
    let mut out: Vec<Requirement> = BASELINE
        .iter()
        .map(|&command| Requirement {
            command,
            reason: "baseline tooling",
        })
        .collect();
    let mut add = |command: &'static str, reason: &'static str| {
        if !out.iter().any(|req| req.command == command) {
            out.push(Requirement { command, reason });
        }
    };
    if scenario_dir.join("api/go.mod").is_file() {
        add("go", "api/go.mod");
    }
    if scenario_dir.join("cli/go.mod").is_file() {
        add("go", "cli/go.mod");
    }
    if scenario_dir.join("ui/package.json").is_file() {
        add("node", "ui/package.json");
        if scenario_dir.join("ui/pnpm-lock.yaml").is_file() {
            add("pnpm", "ui/pnpm-lock.yaml");
        } else if scenario_dir.join("ui/yarn.lock").is_file() {
            add("yarn", "ui/yarn.lock");
        } else {
            add("npm", "ui/package.json");
        }
    }
    if scenario_dir.join("pyproject.toml").is_file() || scenario_dir.join("api/pyproject.toml").is_file() {
        add("python3", "pyproject.toml");
    }
    if scenario_dir.join("cli/test").is_dir() {
        add("bats", "cli/test");
    }
    out
}

#[derive(Debug, Default)]
pub struct DependencyOutcome {
    pub observations: Vec<Observation>,
    pub missing_commands: Vec<String>,
    pub unhealthy_resources: Vec<String>,
    pub checked_resources: usize,
}

fn check_commands(tools: &Toolbox, scenario_dir: &Path, outcome: &mut DependencyOutcome) {
    outcome
        .observations
        .push(Observation::section("🔧", "Checking required commands"));
    for req in required_commands(scenario_dir) {
        match tools.commands.lookup(req.command) {
            Ok(path) => outcome.observations.push(Observation::success(format!(
                "{} ({})",
                req.command,
                path.display()
            ))),
            Err(_) => {
                outcome.observations.push(Observation::error(format!(
                    "{} not found (needed for {})",
                    req.command, req.reason
                )));
                outcome.missing_commands.push(req.command.to_string());
            }
        }
    }
}

fn check_resources(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    outcome: &mut DependencyOutcome,
) -> Result<()> {
    outcome
        .observations
        .push(Observation::section("🩺", "Checking declared resources"));
    if tools.commands.lookup(VROOLI).is_err() {
        outcome
            .observations
            .push(Observation::info("vrooli CLI not found; resource checks skipped"));
        return Ok(());
    }
    let Some(manifest) = load_service_manifest_optional(&env.scenario_dir)? else {
        outcome
            .observations
            .push(Observation::info("no .vrooli/service.json; no resources declared"));
        return Ok(());
    };
    let declared: Vec<(&str, bool)> = manifest
        .enabled_resources()
        .map(|(name, decl)| (name, decl.required))
        .collect();
    if declared.is_empty() {
        outcome
            .observations
            .push(Observation::info("no resources declared"));
        return Ok(());
    }

    // Fan out; each probe buffers its own output and rejoins before reporting.
    let probes: Vec<(&str, bool, Result<crate::vrooli::ResourceHealth>, Vec<u8>)> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = declared
                .iter()
                .map(|&(name, required)| {
                    let dir = env.scenario_dir.as_path();
                    scope.spawn(move || {
                        let mut buf: Vec<u8> = Vec::new();
                        let health = resource_status(ctx, tools, dir, &mut buf, name);
                        (name, required, health, buf)
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(&declared)
                .map(|(handle, &(name, required))| {
                    handle.join().unwrap_or_else(|_| {
                        (name, required, Err(anyhow!("health probe for {name} panicked")), Vec::new())
                    })
                })
                .collect()
        });
    ctx.check()?;

    for (name, required, health, buf) in probes {
        let _ = log.write_all(&buf);
        outcome.checked_resources += 1;
        let problem = match health {
            Ok(health) if health.is_ready() => {
                outcome
                    .observations
                    .push(Observation::success(format!("{name} running and healthy")));
                continue;
            }
            Ok(health) => format!("running={} healthy={}", health.running, health.healthy),
            Err(err) => format!("status unavailable: {err:#}"),
        };
        if required {
            outcome
                .observations
                .push(Observation::error(format!("{name} (required): {problem}")));
            outcome.unhealthy_resources.push(name.to_string());
        } else {
            outcome
                .observations
                .push(Observation::warning(format!("{name} (optional): {problem}")));
        }
    }
    Ok(())
}

fn extract(outcome: DependencyOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "missing_commands": outcome.missing_commands,
        "unhealthy_resources": outcome.unhealthy_resources,
        "resources_checked": outcome.checked_resources,
    });
    if !outcome.missing_commands.is_empty() {
        let missing = outcome.missing_commands.join(", ");
        return PhaseResult::failure(
            anyhow!("missing required commands: {missing}"),
            "missing_dependency",
            format!("Install {missing} and make sure it is on PATH."),
            outcome.observations,
        )
        .with_extras(extras);
    }
    if !outcome.unhealthy_resources.is_empty() {
        let names = outcome.unhealthy_resources.join(", ");
        let start = outcome
            .unhealthy_resources
            .iter()
            .map(|name| format!("vrooli resource start {name}"))
            .collect::<Vec<_>>()
            .join("; ");
        return PhaseResult::failure(
            anyhow!("required resources not healthy: {names}"),
            "missing_dependency",
            format!("Start the resources ({start}) and re-run."),
            outcome.observations,
        )
        .with_extras(extras);
    }
    PhaseResult::success(outcome.observations)
        .with_summary("✅", "Dependencies available")
        .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DependenciesRunner;

impl PhaseRunner for DependenciesRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase(
            ctx,
            log,
            "dependencies",
            |log| {
                let mut outcome = DependencyOutcome::default();
                check_commands(tools, &env.scenario_dir, &mut outcome);
                ctx.check()?;
                check_resources(ctx, env, tools, log, &mut outcome)?;
                Ok(outcome)
            },
            extract,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn manifests_add_runtime_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("api")).expect("mkdir");
        fs::create_dir_all(dir.path().join("ui")).expect("mkdir");
        fs::write(dir.path().join("api/go.mod"), "module x").expect("write");
        fs::write(dir.path().join("ui/package.json"), "{}").expect("write");
        fs::write(dir.path().join("ui/pnpm-lock.yaml"), "").expect("write");
        let commands: Vec<&str> = required_commands(dir.path())
            .iter()
            .map(|req| req.command)
            .collect();
        assert_eq!(commands, vec!["bash", "curl", "jq", "go", "node", "pnpm"]);
    }

    #[test]
    fn bare_scenario_needs_only_baseline() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(required_commands(dir.path()).len(), BASELINE.len());
    }
}
