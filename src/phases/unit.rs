//! Language unit tests.
//!
//! Each detected language is an independent sub-runner; all of them run even
//! when an earlier one fails so the log shows every failure at once.
use crate::adapter::{run_phase, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::{args, display_command, Log};
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::phases::{package_manager, package_scripts, walk_files};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::Result;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

/// One language suite to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    pub language: &'static str,
    pub dir: PathBuf,
    pub steps: Vec<(String, Vec<String>)>,
}

/// Suites implied by the scenario's files, in fixed language order.
pub fn detect_suites(env: &Environment, tools: &Toolbox) -> Result<Vec<Suite>> {
    let root = &env.scenario_dir;
    let mut suites = Vec::new();

    let api = root.join("api");
    if api.join("go.mod").is_file() {
        suites.push(Suite {
            language: "go",
            dir: api,
            steps: vec![("go".to_string(), args(["test", "./..."]))],
        });
    }

    let ui = root.join("ui");
    if package_scripts(&ui)?.contains_key("test") {
        let manager = package_manager(&ui);
        suites.push(Suite {
            language: "node",
            dir: ui,
            steps: vec![(manager.to_string(), args(["test"]))],
        });
    }

    for dir in [root.to_path_buf(), root.join("api")] {
        if dir.join("pyproject.toml").is_file() {
            suites.push(Suite {
                language: "python",
                dir,
                steps: vec![("python3".to_string(), args(["-m", "pytest", "-q"]))],
            });
            break;
        }
    }

    let scripts = walk_files(root, &[], |path| {
        path.extension().is_some_and(|ext| ext == "sh")
    })?;
    if !scripts.is_empty() {
        let rels: Vec<String> = scripts
            .iter()
            .map(|path| crate::phases::display_rel(root, path))
            .collect();
        let steps = if tools.commands.lookup("shellcheck").is_ok() {
            let mut shellcheck = args(["-S", "error"]);
            shellcheck.extend(rels);
            vec![("shellcheck".to_string(), shellcheck)]
        } else {
            rels.into_iter()
                .map(|rel| ("bash".to_string(), args(["-n".to_string(), rel])))
                .collect()
        };
        suites.push(Suite {
            language: "shell",
            dir: root.clone(),
            steps,
        });
    }
    Ok(suites)
}

fn run_suite(ctx: &RunContext, tools: &Toolbox, log: &mut Log, suite: &Suite) -> Result<()> {
    for (name, step_args) in &suite.steps {
        let _ = writeln!(log, "--- {} unit: {}", suite.language, display_command(name, step_args));
        tools.commands.run(ctx, &suite.dir, log, name, step_args)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct UnitOutcome {
    pub observations: Vec<Observation>,
    pub passed: Vec<&'static str>,
    pub failures: Vec<(&'static str, anyhow::Error)>,
}

pub fn run_suites(ctx: &RunContext, tools: &Toolbox, log: &mut Log, suites: &[Suite]) -> Result<UnitOutcome> {
    let mut outcome = UnitOutcome::default();
    if suites.is_empty() {
        outcome
            .observations
            .push(Observation::skip("no unit-testable languages detected"));
        return Ok(outcome);
    }
    outcome
        .observations
        .push(Observation::section("🧪", "Running unit tests"));
    for suite in suites {
        ctx.check()?;
        match run_suite(ctx, tools, log, suite) {
            Ok(()) => {
                outcome
                    .observations
                    .push(Observation::success(format!("{} tests passed", suite.language)));
                outcome.passed.push(suite.language);
            }
            Err(err) => {
                outcome
                    .observations
                    .push(Observation::error(format!("{} tests failed: {err:#}", suite.language)));
                outcome.failures.push((suite.language, err));
            }
        }
    }
    Ok(outcome)
}

fn extract(mut outcome: UnitOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "passed": outcome.passed,
        "failed": outcome.failures.iter().map(|(lang, _)| *lang).collect::<Vec<_>>(),
    });
    if outcome.failures.is_empty() {
        return PhaseResult::success(outcome.observations).with_extras(extras);
    }
    let languages: Vec<&str> = outcome.failures.iter().map(|(lang, _)| *lang).collect();
    let summary = languages.join(", ");
    let (_, first) = outcome.failures.remove(0);
    PhaseResult::failure(
        first.context(format!("unit tests failed for {summary}")),
        "",
        format!("Fix the failing {summary} unit tests; the phase log has the full output."),
        outcome.observations,
    )
    .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnitRunner;

impl PhaseRunner for UnitRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase(
            ctx,
            log,
            "unit",
            |log| {
                let suites = detect_suites(env, tools)?;
                run_suites(ctx, tools, log, &suites)
            },
            extract,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, CommandRunner};
    use crate::observe::FailureClass;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    struct NoTools;

    impl CommandRunner for NoTools {
        fn lookup(&self, name: &str) -> Result<PathBuf> {
            Err(CommandError::NotFound { tool: name.to_string() }.into())
        }

        fn run(&self, _: &RunContext, _: &Path, _: &mut Log, name: &str, _: &[String]) -> Result<()> {
            Err(CommandError::NotFound { tool: name.to_string() }.into())
        }

        fn capture(&self, _: &RunContext, _: &Path, _: &mut Log, name: &str, _: &[String]) -> Result<String> {
            Err(CommandError::NotFound { tool: name.to_string() }.into())
        }
    }

    #[test]
    fn nothing_detected_is_a_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::from_scenario_dir(dir.path()).expect("env");
        let tools = Toolbox::with_commands(Arc::new(NoTools));
        let mut log: Vec<u8> = Vec::new();
        let report = UnitRunner.run(&RunContext::background(), &env, &tools, &mut log);
        assert!(report.is_success());
        assert!(report.has_skip());
    }

    #[test]
    fn missing_go_toolchain_is_missing_dependency() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("api")).expect("mkdir");
        fs::write(dir.path().join("api/go.mod"), "module demo").expect("write");
        let env = Environment::from_scenario_dir(dir.path()).expect("env");
        let tools = Toolbox::with_commands(Arc::new(NoTools));
        let mut log: Vec<u8> = Vec::new();
        let report = UnitRunner.run(&RunContext::background(), &env, &tools, &mut log);
        assert_eq!(report.failure_class, Some(FailureClass::MissingDependency));
        assert!(String::from_utf8_lossy(&log).contains("go unit: go test ./..."));
    }

    #[test]
    fn shell_scripts_fall_back_to_syntax_checks() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("scripts")).expect("mkdir");
        fs::write(dir.path().join("scripts/a.sh"), "echo a").expect("write");
        let env = Environment::from_scenario_dir(dir.path()).expect("env");
        let tools = Toolbox::with_commands(Arc::new(NoTools));
        let suites = detect_suites(&env, &tools).expect("detect");
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].steps, vec![("bash".to_string(), args(["-n", "scripts/a.sh"]))]);
    }
}
