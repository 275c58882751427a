//! Static analysis per language, fanned out on scoped threads.
use crate::adapter::{run_phase_with_expectations, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::{args, display_command, Log};
use crate::config::{load_testing_config, LintSettings};
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::phases::{package_manager, package_scripts};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

/// One language's lint commands, run in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linter {
    pub language: &'static str,
    pub dir: PathBuf,
    pub steps: Vec<(String, Vec<String>)>,
}

/// Linters for the languages present and enabled. Python with no linter
/// installed yields a note instead of a linter.
pub fn detect_linters(
    env: &Environment,
    tools: &Toolbox,
    settings: &LintSettings,
    notes: &mut Vec<Observation>,
) -> Result<Vec<Linter>> {
    let paths = env.paths();
    let mut linters = Vec::new();

    let api = paths.api_dir();
    if settings.go && api.join("go.mod").is_file() {
        let step = if tools.commands.lookup("golangci-lint").is_ok() {
            ("golangci-lint".to_string(), args(["run", "./..."]))
        } else {
            notes.push(Observation::info("golangci-lint not installed; using go vet"));
            ("go".to_string(), args(["vet", "./..."]))
        };
        linters.push(Linter {
            language: "go",
            dir: api,
            steps: vec![step],
        });
    }

    let ui = paths.ui_dir();
    if settings.ui && package_scripts(&ui)?.contains_key("lint") {
        let manager = package_manager(&ui);
        linters.push(Linter {
            language: "ui",
            dir: ui,
            steps: vec![(manager.to_string(), args(["run", "lint"]))],
        });
    }

    let python_dir = [env.scenario_dir.clone(), paths.api_dir()]
        .into_iter()
        .find(|dir| dir.join("pyproject.toml").is_file());
    if let Some(dir) = python_dir.filter(|_| settings.python) {
        let mut steps = Vec::new();
        if tools.commands.lookup("ruff").is_ok() {
            steps.push(("ruff".to_string(), args(["check", "."])));
        }
        if tools.commands.lookup("mypy").is_ok() {
            steps.push(("mypy".to_string(), args(["."])));
        }
        if steps.is_empty() {
            notes.push(Observation::warning("python project found but neither ruff nor mypy is installed"));
        } else {
            linters.push(Linter {
                language: "python",
                dir,
                steps,
            });
        }
    }
    Ok(linters)
}

fn run_linter(ctx: &RunContext, tools: &Toolbox, log: &mut Log, linter: &Linter) -> Result<()> {
    for (program, step_args) in &linter.steps {
        let _ = writeln!(log, "--- {} lint: {}", linter.language, display_command(program, step_args));
        tools.commands.run(ctx, &linter.dir, log, program, step_args)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct LintOutcome {
    pub observations: Vec<Observation>,
    pub passed: Vec<&'static str>,
    pub failures: Vec<(&'static str, anyhow::Error)>,
}

/// Run every linter concurrently; logs are replayed in detection order.
pub fn run_linters(ctx: &RunContext, tools: &Toolbox, log: &mut Log, linters: &[Linter]) -> LintOutcome {
    let mut outcome = LintOutcome::default();
    let results: Vec<(Result<()>, Vec<u8>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = linters
            .iter()
            .map(|linter| {
                scope.spawn(move || {
                    let mut buf: Vec<u8> = Vec::new();
                    let result = run_linter(ctx, tools, &mut buf, linter);
                    (result, buf)
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(linters)
            .map(|(handle, linter)| {
                handle.join().unwrap_or_else(|_| {
                    (Err(anyhow!("{} linter panicked", linter.language)), Vec::new())
                })
            })
            .collect()
    });

    for (linter, (result, buf)) in linters.iter().zip(results) {
        let _ = log.write_all(&buf);
        match result {
            Ok(()) => {
                outcome
                    .observations
                    .push(Observation::success(format!("{} lint clean", linter.language)));
                outcome.passed.push(linter.language);
            }
            Err(err) => {
                outcome
                    .observations
                    .push(Observation::error(format!("{} lint failed: {err:#}", linter.language)));
                outcome.failures.push((linter.language, err));
            }
        }
    }
    outcome
}

fn lint(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    settings: LintSettings,
) -> Result<LintOutcome> {
    let mut notes = Vec::new();
    let linters = detect_linters(env, tools, &settings, &mut notes)?;
    if linters.is_empty() {
        notes.push(Observation::skip("no lintable projects detected"));
        return Ok(LintOutcome {
            observations: notes,
            ..LintOutcome::default()
        });
    }
    ctx.check()?;
    let mut observations = vec![Observation::section("🧹", "Linting")];
    observations.extend(notes);
    let mut outcome = run_linters(ctx, tools, log, &linters);
    observations.append(&mut outcome.observations);
    outcome.observations = observations;
    Ok(outcome)
}

fn extract(mut outcome: LintOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "passed": outcome.passed,
        "failed": outcome.failures.iter().map(|(lang, _)| *lang).collect::<Vec<_>>(),
    });
    if outcome.failures.is_empty() {
        return PhaseResult::success(outcome.observations).with_extras(extras);
    }
    let summary = outcome
        .failures
        .iter()
        .map(|(lang, _)| *lang)
        .collect::<Vec<_>>()
        .join(", ");
    let (_, first) = outcome.failures.remove(0);
    PhaseResult::failure(
        first.context(format!("lint failed for {summary}")),
        "",
        format!("Fix the {summary} lint findings; the phase log lists each one."),
        outcome.observations,
    )
    .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LintRunner;

impl PhaseRunner for LintRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase_with_expectations(
            ctx,
            env,
            log,
            "lint",
            |dir| load_testing_config(dir).map(|config| config.lint),
            |settings, log| lint(ctx, env, tools, log, settings),
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

    /// Only `go` is installed; `go vet` fails.
    struct GoOnly;

    impl CommandRunner for GoOnly {
        fn lookup(&self, name: &str) -> Result<PathBuf> {
            if name == "go" {
                Ok(PathBuf::from("/usr/bin/go"))
            } else {
                Err(CommandError::NotFound { tool: name.to_string() }.into())
            }
        }

        fn run(&self, _: &RunContext, _: &Path, log: &mut Log, name: &str, _: &[String]) -> Result<()> {
            match name {
                "go" => {
                    let _ = writeln!(log, "vet: main.go:3: unreachable code");
                    Err(CommandError::Exit { tool: name.to_string(), code: Some(1) }.into())
                }
                "npm" => Ok(()),
                _ => Err(CommandError::NotFound { tool: name.to_string() }.into()),
            }
        }

        fn capture(&self, _: &RunContext, _: &Path, _: &mut Log, name: &str, _: &[String]) -> Result<String> {
            Err(CommandError::NotFound { tool: name.to_string() }.into())
        }
    }

    fn scaffold(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for (rel, body) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, body).expect("write");
        }
        dir
    }

    #[test]
    fn no_projects_is_a_skip() {
        let dir = scaffold(&[]);
        let env = Environment::from_scenario_dir(dir.path()).expect("env");
        let report = LintRunner.run(
            &RunContext::background(),
            &env,
            &Toolbox::with_commands(Arc::new(GoOnly)),
            &mut Vec::<u8>::new(),
        );
        assert!(report.is_success());
        assert!(report.has_skip());
    }

    #[test]
    fn falls_back_to_go_vet_and_reports_each_language() {
        let dir = scaffold(&[
            ("api/go.mod", "module demo"),
            ("ui/package.json", r#"{"scripts":{"lint":"eslint ."}}"#),
            ("pyproject.toml", "[project]"),
        ]);
        let env = Environment::from_scenario_dir(dir.path()).expect("env");
        let tools = Toolbox::with_commands(Arc::new(GoOnly));
        let mut notes = Vec::new();
        let linters = detect_linters(&env, &tools, &LintSettings::default(), &mut notes).expect("detect");
        let languages: Vec<&str> = linters.iter().map(|linter| linter.language).collect();
        assert_eq!(languages, vec!["go", "ui"]);
        assert_eq!(linters[0].steps[0].1, args(["vet", "./..."]));
        assert_eq!(notes.len(), 2);

        let mut log: Vec<u8> = Vec::new();
        let report = LintRunner.run(&RunContext::background(), &env, &tools, &mut log);
        assert_eq!(report.failure_class, Some(FailureClass::System));
        let text = String::from_utf8_lossy(&log);
        let go_at = text.find("--- go lint").expect("go log");
        let ui_at = text.find("--- ui lint").expect("ui log");
        assert!(go_at < ui_at);
        assert!(text.contains("unreachable code"));
    }
}
