//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use test_genie::command::{CommandError, CommandRunner, Log};
use test_genie::{RunContext, Toolbox};

/// In-process stand-in for every external tool.
///
/// Tools are installed unless listed in `missing`; captures answer from
/// `outputs` and exit 1 otherwise. Every run and capture is recorded.
#[derive(Default)]
pub struct StubCommands {
    missing: BTreeSet<String>,
    outputs: BTreeMap<String, String>,
    run_delay: Duration,
    calls: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
}

impl StubCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing(mut self, tool: &str) -> Self {
        self.missing.insert(tool.to_string());
        self
    }

    pub fn output(mut self, tool: &str, stdout: &str) -> Self {
        self.outputs.insert(tool.to_string(), stdout.to_string());
        self
    }

    pub fn run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// From now on, invocations whose `tool arg...` line contains `needle`
    /// exit 1.
    pub fn fail_calls_containing(&self, needle: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(needle.to_string());
        }
    }

    /// Append an event from another collaborator to the call timeline.
    pub fn note(&self, event: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(event.to_string());
        }
    }

    /// Recorded invocations, `tool arg...`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Record the invocation; `Err` when it matches a failing needle.
    fn record(&self, name: &str, args: &[String]) -> Result<()> {
        let mut line = name.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        let fails = self
            .failing
            .lock()
            .map(|failing| failing.iter().any(|needle| line.contains(needle.as_str())))
            .unwrap_or(false);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line);
        }
        if fails {
            return Err(CommandError::Exit {
                tool: name.to_string(),
                code: Some(1),
            }
            .into());
        }
        Ok(())
    }

    fn not_found(name: &str) -> anyhow::Error {
        CommandError::NotFound {
            tool: name.to_string(),
        }
        .into()
    }
}

impl CommandRunner for StubCommands {
    fn lookup(&self, name: &str) -> Result<PathBuf> {
        if self.missing.contains(name) {
            return Err(Self::not_found(name));
        }
        Ok(PathBuf::from("/stub/bin").join(name))
    }

    fn run(&self, ctx: &RunContext, _: &Path, _: &mut Log, name: &str, args: &[String]) -> Result<()> {
        ctx.check()?;
        let recorded = self.record(name, args);
        if self.missing.contains(name) {
            return Err(Self::not_found(name));
        }
        recorded?;
        let started = std::time::Instant::now();
        while started.elapsed() < self.run_delay {
            ctx.check()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn capture(&self, ctx: &RunContext, _: &Path, _: &mut Log, name: &str, args: &[String]) -> Result<String> {
        ctx.check()?;
        let recorded = self.record(name, args);
        if self.missing.contains(name) {
            return Err(Self::not_found(name));
        }
        recorded?;
        match self.outputs.get(name) {
            Some(stdout) => Ok(stdout.clone()),
            None => Err(CommandError::Exit {
                tool: name.to_string(),
                code: Some(1),
            }
            .into()),
        }
    }
}

/// Toolbox around `stub` with the run-affecting variables pinned.
pub fn toolbox(stub: Arc<StubCommands>) -> Toolbox {
    Toolbox::with_commands(stub)
        .unset_var("TEST_GENIE_SKIP_PLAYBOOKS")
        .unset_var("TEST_GENIE_BAS_URL")
        .unset_var("TEST_GENIE_STANDARDS_FAIL_ON")
        .unset_var("TEST_GENIE_STANDARDS_MIN_SEVERITY")
        .unset_var("TEST_GENIE_STANDARDS_LIMIT")
}

/// A scenario directory named `name` inside a temp dir.
pub struct Scenario {
    _root: TempDir,
    pub dir: PathBuf,
}

impl Scenario {
    /// Empty scenario directory.
    pub fn empty(name: &str) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("scenarios").join(name);
        fs::create_dir_all(&dir).expect("mkdir scenario");
        Self { _root: root, dir }
    }

    /// Scenario with every canonical directory and file plus a
    /// cross-platform CLI layout and a matching manifest.
    pub fn canonical(name: &str) -> Self {
        let scenario = Self::empty(name);
        for dir in ["api", "cli", "docs", "requirements", "test/phases", "ui", ".vrooli"] {
            fs::create_dir_all(scenario.dir.join(dir)).expect("mkdir");
        }
        scenario.write("README.md", &format!("# {name}\n"));
        scenario.write("PRD.md", "# PRD\n");
        scenario.write("Makefile", "test:\n\ttest-genie run --scenario-dir .\n");
        scenario.write(
            ".vrooli/service.json",
            &format!(r#"{{"service":{{"name":"{name}"}}}}"#),
        );
        scenario.write("cli/main.go", "package main\n\nfunc main() {}\n");
        scenario.write("cli/go.mod", &format!("module {name}\n"));
        scenario.write("cli/install.sh", "#!/usr/bin/env bash\n");
        scenario
    }

    pub fn write(&self, rel: &str, body: &str) {
        let path = self.dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir parent");
        }
        fs::write(&path, body).expect("write file");
    }

    pub fn remove_dir(&self, rel: &str) {
        fs::remove_dir_all(self.dir.join(rel)).expect("remove dir");
    }

    pub fn read_json(&self, rel: &str) -> serde_json::Value {
        let bytes = fs::read(self.dir.join(rel)).expect("read json");
        serde_json::from_slice(&bytes).expect("parse json")
    }
}
