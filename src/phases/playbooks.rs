//! Registered UI playbooks executed through the workflow service.
use crate::adapter::{run_phase_with_expectations, PhaseResult};
use crate::bas::WorkflowRequest;
use crate::catalog::PhaseRunner;
use crate::command::Log;
use crate::config::{load_testing_config, PlaybooksSettings};
use crate::context::RunContext;
use crate::isolation::{apply_playbooks_seed, SeedSession};
use crate::observe::{Observation, RunReport};
use crate::toolbox::Toolbox;
use crate::vrooli::scenario_port;
use crate::workspace::Environment;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const SKIP_ENV: &str = "TEST_GENIE_SKIP_PLAYBOOKS";
pub const BAS_URL_ENV: &str = "TEST_GENIE_BAS_URL";
const BAS_SCENARIO: &str = "browser-automation-studio";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaybookEntry {
    #[serde(alias = "path")]
    pub file: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    playbooks: Option<Vec<PlaybookEntry>>,
    #[serde(default)]
    deprecated_playbooks: Option<Vec<PlaybookEntry>>,
}

/// Parsed `test/playbooks/registry.json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybookRegistry {
    pub playbooks: Vec<PlaybookEntry>,
    /// Entries came from the `deprecated_playbooks` key.
    pub used_deprecated_key: bool,
}

pub fn parse_registry(bytes: &[u8]) -> Result<PlaybookRegistry> {
    let raw: RawRegistry = serde_json::from_slice(bytes)?;
    Ok(match (raw.playbooks, raw.deprecated_playbooks) {
        (Some(playbooks), _) => PlaybookRegistry {
            playbooks,
            used_deprecated_key: false,
        },
        (None, Some(playbooks)) => PlaybookRegistry {
            playbooks,
            used_deprecated_key: true,
        },
        (None, None) => PlaybookRegistry::default(),
    })
}

pub fn load_registry(path: &Path) -> Result<Option<PlaybookRegistry>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    parse_registry(&bytes)
        .with_context(|| format!("parse {}", path.display()))
        .map(Some)
}

#[derive(Debug, Default)]
pub struct PlaybooksOutcome {
    pub observations: Vec<Observation>,
    pub passed: usize,
    pub failed: Vec<String>,
    pub run_id: Option<String>,
    pub failure: Option<(anyhow::Error, &'static str, String)>,
}

impl PlaybooksOutcome {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            observations: vec![Observation::skip(message)],
            ..Self::default()
        }
    }

    fn fail(mut self, err: anyhow::Error, class: &'static str, remediation: impl Into<String>) -> Self {
        self.observations
            .push(Observation::error(format!("{err:#}")));
        self.failure = Some((err, class, remediation.into()));
        self
    }
}

fn resolve_ui_url(ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> Result<String> {
    if let Some(url) = &env.ui_url {
        return Ok(url.trim_end_matches('/').to_string());
    }
    let port = scenario_port(ctx, tools, &env.scenario_dir, log, &env.scenario_name, "UI_PORT")?;
    Ok(format!("http://localhost:{port}"))
}

fn resolve_bas_url(ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> Result<String> {
    if let Some(url) = tools.var(BAS_URL_ENV).filter(|url| !url.trim().is_empty()) {
        return Ok(url.trim_end_matches('/').to_string());
    }
    let port = scenario_port(ctx, tools, &env.scenario_dir, log, BAS_SCENARIO, "API_PORT")?;
    Ok(format!("http://localhost:{port}"))
}

fn execute(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    settings: PlaybooksSettings,
) -> Result<PlaybooksOutcome> {
    let paths = env.paths();
    if !paths.ui_dir().is_dir() {
        return Ok(PlaybooksOutcome::skipped("ui/ directory missing; no playbooks to run"));
    }
    if tools.var_truthy(SKIP_ENV) {
        return Ok(PlaybooksOutcome::skipped(format!("{SKIP_ENV} is set; playbooks skipped")));
    }
    if !settings.enabled {
        return Ok(PlaybooksOutcome::skipped("playbooks disabled in .vrooli/testing.json"));
    }

    let mut outcome = PlaybooksOutcome::default();
    let registry_path = paths.playbook_registry_path();
    let registry = match load_registry(&registry_path) {
        Ok(Some(registry)) => registry,
        Ok(None) => {
            return Ok(PlaybooksOutcome::skipped(
                "test/playbooks/registry.json missing; no playbooks registered",
            ))
        }
        Err(err) => {
            return Ok(outcome.fail(
                err,
                "misconfiguration",
                "Fix the JSON in test/playbooks/registry.json.",
            ))
        }
    };
    if registry.used_deprecated_key {
        outcome.observations.push(Observation::warning(
            "registry uses deprecated_playbooks; rename the key to playbooks",
        ));
    }
    if registry.playbooks.is_empty() {
        outcome
            .observations
            .push(Observation::skip("registry lists no playbooks"));
        return Ok(outcome);
    }

    ctx.check()?;
    let ui_url = match resolve_ui_url(ctx, env, tools, log) {
        Ok(url) => url,
        Err(err) => {
            return Ok(outcome.fail(
                err.context("resolve UI URL"),
                "",
                format!("Start the scenario (vrooli scenario start {}) or pass --ui-url.", env.scenario_name),
            ))
        }
    };
    let bas_url = match resolve_bas_url(ctx, env, tools, log) {
        Ok(url) => url,
        Err(err) => {
            return Ok(outcome.fail(
                err.context("resolve browser-automation-studio API"),
                "missing_dependency",
                format!("Start {BAS_SCENARIO} or set {BAS_URL_ENV}."),
            ))
        }
    };
    outcome
        .observations
        .push(Observation::info(format!("UI {ui_url}; workflows via {bas_url}")));

    let mut session: Option<SeedSession> = None;
    if settings.seeds.enabled && paths.seeds_dir().is_dir() {
        match apply_playbooks_seed(ctx, env, tools, log, settings.seeds.retain) {
            Ok(applied) => {
                outcome.run_id = Some(applied.run_id.clone());
                outcome
                    .observations
                    .push(Observation::success(format!("seeded isolated run {}", applied.run_id)));
                session = Some(applied);
            }
            Err(err) => {
                return Ok(outcome.fail(
                    err.context("apply playbook seeds"),
                    "",
                    "Check bas/seeds and the isolation prerequisites (docker, psql).",
                ))
            }
        }
    }
    let seed_state = session
        .as_ref()
        .and_then(SeedSession::seed_state_value)
        .cloned();

    outcome
        .observations
        .push(Observation::section("🎭", "Running playbooks"));
    let mut first_error = None;
    for entry in &registry.playbooks {
        if let Err(err) = ctx.check() {
            first_error.get_or_insert(err);
            break;
        }
        match run_playbook(ctx, env, tools, entry, &bas_url, &ui_url, seed_state.clone()) {
            Ok(()) => {
                outcome.passed += 1;
                outcome
                    .observations
                    .push(Observation::success(entry.file.clone()));
            }
            Err(err) => {
                outcome
                    .observations
                    .push(Observation::error(format!("{}: {err:#}", entry.file)));
                outcome.failed.push(entry.file.clone());
                first_error.get_or_insert(err);
            }
        }
    }

    if let Some(mut session) = session {
        if let Err(err) = session.cleanup(log) {
            let _ = writeln!(log, "seed cleanup failed: {err:#}");
            outcome
                .observations
                .push(Observation::warning(format!("seed cleanup failed: {err:#}")));
        }
    }

    if let Some(err) = first_error {
        let count = outcome.failed.len();
        return Ok(outcome.fail(
            err.context(format!("{count} playbook(s) failed")),
            "",
            "Open the failing workflow in browser-automation-studio and fix the playbook or the UI.",
        ));
    }
    Ok(outcome)
}

fn run_playbook(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    entry: &PlaybookEntry,
    bas_url: &str,
    ui_url: &str,
    seed_state: Option<Value>,
) -> Result<()> {
    let path = env.scenario_dir.join(&entry.file);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let flow_definition: Value =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    let request = WorkflowRequest {
        base_url: bas_url.to_string(),
        name: entry.file.clone(),
        flow_definition,
        start_url: ui_url.to_string(),
        seed_state,
    };
    let result = tools.workflows.execute(ctx, &request)?;
    if result.succeeded() {
        return Ok(());
    }
    Err(anyhow!(
        "workflow {} ended {}{}",
        result.execution_id.as_deref().unwrap_or("(no id)"),
        if result.status.is_empty() { "unsuccessfully" } else { result.status.as_str() },
        result
            .error
            .as_deref()
            .map(|error| format!(": {error}"))
            .unwrap_or_default()
    ))
}

fn extract(outcome: PlaybooksOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "passed": outcome.passed,
        "failed": outcome.failed,
        "run_id": outcome.run_id,
    });
    match outcome.failure {
        None => PhaseResult::success(outcome.observations).with_extras(extras),
        Some((err, class, remediation)) => {
            PhaseResult::failure(err, class, remediation, outcome.observations).with_extras(extras)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybooksRunner;

impl PhaseRunner for PlaybooksRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase_with_expectations(
            ctx,
            env,
            log,
            "playbooks",
            |dir| load_testing_config(dir).map(|config| config.playbooks),
            |settings, log| execute(ctx, env, tools, log, settings),
            extract,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_prefers_current_key() {
        let registry = parse_registry(
            br#"{"playbooks":[{"file":"a.json"}],"deprecated_playbooks":[{"file":"b.json"}]}"#,
        )
        .expect("parse");
        assert_eq!(registry.playbooks.len(), 1);
        assert_eq!(registry.playbooks[0].file, "a.json");
        assert!(!registry.used_deprecated_key);
    }

    #[test]
    fn registry_falls_back_to_deprecated_key() {
        let registry =
            parse_registry(br#"{"deprecated_playbooks":[{"path":"old.json"}]}"#).expect("parse");
        assert_eq!(registry.playbooks[0].file, "old.json");
        assert!(registry.used_deprecated_key);
        assert!(parse_registry(b"{\"playbooks\": [").is_err());
    }
}
