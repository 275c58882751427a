//! Scenario layout validation.
use crate::adapter::{run_phase_with_expectations, PhaseResult, StandardObservation};
use crate::catalog::PhaseRunner;
use crate::command::Log;
use crate::config::{load_testing_config, StructureSettings};
use crate::context::RunContext;
use crate::observe::{ObservationKind, RunReport};
use crate::phases::cli_approach::{self, CliApproachKind};
use crate::phases::{display_rel, walk_files};
use crate::toolbox::Toolbox;
use crate::workspace::{load_service_manifest, Environment};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::fs;
use std::path::Path;

pub const REQUIRED_DIRS: [&str; 7] = ["api", "cli", "docs", "requirements", "test/phases", "ui", ".vrooli"];
pub const REQUIRED_FILES: [&str; 4] = ["README.md", "PRD.md", "Makefile", ".vrooli/service.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Heading,
    Pass,
    Warn,
    Fail,
    Note,
}

#[derive(Debug, Clone)]
pub struct StructureObservation {
    level: Level,
    icon: Option<&'static str>,
    message: String,
}

impl StructureObservation {
    fn heading(icon: &'static str, message: &str) -> Self {
        Self {
            level: Level::Heading,
            icon: Some(icon),
            message: message.to_string(),
        }
    }

    fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            icon: None,
            message: message.into(),
        }
    }
}

impl StandardObservation for StructureObservation {
    fn kind(&self) -> ObservationKind {
        match self.level {
            Level::Heading => ObservationKind::Section,
            Level::Pass => ObservationKind::Success,
            Level::Warn => ObservationKind::Warning,
            Level::Fail => ObservationKind::Error,
            Level::Note => ObservationKind::Info,
        }
    }

    fn icon(&self) -> Option<&str> {
        self.icon
    }

    fn message(&self) -> &str {
        &self.message
    }
}

/// Everything one structure pass found.
#[derive(Debug, Default)]
pub struct StructureOutcome {
    pub observations: Vec<StructureObservation>,
    pub issues: Vec<String>,
    pub remediations: Vec<String>,
    pub checked_dirs: usize,
    pub checked_files: usize,
    pub checked_json: usize,
    pub cli_approach: Option<&'static str>,
}

impl StructureOutcome {
    fn fail(&mut self, issue: String, remediation: String) {
        self.observations
            .push(StructureObservation::new(Level::Fail, issue.clone()));
        self.issues.push(issue);
        self.remediations.push(remediation);
    }
}

fn expected<'a>(base: &'a [&'a str], extra: &'a [String], excluded: &'a [String]) -> Vec<&'a str> {
    let normalize = |value: &str| value.trim().trim_end_matches('/').to_string();
    let excluded: Vec<String> = excluded.iter().map(|e| normalize(e.as_str())).collect();
    base.iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .filter(|entry| !entry.trim().is_empty())
        .filter(|entry| !excluded.contains(&normalize(*entry)))
        .collect()
}

/// Run every structure check against `scenario_dir`.
pub fn validate(
    scenario_dir: &Path,
    scenario_name: &str,
    settings: &StructureSettings,
) -> Result<StructureOutcome> {
    let mut outcome = StructureOutcome::default();

    outcome
        .observations
        .push(StructureObservation::heading("📁", "Checking required directories"));
    for dir in expected(&REQUIRED_DIRS, &settings.additional_dirs, &settings.exclude_dirs) {
        outcome.checked_dirs += 1;
        if scenario_dir.join(dir).is_dir() {
            outcome
                .observations
                .push(StructureObservation::new(Level::Pass, format!("{dir}/")));
        } else {
            outcome.fail(
                format!("missing directory {dir}/"),
                format!("Create {dir}/ or list it in structure.exclude_dirs."),
            );
        }
    }

    outcome
        .observations
        .push(StructureObservation::heading("📄", "Checking required files"));
    for file in expected(&REQUIRED_FILES, &settings.additional_files, &settings.exclude_files) {
        outcome.checked_files += 1;
        if scenario_dir.join(file).is_file() {
            outcome
                .observations
                .push(StructureObservation::new(Level::Pass, file));
        } else {
            outcome.fail(
                format!("missing file {file}"),
                format!("Add {file} or list it in structure.exclude_files."),
            );
        }
    }

    if settings.validations.service_json_name_matches_directory
        && scenario_dir.join(".vrooli/service.json").is_file()
    {
        outcome
            .observations
            .push(StructureObservation::heading("🏷️", "Checking service manifest"));
        match load_service_manifest(scenario_dir) {
            Ok(manifest) if manifest.service.name == scenario_name => outcome
                .observations
                .push(StructureObservation::new(
                    Level::Pass,
                    format!("service.name matches directory ({scenario_name})"),
                )),
            Ok(manifest) => outcome.fail(
                format!(
                    "service.name {:?} does not match directory {scenario_name:?}",
                    manifest.service.name
                ),
                format!("Set service.name to \"{scenario_name}\" in .vrooli/service.json."),
            ),
            Err(err) => outcome.fail(
                format!("cannot read .vrooli/service.json: {err:#}"),
                "Fix the JSON in .vrooli/service.json.".to_string(),
            ),
        }
    }

    if settings.validations.check_json_validity {
        outcome
            .observations
            .push(StructureObservation::heading("🧾", "Checking JSON files"));
        let files = walk_files(scenario_dir, &settings.exclude_dirs, |path| {
            path.extension().is_some_and(|ext| ext == "json")
        })?;
        let mut broken = 0;
        for path in &files {
            outcome.checked_json += 1;
            let rel = display_rel(scenario_dir, path);
            if settings
                .exclude_files
                .iter()
                .any(|excluded| excluded.trim() == rel)
            {
                continue;
            }
            let parsed = fs::read(path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<serde_json::Value>(&bytes).map_err(anyhow::Error::from)
                });
            if let Err(err) = parsed {
                broken += 1;
                outcome.fail(
                    format!("invalid JSON in {rel}: {err}"),
                    format!("Fix the JSON syntax in {rel}."),
                );
            }
        }
        if broken == 0 {
            outcome.observations.push(StructureObservation::new(
                Level::Pass,
                format!("{} JSON file(s) parse", files.len()),
            ));
        }
    }

    outcome
        .observations
        .push(StructureObservation::heading("🖥️", "Checking CLI layout"));
    let approach = cli_approach::detect(scenario_dir, scenario_name);
    outcome.cli_approach = Some(approach.kind.as_str());
    for warning in &approach.warnings {
        outcome
            .observations
            .push(StructureObservation::new(Level::Warn, warning.clone()));
    }
    match approach.kind {
        CliApproachKind::Unknown => outcome.fail(
            "CLI layout not recognized".to_string(),
            approach.remediation.clone().unwrap_or_default(),
        ),
        kind if !approach.missing.is_empty() => outcome.fail(
            format!("{} CLI is missing {}", kind.as_str(), approach.missing.join(", ")),
            approach.remediation.clone().unwrap_or_default(),
        ),
        kind => outcome.observations.push(StructureObservation::new(
            Level::Note,
            format!("{} CLI detected", kind.as_str()),
        )),
    }

    if outcome.issues.is_empty() {
        outcome
            .observations
            .push(StructureObservation::new(Level::Pass, "Structure validation complete"));
    }
    Ok(outcome)
}

fn extract(outcome: StructureOutcome) -> PhaseResult<StructureObservation> {
    let extras = json!({
        "directories_checked": outcome.checked_dirs,
        "files_checked": outcome.checked_files,
        "json_files_checked": outcome.checked_json,
        "cli_approach": outcome.cli_approach,
        "issues": outcome.issues.len(),
    });
    if outcome.issues.is_empty() {
        return PhaseResult::success(outcome.observations).with_extras(extras);
    }
    let error = anyhow!("structure validation failed: {}", outcome.issues.join("; "));
    PhaseResult::failure(
        error,
        "misconfiguration",
        outcome.remediations.join(" "),
        outcome.observations,
    )
    .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StructureRunner;

impl PhaseRunner for StructureRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, _tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase_with_expectations(
            ctx,
            env,
            log,
            "structure",
            |dir| load_testing_config(dir).map(|config| config.structure),
            |settings, _log| validate(&env.scenario_dir, &env.scenario_name, &settings),
            extract,
        )
    }
}
