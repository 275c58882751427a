//! Scenario standards audit through `scenario-auditor`.
use crate::adapter::{run_phase, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::{display_command, is_executable, Log};
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const AUDITOR: &str = "scenario-auditor";
pub const FAIL_ON_ENV: &str = "TEST_GENIE_STANDARDS_FAIL_ON";
pub const MIN_SEVERITY_ENV: &str = "TEST_GENIE_STANDARDS_MIN_SEVERITY";
pub const LIMIT_ENV: &str = "TEST_GENIE_STANDARDS_LIMIT";
const DEFAULT_LIMIT: usize = 20;
const DEFAULT_AUDIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Violation severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Violation {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub line_number: u64,
    #[serde(default)]
    pub title: String,
}

impl Violation {
    /// `[HIGH] Bad PRD -> PRD.md:1`
    pub fn render(&self) -> String {
        let title = if self.title.is_empty() { &self.rule_id } else { &self.title };
        let mut line = format!("[{}] {title}", self.severity.to_ascii_uppercase());
        if !self.file_path.is_empty() {
            line.push_str(" -> ");
            line.push_str(&self.file_path);
            if self.line_number > 0 {
                line.push_str(&format!(":{}", self.line_number));
            }
        }
        line
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StandardsSummary {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub by_severity: BTreeMap<String, u64>,
    #[serde(default)]
    pub by_rule: BTreeMap<String, u64>,
    #[serde(default)]
    pub highest_severity: Option<String>,
    #[serde(default)]
    pub top_violations: Vec<Violation>,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub recommended_steps: Vec<String>,
}

impl StandardsSummary {
    /// Worst severity reported, from either the explicit field or the
    /// per-severity counts. Unknown names are ignored.
    pub fn highest(&self) -> Option<Severity> {
        let counted = self
            .by_severity
            .iter()
            .filter(|(_, count)| **count > 0)
            .filter_map(|(name, _)| Severity::parse(name));
        self.highest_severity
            .as_deref()
            .and_then(Severity::parse)
            .into_iter()
            .chain(counted)
            .max()
    }

    /// Counts keyed by normalized severity.
    pub fn normalized_counts(&self) -> BTreeMap<&'static str, u64> {
        let mut counts = BTreeMap::new();
        for (name, count) in &self.by_severity {
            if let Some(severity) = Severity::parse(name) {
                *counts.entry(severity.as_str()).or_insert(0) += count;
            }
        }
        counts
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuditEnvelope {
    #[serde(default)]
    standards: Option<AuditStandards>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditStandards {
    #[serde(default)]
    summary: StandardsSummary,
}

/// Parse auditor stdout. Log lines before the JSON object are ignored, even
/// when they contain braces: each `{` is tried until one starts an envelope
/// with a standards section.
pub fn parse_audit(stdout: &str) -> Result<StandardsSummary> {
    let mut failure: Option<anyhow::Error> = None;
    for (start, _) in stdout.match_indices('{') {
        let mut values =
            serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<AuditEnvelope>();
        match values.next() {
            Some(Ok(AuditEnvelope {
                standards: Some(standards),
            })) => return Ok(standards.summary),
            Some(Ok(_)) => {
                failure = Some(anyhow!("auditor output has no standards section"));
            }
            Some(Err(err)) => {
                if failure.is_none() {
                    failure = Some(anyhow::Error::from(err).context("parse scenario-auditor output"));
                }
            }
            None => {}
        }
    }
    Err(failure.unwrap_or_else(|| anyhow!("auditor printed no JSON")))
}

/// Thresholds read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    pub fail_on: Severity,
    pub min_severity: Severity,
    pub limit: usize,
    pub warnings: Vec<String>,
}

impl Thresholds {
    pub fn from_toolbox(tools: &Toolbox) -> Self {
        let mut warnings = Vec::new();
        let mut severity = |key: &str, default: Severity| match tools.var(key) {
            Some(raw) if !raw.trim().is_empty() => Severity::parse(&raw).unwrap_or_else(|| {
                warnings.push(format!("ignoring {key}={raw}; using {default}"));
                default
            }),
            _ => default,
        };
        let fail_on = severity(FAIL_ON_ENV, Severity::High);
        let min_severity = severity(MIN_SEVERITY_ENV, Severity::Medium);
        let limit = match tools.var(LIMIT_ENV) {
            Some(raw) if !raw.trim().is_empty() => match raw.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    warnings.push(format!("ignoring {LIMIT_ENV}={raw}; using {DEFAULT_LIMIT}"));
                    DEFAULT_LIMIT
                }
            },
            _ => DEFAULT_LIMIT,
        };
        Self {
            fail_on,
            min_severity,
            limit,
            warnings,
        }
    }
}

/// Auditor to invoke: the repo-local build under the app root, else `PATH`.
pub fn resolve_auditor(env: &Environment, tools: &Toolbox) -> String {
    let repo_local = env
        .app_root
        .join("scenarios")
        .join(AUDITOR)
        .join("cli")
        .join(AUDITOR);
    if is_executable(&repo_local) {
        return repo_local.display().to_string();
    }
    if tools.commands.lookup(AUDITOR).is_err() {
        tracing::debug!(tool = AUDITOR, "auditor neither repo-local nor on PATH");
    }
    AUDITOR.to_string()
}

fn audit_args(scenario: &str, ctx: &RunContext, thresholds: &Thresholds) -> Vec<String> {
    let timeout = ctx.remaining().unwrap_or(DEFAULT_AUDIT_TIMEOUT);
    let seconds = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    vec![
        "audit".to_string(),
        scenario.to_string(),
        "--standards-only".to_string(),
        "--json".to_string(),
        "--timeout".to_string(),
        seconds.max(1).to_string(),
        "--limit".to_string(),
        thresholds.limit.to_string(),
        "--min-severity".to_string(),
        thresholds.min_severity.as_str().to_string(),
    ]
}

#[derive(Debug, Default)]
pub struct StandardsOutcome {
    pub observations: Vec<Observation>,
    pub summary: Option<StandardsSummary>,
    pub highest: Option<Severity>,
    pub fail_on: Option<Severity>,
    pub failure: Option<(anyhow::Error, &'static str, String)>,
}

fn audit(ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> Result<StandardsOutcome> {
    let thresholds = Thresholds::from_toolbox(tools);
    let mut outcome = StandardsOutcome {
        fail_on: Some(thresholds.fail_on),
        ..StandardsOutcome::default()
    };
    outcome
        .observations
        .push(Observation::section("📏", "Auditing scenario standards"));
    for warning in &thresholds.warnings {
        outcome.observations.push(Observation::warning(warning.clone()));
    }

    let auditor = resolve_auditor(env, tools);
    let audit_args = audit_args(&env.scenario_name, ctx, &thresholds);
    let rerun = display_command(AUDITOR, &audit_args);
    let stdout = match tools
        .commands
        .capture(ctx, &env.scenario_dir, log, &auditor, &audit_args)
    {
        Ok(stdout) => stdout,
        Err(err) => {
            outcome
                .observations
                .push(Observation::error(format!("scenario-auditor failed: {err:#}")));
            outcome.failure = Some((
                err.context("run scenario-auditor"),
                "",
                format!("Make sure {AUDITOR} is built and reachable, then re-run: {rerun}"),
            ));
            return Ok(outcome);
        }
    };
    let summary = match parse_audit(&stdout) {
        Ok(summary) => summary,
        Err(err) => {
            outcome.failure = Some((
                err,
                "system",
                format!("Inspect the auditor output by re-running: {rerun}"),
            ));
            return Ok(outcome);
        }
    };

    let highest = summary.highest();
    outcome.observations.push(Observation::info(format!(
        "{} violation(s); highest severity {}",
        summary.total,
        highest.map(Severity::as_str).unwrap_or("none")
    )));
    let shown = summary
        .top_violations
        .iter()
        .filter(|violation| {
            Severity::parse(&violation.severity).is_some_and(|s| s >= thresholds.min_severity)
        })
        .take(thresholds.limit);
    for violation in shown {
        let blocking = Severity::parse(&violation.severity).is_some_and(|s| s >= thresholds.fail_on);
        outcome.observations.push(if blocking {
            Observation::error(violation.render())
        } else {
            Observation::warning(violation.render())
        });
    }
    if let Some(artifact) = summary.artifact.as_deref().filter(|a| !a.is_empty()) {
        outcome
            .observations
            .push(Observation::info(format!("full report: {artifact}")));
    }

    if let Some(worst) = highest.filter(|worst| *worst >= thresholds.fail_on) {
        let mut remediation = format!("Fix the {worst} violations, then re-run: {rerun}");
        for step in &summary.recommended_steps {
            remediation.push_str("\n  - ");
            remediation.push_str(step);
        }
        outcome.failure = Some((
            anyhow!(
                "standards violations at {worst} meet fail_on={} ({FAIL_ON_ENV})",
                thresholds.fail_on
            ),
            "misconfiguration",
            remediation,
        ));
    } else {
        outcome.observations.push(Observation::success(format!(
            "no violations at or above {}",
            thresholds.fail_on
        )));
    }
    outcome.highest = highest;
    outcome.summary = Some(summary);
    Ok(outcome)
}

fn extract(outcome: StandardsOutcome) -> PhaseResult<Observation> {
    let extras = outcome.summary.as_ref().map(|summary| {
        json!({
            "total": summary.total,
            "by_severity": summary.normalized_counts(),
            "by_rule": summary.by_rule,
            "highest_severity": outcome.highest.map(Severity::as_str),
            "fail_on": outcome.fail_on.map(Severity::as_str),
            "artifact": summary.artifact,
        })
    });
    let result = match outcome.failure {
        None => PhaseResult::success(outcome.observations),
        Some((err, class, remediation)) => {
            PhaseResult::failure(err, class, remediation, outcome.observations)
        }
    };
    match extras {
        Some(extras) => result.with_extras(extras),
        None => result,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardsRunner;

impl PhaseRunner for StandardsRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase(ctx, log, "standards", |log| audit(ctx, env, tools, log), extract)
    }
}
