//! Sequential phase execution under a shared cancellable deadline.
//!
//! The executor resolves the caller's selection against the catalog, runs each
//! phase under its own derived context, writes the phase pointer, and folds the
//! outcomes into one summary. A failed phase never aborts the run unless the
//! plan asks for fail-fast.
use crate::artifacts::{ensure_dir, now_rfc3339, write_json_atomic, write_phase_pointer};
use crate::catalog::{is_phase_file_name, normalize_phase_name, Catalog, Spec};
use crate::command::Log;
use crate::context::{ContextError, RunContext};
use crate::observe::{classify_error, observations_to_strings, FailureClass, RunReport};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

/// Final state of one phase.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }

    /// Status implied by a runner report.
    pub fn from_report(report: &RunReport) -> Self {
        if report.err.is_some() {
            PhaseStatus::Failed
        } else if report.has_skip() {
            PhaseStatus::Skipped
        } else {
            PhaseStatus::Passed
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable outcome of one phase.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExecutionResult {
    pub name: String,
    pub status: PhaseStatus,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl ExecutionResult {
    fn skipped(name: &str, classification: Option<FailureClass>, remediation: String) -> Self {
        Self {
            name: name.to_string(),
            status: PhaseStatus::Skipped,
            duration_seconds: 0.0,
            log_path: None,
            error: None,
            classification,
            remediation: Some(remediation),
            observations: Vec::new(),
            summary: None,
        }
    }

    fn from_report(name: &str, report: RunReport, elapsed: Duration, log_path: Option<String>) -> Self {
        let status = PhaseStatus::from_report(&report);
        Self {
            name: name.to_string(),
            status,
            duration_seconds: elapsed.as_secs_f64(),
            log_path,
            error: report.err.as_ref().map(|err| format!("{err:#}")),
            classification: report.failure_class,
            remediation: (!report.remediation.trim().is_empty()).then_some(report.remediation),
            observations: observations_to_strings(&report.observations),
            summary: report.summary,
        }
    }
}

/// Caller's selection and policy for one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Explicit order; empty means every catalog phase in weight order.
    pub phases: Vec<String>,
    /// Stop running phases after the first failure.
    pub fail_fast: bool,
    /// Replaces each spec's default timeout when set.
    pub phase_timeout: Option<Duration>,
}

impl ExecutionPlan {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn phases<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phases: phases.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.phase_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub scenario: String,
    pub started_at: String,
    pub duration_seconds: f64,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success: bool,
    pub results: Vec<ExecutionResult>,
}

impl ExecutionSummary {
    /// Process exit code: 0 when nothing failed.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

enum Selected<'a> {
    Known(&'a Spec),
    Unknown(String),
}

fn select<'a>(catalog: &'a Catalog, plan: &ExecutionPlan) -> Result<Vec<Selected<'a>>> {
    if plan.phases.is_empty() {
        return Ok(catalog.all().into_iter().map(Selected::Known).collect());
    }
    let mut selected = Vec::with_capacity(plan.phases.len());
    for raw in &plan.phases {
        let name = normalize_phase_name(raw)
            .ok_or_else(|| anyhow!("phase names must not be empty"))?;
        match catalog.lookup(&name) {
            Some(spec) => selected.push(Selected::Known(spec)),
            None => selected.push(Selected::Unknown(name)),
        }
    }
    Ok(selected)
}

fn supported_list(catalog: &Catalog) -> String {
    catalog
        .all()
        .iter()
        .map(|spec| spec.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run the selected phases for one scenario.
///
/// Only plan errors (empty phase names) are returned as `Err`; every phase
/// outcome, including runner failures, lands in the summary.
pub fn execute(
    ctx: &RunContext,
    catalog: &Catalog,
    env: &Environment,
    tools: &Toolbox,
    plan: &ExecutionPlan,
) -> Result<ExecutionSummary> {
    let selection = select(catalog, plan)?;
    let paths = env.paths();
    let started_at = now_rfc3339()?;
    let run_start = Instant::now();
    let mut results = Vec::with_capacity(selection.len());
    let mut stopped_after: Option<String> = None;

    for selected in selection {
        let spec = match selected {
            Selected::Known(spec) => spec,
            Selected::Unknown(name) => {
                tracing::warn!(phase = name.as_str(), "unknown phase requested");
                let remediation = format!(
                    "Unknown phase '{name}'. Supported phases: {}.",
                    supported_list(catalog)
                );
                let result = ExecutionResult::skipped(&name, None, remediation);
                // Names outside [a-z0-9_-] never become file paths.
                results.push(if is_phase_file_name(&name) {
                    record(env, result)
                } else {
                    result
                });
                continue;
            }
        };

        if let Some(failed) = &stopped_after {
            let remediation =
                format!("Skipped because fail-fast stopped the run after {failed} failed.");
            results.push(record(env, ExecutionResult::skipped(&spec.name, None, remediation)));
            continue;
        }

        if let Some(cause) = ctx.err() {
            let (class, remediation) = match cause {
                ContextError::DeadlineExceeded => (
                    FailureClass::Timeout,
                    "Run deadline expired before this phase started; raise --timeout or select fewer phases.",
                ),
                ContextError::Canceled => (
                    FailureClass::System,
                    "Run was cancelled before this phase started.",
                ),
            };
            results.push(record(
                env,
                ExecutionResult::skipped(&spec.name, Some(class), remediation.to_string()),
            ));
            continue;
        }

        let result = run_one(ctx, spec, env, tools, plan, &paths);
        if result.status == PhaseStatus::Failed && plan.fail_fast {
            stopped_after = Some(result.name.clone());
        }
        results.push(record(env, result));
    }

    let count = |status| results.iter().filter(|r| r.status == status).count();
    let summary = ExecutionSummary {
        scenario: env.scenario_name.clone(),
        started_at,
        duration_seconds: run_start.elapsed().as_secs_f64(),
        passed: count(PhaseStatus::Passed),
        failed: count(PhaseStatus::Failed),
        skipped: count(PhaseStatus::Skipped),
        success: count(PhaseStatus::Failed) == 0,
        results,
    };
    if let Err(err) = write_json_atomic(&paths.run_summary_path(), &summary) {
        tracing::warn!(error = %format!("{err:#}"), "failed to write run summary");
    }
    Ok(summary)
}

fn run_one(
    ctx: &RunContext,
    spec: &Spec,
    env: &Environment,
    tools: &Toolbox,
    plan: &ExecutionPlan,
    paths: &crate::workspace::ScenarioPaths,
) -> ExecutionResult {
    let timeout = plan.phase_timeout.unwrap_or(spec.default_timeout);
    let phase_ctx = ctx.with_timeout(timeout);
    let (mut sink, log_path) = open_phase_log(paths, &spec.name);
    let _ = writeln!(
        sink,
        "== {} ({}) timeout={}s ==",
        spec.name,
        env.scenario_name,
        timeout.as_secs_f64()
    );

    tracing::info!(phase = spec.name.as_str(), timeout_s = timeout.as_secs_f64(), "phase start");
    let start = Instant::now();
    let mut report = spec.runner.run(&phase_ctx, env, tools, &mut *sink);
    let elapsed = start.elapsed();
    // Canceling the derived context releases nothing else; it only marks it done.
    phase_ctx.cancel();

    normalize_report(&mut report);
    let result = ExecutionResult::from_report(&spec.name, report, elapsed, log_path);
    let _ = writeln!(sink, "== {} {} in {:.2}s ==", spec.name, result.status, elapsed.as_secs_f64());
    let _ = sink.flush();
    tracing::info!(
        phase = spec.name.as_str(),
        status = result.status.as_str(),
        elapsed_ms = elapsed.as_millis() as u64,
        "phase finished"
    );
    result
}

/// Keep `err.is_some() == failure_class.is_some()`.
fn normalize_report(report: &mut RunReport) {
    match (&report.err, report.failure_class) {
        (Some(err), None) => report.failure_class = Some(classify_error(err)),
        (None, Some(_)) => report.failure_class = None,
        _ => {}
    }
}

fn open_phase_log(
    paths: &crate::workspace::ScenarioPaths,
    phase: &str,
) -> (Box<Log>, Option<String>) {
    let path = paths.phase_log_path(phase);
    let opened = ensure_dir(&paths.logs_dir()).and_then(|()| {
        File::create(&path).map_err(|err| anyhow!("create {}: {err}", path.display()))
    });
    match opened {
        Ok(file) => (Box::new(file), Some(path.display().to_string())),
        Err(err) => {
            tracing::warn!(phase, error = %format!("{err:#}"), "phase log unavailable; buffering in memory");
            (Box::new(Vec::<u8>::new()), None)
        }
    }
}

fn record(env: &Environment, result: ExecutionResult) -> ExecutionResult {
    if let Err(err) = write_phase_pointer(&env.paths(), &env.scenario_name, &result) {
        tracing::warn!(
            phase = result.name.as_str(),
            error = %format!("{err:#}"),
            "failed to write phase pointer"
        );
    }
    result
}

/// Human-readable rendering of a summary.
pub fn render_summary(summary: &ExecutionSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("Scenario: {}\n", summary.scenario));
    for result in &summary.results {
        out.push_str(&format!(
            "\n[{}] {} ({:.2}s)\n",
            result.status.as_str().to_ascii_uppercase(),
            result.name,
            result.duration_seconds
        ));
        if let Some(error) = &result.error {
            match result.classification {
                Some(class) => out.push_str(&format!("  [{class}] {error}\n")),
                None => out.push_str(&format!("  {error}\n")),
            }
        }
        if let Some(remediation) = &result.remediation {
            out.push_str(&format!("  → {remediation}\n"));
        }
        for line in &result.observations {
            out.push_str(&format!("  {line}\n"));
        }
        if let Some(log_path) = &result.log_path {
            out.push_str(&format!("  log: {log_path}\n"));
        }
    }
    out.push_str(&format!(
        "\n{} passed, {} failed, {} skipped in {:.2}s\n",
        summary.passed, summary.failed, summary.skipped, summary.duration_seconds
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PhaseRunner;
    use crate::observe::Observation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runner<F>(f: F) -> Arc<dyn PhaseRunner>
    where
        F: Fn(&RunContext) -> RunReport + Send + Sync + 'static,
    {
        Arc::new(move |ctx: &RunContext, _: &Environment, _: &Toolbox, _: &mut Log| f(ctx))
    }

    fn catalog_with(specs: Vec<Spec>) -> Catalog {
        let mut catalog = Catalog::new(Duration::from_secs(5));
        for spec in specs {
            catalog.register(spec).expect("register");
        }
        catalog
    }

    fn scenario() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().expect("tempdir");
        let scenario_dir = dir.path().join("demo");
        std::fs::create_dir_all(&scenario_dir).expect("mkdir");
        let env = Environment::from_scenario_dir(&scenario_dir).expect("env");
        (dir, env)
    }

    fn pass() -> Arc<dyn PhaseRunner> {
        runner(|_| RunReport::passed(vec![Observation::success("ok")]))
    }

    fn fail() -> Arc<dyn PhaseRunner> {
        runner(|_| {
            RunReport::failed(
                anyhow!("broken"),
                FailureClass::Misconfiguration,
                "fix it",
                Vec::new(),
            )
        })
    }

    #[test]
    fn maps_status_and_writes_pointers() {
        let (_dir, env) = scenario();
        let catalog = catalog_with(vec![
            Spec::new("alpha", pass()),
            Spec::new("beta", fail()),
            Spec::new("gamma", runner(|_| RunReport::passed(vec![Observation::skip("nothing")]))),
        ]);
        let summary = execute(
            &RunContext::background(),
            &catalog,
            &env,
            &Toolbox::system(),
            &ExecutionPlan::all(),
        )
        .expect("execute");
        let statuses: Vec<PhaseStatus> = summary.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Passed, PhaseStatus::Failed, PhaseStatus::Skipped]
        );
        assert!(!summary.success);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.results[1].classification, Some(FailureClass::Misconfiguration));
        for phase in ["alpha", "beta", "gamma"] {
            assert!(env.paths().phase_pointer_path(phase).is_file(), "{phase}");
        }
        assert!(env.paths().run_summary_path().is_file());
        assert!(summary.results[0].log_path.is_some());
    }

    #[test]
    fn explicit_order_and_unknown_phases() {
        let (_dir, env) = scenario();
        let catalog = catalog_with(vec![Spec::new("alpha", pass()), Spec::new("beta", pass())]);
        let plan = ExecutionPlan::phases([" BETA ", "nope", "alpha"]);
        let summary = execute(&RunContext::background(), &catalog, &env, &Toolbox::system(), &plan)
            .expect("execute");
        let names: Vec<&str> = summary.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "nope", "alpha"]);
        assert_eq!(summary.results[1].status, PhaseStatus::Skipped);
        assert!(summary.results[1]
            .remediation
            .as_deref()
            .is_some_and(|text| text.contains("Supported phases: alpha, beta")));
        assert!(summary.success);
    }

    #[test]
    fn unknown_phase_with_path_characters_writes_no_pointer() {
        let (dir, env) = scenario();
        let catalog = catalog_with(vec![Spec::new("alpha", pass())]);
        let plan = ExecutionPlan::phases(["../../escape", "alpha"]);
        let summary = execute(&RunContext::background(), &catalog, &env, &Toolbox::system(), &plan)
            .expect("execute");
        assert_eq!(summary.results[0].name, "../../escape");
        assert_eq!(summary.results[0].status, PhaseStatus::Skipped);
        assert!(!env.scenario_dir.join("escape.json").exists());
        assert!(!dir.path().join("escape.json").exists());
        let pointers: Vec<String> = std::fs::read_dir(env.paths().phase_results_dir())
            .expect("phase results")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(pointers.iter().all(|name| name == "alpha.json" || name == "summary.json"), "{pointers:?}");
    }

    #[test]
    fn catalog_rejects_names_that_are_not_file_stems() {
        let mut catalog = Catalog::new(Duration::from_secs(5));
        assert!(catalog.register(Spec::new("../up", pass())).is_err());
        assert!(catalog.register(Spec::new("a b", pass())).is_err());
        assert!(catalog.register(Spec::new("ui-smoke_2", pass())).is_ok());
    }

    #[test]
    fn empty_phase_name_is_rejected() {
        let (_dir, env) = scenario();
        let catalog = catalog_with(vec![Spec::new("alpha", pass())]);
        let plan = ExecutionPlan::phases(["  "]);
        assert!(execute(&RunContext::background(), &catalog, &env, &Toolbox::system(), &plan).is_err());
    }

    #[test]
    fn fail_fast_skips_the_rest() {
        let (_dir, env) = scenario();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let counting = runner(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            RunReport::default()
        });
        let catalog = catalog_with(vec![Spec::new("alpha", fail()), Spec::new("beta", counting)]);
        let plan = ExecutionPlan::all().fail_fast(true);
        let summary = execute(&RunContext::background(), &catalog, &env, &Toolbox::system(), &plan)
            .expect("execute");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.results[1].status, PhaseStatus::Skipped);
        assert!(summary.results[1].classification.is_none());
    }

    #[test]
    fn cancellation_skips_remaining_phases_with_class() {
        let (_dir, env) = scenario();
        let root = RunContext::background();
        let cancel_handle = root.clone();
        let cancelling = runner(move |_| {
            cancel_handle.cancel();
            RunReport::default()
        });
        let catalog = catalog_with(vec![Spec::new("alpha", cancelling), Spec::new("beta", pass())]);
        let summary = execute(&root, &catalog, &env, &Toolbox::system(), &ExecutionPlan::all())
            .expect("execute");
        assert_eq!(summary.results[0].status, PhaseStatus::Passed);
        assert_eq!(summary.results[1].status, PhaseStatus::Skipped);
        assert_eq!(summary.results[1].classification, Some(FailureClass::System));

        let expired = RunContext::background().with_timeout(Duration::ZERO);
        let summary = execute(&expired, &catalog, &env, &Toolbox::system(), &ExecutionPlan::all())
            .expect("execute");
        assert!(summary
            .results
            .iter()
            .all(|r| r.classification == Some(FailureClass::Timeout)));
    }

    #[test]
    fn phase_deadline_reaches_runner() {
        let (_dir, env) = scenario();
        let waiting = runner(|ctx| match ctx.sleep(Duration::from_secs(5)) {
            Ok(()) => RunReport::default(),
            Err(err) => RunReport {
                err: Some(err),
                ..RunReport::default()
            },
        });
        let catalog = catalog_with(vec![Spec::new("slow", waiting)]);
        let plan = ExecutionPlan::all().phase_timeout(Some(Duration::from_millis(50)));
        let summary = execute(&RunContext::background(), &catalog, &env, &Toolbox::system(), &plan)
            .expect("execute");
        assert_eq!(summary.results[0].status, PhaseStatus::Failed);
        assert_eq!(summary.results[0].classification, Some(FailureClass::Timeout));
    }

    #[test]
    fn render_lists_class_remediation_and_observations() {
        let summary = ExecutionSummary {
            scenario: "demo".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            duration_seconds: 1.0,
            passed: 0,
            failed: 1,
            skipped: 0,
            success: false,
            results: vec![ExecutionResult {
                name: "structure".to_string(),
                status: PhaseStatus::Failed,
                duration_seconds: 0.5,
                log_path: None,
                error: Some("missing README.md".to_string()),
                classification: Some(FailureClass::Misconfiguration),
                remediation: Some("Add README.md".to_string()),
                observations: vec!["❌ README.md missing".to_string()],
                summary: None,
            }],
        };
        let text = render_summary(&summary);
        let error_at = text.find("[misconfiguration] missing README.md").expect("error line");
        let remediation_at = text.find("Add README.md\n").expect("remediation");
        let observation_at = text.find("❌ README.md missing").expect("observation");
        assert!(error_at < remediation_at && remediation_at < observation_at);
    }
}
