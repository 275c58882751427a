//! UI smoke: load the scenario's UI once and record what came back.
//!
//! The browser side sits behind [`SmokeDriver`]; the stock driver is a plain
//! HTTP fetch that demands a 2xx response with a non-empty document.
use crate::adapter::{run_phase_with_expectations, PhaseResult};
use crate::artifacts::{now_rfc3339, write_json_atomic};
use crate::catalog::PhaseRunner;
use crate::command::Log;
use crate::config::{load_testing_config, UiSmokeSettings};
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::phases::{display_rel, walk_files};
use crate::toolbox::Toolbox;
use crate::vrooli::{scenario_port, scenario_status, start_scenario};
use crate::workspace::Environment;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// What one page load produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmokeOutcome {
    pub url: String,
    pub status: u16,
    pub bytes: usize,
    pub title: Option<String>,
}

/// Loads a URL the way a browser would for a smoke check.
pub trait SmokeDriver: Send + Sync {
    fn visit(&self, ctx: &RunContext, url: &str, timeout: Duration) -> Result<SmokeOutcome>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSmokeDriver;

impl SmokeDriver for HttpSmokeDriver {
    fn visit(&self, ctx: &RunContext, url: &str, timeout: Duration) -> Result<SmokeOutcome> {
        ctx.check()?;
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        let mut response = agent.get(url).call().with_context(|| format!("GET {url}"))?;
        let status = response.status();
        let body = response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read response from {url}"))?;
        if !status.is_success() {
            return Err(anyhow!("UI answered HTTP {} at {url}", status.as_u16()));
        }
        if body.trim().is_empty() {
            return Err(anyhow!("UI returned an empty document at {url}"));
        }
        Ok(SmokeOutcome {
            url: url.to_string(),
            status: status.as_u16(),
            bytes: body.len(),
            title: page_title(&body),
        })
    }
}

fn page_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = lower[start..].find("</title>")? + start;
    let title = html[start..end].trim();
    (!title.is_empty()).then(|| title.to_string())
}

fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("stat {}", path.display()))
}

/// Newest source file when it is newer than the built `dist/index.html`.
///
/// `None` when there is no built bundle or no `src/` to compare against.
pub fn stale_bundle_source(ui_dir: &Path) -> Result<Option<PathBuf>> {
    let index = ui_dir.join("dist").join("index.html");
    let src = ui_dir.join("src");
    if !index.is_file() || !src.is_dir() {
        return Ok(None);
    }
    let built = modified(&index)?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for file in walk_files(&src, &[], |_| true)? {
        let at = modified(&file)?;
        match &newest {
            Some((best, _)) if *best >= at => {}
            _ => newest = Some((at, file)),
        }
    }
    Ok(newest.filter(|(at, _)| *at > built).map(|(_, file)| file))
}

#[derive(Debug, Serialize)]
struct SmokeArtifact<'a> {
    scenario: &'a str,
    checked_at: String,
    url: &'a str,
    success: bool,
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a SmokeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SmokeRun {
    pub observations: Vec<Observation>,
    pub outcome: Option<SmokeOutcome>,
    pub artifact: Option<String>,
    /// `diagnostics.ui_smoke` from the lifecycle status, when reported.
    pub previous: Option<serde_json::Value>,
    pub failure: Option<(anyhow::Error, &'static str, String)>,
}

impl SmokeRun {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            observations: vec![Observation::skip(message)],
            ..Self::default()
        }
    }
}

/// UI base URL from the lifecycle CLI, starting the scenario first when its
/// status says it is not running.
fn resolve_ui_url(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    run: &mut SmokeRun,
) -> Result<String> {
    let dir = &env.scenario_dir;
    let name = &env.scenario_name;
    match scenario_status(ctx, tools, dir, log, name) {
        Ok(status) => {
            run.previous = status.diagnostics.ui_smoke;
            if let Some(state) = status.status.filter(|state| state != "running") {
                run.observations
                    .push(Observation::info(format!("scenario is {state}; starting it")));
                start_scenario(ctx, tools, dir, log, name)
                    .with_context(|| format!("start scenario {name}"))?;
            }
        }
        Err(err) => {
            tracing::debug!(error = %format!("{err:#}"), "scenario status unavailable");
        }
    }
    let port = scenario_port(ctx, tools, dir, log, name, "UI_PORT")?;
    Ok(format!("http://localhost:{port}"))
}

fn smoke(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    settings: UiSmokeSettings,
) -> Result<SmokeRun> {
    if !settings.enabled {
        return Ok(SmokeRun::skipped("ui smoke disabled in .vrooli/testing.json"));
    }
    let paths = env.paths();
    let ui_dir = paths.ui_dir();
    if !ui_dir.is_dir() {
        return Ok(SmokeRun::skipped("ui/ directory missing; nothing to smoke"));
    }

    let mut run = SmokeRun::default();
    run.observations
        .push(Observation::section("💨", "UI smoke"));
    if let Some(source) = stale_bundle_source(&ui_dir)? {
        let rel = display_rel(&env.scenario_dir, &source);
        run.observations
            .push(Observation::error(format!("{rel} is newer than ui/dist/index.html")));
        run.failure = Some((
            anyhow!("stale UI bundle: {rel} changed after the last build"),
            "misconfiguration",
            format!(
                "rebuild or restart the UI (vrooli scenario restart {}) so the served bundle matches ui/src",
                env.scenario_name
            ),
        ));
        return Ok(run);
    }

    let url = match &env.ui_url {
        Some(url) => url.clone(),
        None => match resolve_ui_url(ctx, env, tools, log, &mut run) {
            Ok(url) => url,
            Err(err) => {
                run.failure = Some((
                    err.context("resolve UI URL"),
                    "",
                    format!(
                        "Start the scenario (vrooli scenario start {}) or pass --ui-url.",
                        env.scenario_name
                    ),
                ));
                return Ok(run);
            }
        },
    };

    let configured = Duration::from_millis(settings.timeout_ms);
    let timeout = ctx
        .remaining()
        .map_or(configured, |remaining| remaining.min(configured));
    let started = Instant::now();
    let visit = tools.smoke.visit(ctx, &url, timeout);
    let elapsed = started.elapsed();

    let artifact = SmokeArtifact {
        scenario: &env.scenario_name,
        checked_at: now_rfc3339()?,
        url: &url,
        success: visit.is_ok(),
        duration_ms: elapsed.as_millis(),
        outcome: visit.as_ref().ok(),
        error: visit.as_ref().err().map(|err| format!("{err:#}")),
    };
    let artifact_path = paths.ui_smoke_dir().join("latest.json");
    match write_json_atomic(&artifact_path, &artifact) {
        Ok(()) => run.artifact = Some(display_rel(&env.scenario_dir, &artifact_path)),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "ui smoke artifact not written");
            run.observations
                .push(Observation::warning(format!("could not write smoke artifact: {err:#}")));
        }
    }

    match visit {
        Ok(outcome) => {
            run.observations.push(Observation::success(format!(
                "{url} answered {} ({} bytes{}) in {}ms",
                outcome.status,
                outcome.bytes,
                outcome
                    .title
                    .as_deref()
                    .map(|title| format!(", title {title:?}"))
                    .unwrap_or_default(),
                elapsed.as_millis()
            )));
            run.outcome = Some(outcome);
        }
        Err(err) => {
            run.observations
                .push(Observation::error(format!("{url}: {err:#}")));
            run.failure = Some((
                err.context("UI smoke failed"),
                "system",
                format!(
                    "Check that the UI at {url} loads; the scenario logs (vrooli scenario logs {}) usually show why.",
                    env.scenario_name
                ),
            ));
        }
    }
    Ok(run)
}

fn extract(run: SmokeRun) -> PhaseResult<Observation> {
    let extras = json!({
        "url": run.outcome.as_ref().map(|outcome| outcome.url.clone()),
        "status": run.outcome.as_ref().map(|outcome| outcome.status),
        "artifact": run.artifact,
        "previous_ui_smoke": run.previous,
    });
    match run.failure {
        None => PhaseResult::success(run.observations).with_extras(extras),
        Some((err, class, remediation)) => {
            PhaseResult::failure(err, class, remediation, run.observations).with_extras(extras)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SmokeRunner;

impl PhaseRunner for SmokeRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase_with_expectations(
            ctx,
            env,
            log,
            "smoke",
            |dir| load_testing_config(dir).map(|config| config.ui_smoke),
            |settings, log| smoke(ctx, env, tools, log, settings),
            extract,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, CommandRunner};
    use crate::observe::FailureClass;
    use std::sync::{Arc, Mutex};

    struct FixedPage(Result<SmokeOutcome, String>);

    impl SmokeDriver for FixedPage {
        fn visit(&self, _: &RunContext, url: &str, _: Duration) -> Result<SmokeOutcome> {
            match &self.0 {
                Ok(outcome) => Ok(SmokeOutcome {
                    url: url.to_string(),
                    ..outcome.clone()
                }),
                Err(message) => Err(anyhow!("{message}")),
            }
        }
    }

    fn page() -> SmokeOutcome {
        SmokeOutcome {
            url: String::new(),
            status: 200,
            bytes: 42,
            title: Some("Demo".to_string()),
        }
    }

    fn run(dir: &Path, driver: FixedPage) -> RunReport {
        let env = Environment::from_scenario_dir(dir)
            .expect("env")
            .with_ui_url(Some("http://localhost:3000".to_string()));
        let tools = Toolbox::system().smoke(Arc::new(driver));
        let mut log: Vec<u8> = Vec::new();
        SmokeRunner.run(&RunContext::background(), &env, &tools, &mut log)
    }

    /// A stopped scenario that reports its UI on port 3100 once started.
    #[derive(Default)]
    struct StoppedScenario {
        calls: Mutex<Vec<String>>,
    }

    impl CommandRunner for StoppedScenario {
        fn lookup(&self, name: &str) -> Result<PathBuf> {
            Ok(PathBuf::from("/usr/bin").join(name))
        }

        fn run(&self, _: &RunContext, _: &Path, _: &mut Log, name: &str, _: &[String]) -> Result<()> {
            Err(CommandError::NotFound { tool: name.to_string() }.into())
        }

        fn capture(&self, _: &RunContext, _: &Path, _: &mut Log, name: &str, args: &[String]) -> Result<String> {
            self.calls
                .lock()
                .expect("calls")
                .push(format!("{name} {}", args.join(" ")));
            Ok(match args.get(1).map(String::as_str) {
                Some("status") => r#"{"status":"stopped","diagnostics":{"ui_smoke":{"status":"failed"}}}"#.to_string(),
                Some("port") => "UI_PORT=3100\n".to_string(),
                _ => String::new(),
            })
        }
    }

    #[test]
    fn stopped_scenario_is_started_before_the_visit() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("ui")).expect("mkdir");
        let env = Environment::from_scenario_dir(dir.path()).expect("env");
        let commands = Arc::new(StoppedScenario::default());
        let tools = Toolbox::with_commands(commands.clone()).smoke(Arc::new(FixedPage(Ok(page()))));
        let mut log: Vec<u8> = Vec::new();
        let report = SmokeRunner.run(&RunContext::background(), &env, &tools, &mut log);
        assert!(report.is_success(), "{:?}", report.err);

        let calls = commands.calls.lock().expect("calls").clone();
        let start = format!("vrooli scenario start {}", env.scenario_name);
        assert!(calls.contains(&start), "{calls:?}");
        let summary = report.summary.expect("summary");
        assert_eq!(summary["url"], "http://localhost:3100");
        assert_eq!(summary["previous_ui_smoke"]["status"], "failed");
    }

    #[test]
    fn title_is_extracted_case_insensitively() {
        assert_eq!(page_title("<html><TITLE> Demo </TITLE>").as_deref(), Some("Demo"));
        assert_eq!(page_title("<html></html>"), None);
    }

    #[test]
    fn missing_ui_is_a_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = run(dir.path(), FixedPage(Ok(page())));
        assert!(report.is_success());
        assert!(report.has_skip());
    }

    #[test]
    fn successful_visit_writes_latest_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("ui")).expect("mkdir");
        let report = run(dir.path(), FixedPage(Ok(page())));
        assert!(report.is_success(), "{:?}", report.err);
        let bytes = fs::read(dir.path().join("coverage/ui-smoke/latest.json")).expect("artifact");
        let artifact: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(artifact["success"], true);
        assert_eq!(artifact["outcome"]["url"], "http://localhost:3000");
    }

    #[test]
    fn failed_visit_is_system() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("ui")).expect("mkdir");
        let report = run(dir.path(), FixedPage(Err("connection refused".to_string())));
        assert_eq!(report.failure_class, Some(FailureClass::System));
    }

    #[test]
    fn stale_bundle_is_misconfiguration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ui = dir.path().join("ui");
        fs::create_dir_all(ui.join("dist")).expect("mkdir");
        fs::create_dir_all(ui.join("src")).expect("mkdir");
        fs::write(ui.join("dist/index.html"), "<html></html>").expect("write");
        let source = ui.join("src/App.tsx");
        fs::write(&source, "export {}").expect("write");
        let later = SystemTime::now() + Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&source)
            .and_then(|file| file.set_modified(later))
            .expect("touch");
        let report = run(dir.path(), FixedPage(Ok(page())));
        assert_eq!(report.failure_class, Some(FailureClass::Misconfiguration));
        assert!(report.remediation.starts_with("rebuild or restart the UI"));
    }
}
