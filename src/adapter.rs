//! Bridge between runner-specific results and the core report.
//!
//! Each phase module keeps its own result and observation types. They only
//! need to expose the standard fields below; [`run_phase`] does the rest.
use crate::command::Log;
use crate::config::parse_remediation;
use crate::context::{ContextError, RunContext};
use crate::observe::{
    classify_error, standardize_failure_class, FailureClass, Observation, ObservationKind,
    RunReport,
};
use crate::workspace::Environment;
use anyhow::{anyhow, Result};
use std::io::Write;
use std::path::Path;

/// Minimal shape of a runner-specific observation.
pub trait StandardObservation {
    fn kind(&self) -> ObservationKind;
    fn icon(&self) -> Option<&str>;
    fn message(&self) -> &str;
}

impl StandardObservation for Observation {
    fn kind(&self) -> ObservationKind {
        self.kind
    }

    fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    fn message(&self) -> &str {
        Observation::message(self)
    }
}

/// Projection of the standard fields of a runner-specific result.
#[derive(Debug)]
pub struct PhaseResult<O> {
    pub success: bool,
    pub error: Option<anyhow::Error>,
    /// Runner vocabulary; mapped through [`standardize_failure_class`].
    pub failure_class: String,
    pub remediation: String,
    pub observations: Vec<O>,
    pub summary: Option<String>,
    pub summary_icon: Option<String>,
    /// Extras for the pointer's `summary` object.
    pub extras: Option<serde_json::Value>,
}

impl<O> PhaseResult<O> {
    pub fn success(observations: Vec<O>) -> Self {
        Self {
            success: true,
            error: None,
            failure_class: String::new(),
            remediation: String::new(),
            observations,
            summary: None,
            summary_icon: None,
            extras: None,
        }
    }

    pub fn failure(
        error: anyhow::Error,
        failure_class: &str,
        remediation: impl Into<String>,
        observations: Vec<O>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error),
            failure_class: failure_class.to_string(),
            remediation: remediation.into(),
            observations,
            summary: None,
            summary_icon: None,
            extras: None,
        }
    }

    pub fn with_summary(mut self, icon: &str, summary: impl Into<String>) -> Self {
        self.summary_icon = Some(icon.to_string());
        self.summary = Some(summary.into());
        self
    }

    pub fn with_extras(mut self, extras: serde_json::Value) -> Self {
        self.extras = Some(extras);
        self
    }
}

/// Convert one runner observation, preserving sections as sections.
pub fn to_observation<O: StandardObservation>(source: &O) -> Observation {
    let icon = source.icon().unwrap_or_default();
    let observation = match source.kind() {
        ObservationKind::Section => return Observation::section(icon, source.message()),
        ObservationKind::Success => Observation::success(source.message()),
        ObservationKind::Warning => Observation::warning(source.message()),
        ObservationKind::Error => Observation::error(source.message()),
        ObservationKind::Info => Observation::info(source.message()),
        ObservationKind::Skip => Observation::skip(source.message()),
        ObservationKind::Plain => Observation::plain(source.message()),
    };
    if icon.is_empty() {
        observation
    } else {
        observation.with_icon(icon)
    }
}

/// Report for a phase whose context finished before it could start.
pub fn interrupted_report(name: &str, cause: ContextError) -> RunReport {
    let (class, remediation) = match cause {
        ContextError::DeadlineExceeded => (
            FailureClass::Timeout,
            format!("Raise the run timeout or narrow the phase selection so {name} can start."),
        ),
        ContextError::Canceled => (
            FailureClass::System,
            format!("The run was cancelled before {name} started; re-run to execute it."),
        ),
    };
    RunReport::failed(cause.into(), class, remediation, Vec::new())
}

/// Run a phase body and translate its result into a [`RunReport`].
pub fn run_phase<R, O, E, X>(
    ctx: &RunContext,
    log: &mut Log,
    name: &str,
    execute: E,
    extract: X,
) -> RunReport
where
    O: StandardObservation,
    E: FnOnce(&mut Log) -> Result<R>,
    X: FnOnce(R) -> PhaseResult<O>,
{
    if let Some(cause) = ctx.err() {
        return interrupted_report(name, cause);
    }
    let result = match execute(log) {
        Ok(result) => result,
        Err(err) => {
            let class = classify_error(&err);
            return RunReport::failed(
                err,
                class,
                format!("Check {name} configuration and try again."),
                Vec::new(),
            );
        }
    };
    finish(log, name, extract(result))
}

/// [`run_phase`] preceded by loading the phase's settings for the scenario.
pub fn run_phase_with_expectations<C, R, O, L, E, X>(
    ctx: &RunContext,
    env: &Environment,
    log: &mut Log,
    name: &str,
    load_expectations: L,
    execute: E,
    extract: X,
) -> RunReport
where
    O: StandardObservation,
    L: FnOnce(&Path) -> Result<C>,
    E: FnOnce(C, &mut Log) -> Result<R>,
    X: FnOnce(R) -> PhaseResult<O>,
{
    if let Some(cause) = ctx.err() {
        return interrupted_report(name, cause);
    }
    let expectations = match load_expectations(&env.scenario_dir) {
        Ok(expectations) => expectations,
        Err(err) => {
            return RunReport::failed(
                err,
                FailureClass::Misconfiguration,
                parse_remediation(name),
                Vec::new(),
            );
        }
    };
    run_phase(ctx, log, name, |log| execute(expectations, log), extract)
}

fn finish<O: StandardObservation>(log: &mut Log, name: &str, result: PhaseResult<O>) -> RunReport {
    let mut observations: Vec<Observation> =
        result.observations.iter().map(to_observation).collect();
    if let Some(summary) = result.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        let icon = result.summary_icon.as_deref().unwrap_or_default();
        observations.push(Observation::plain(summary).with_icon(icon));
    }

    if !result.success || result.error.is_some() {
        let err = result
            .error
            .unwrap_or_else(|| anyhow!("{name} reported failure"));
        let class = if result.failure_class.trim().is_empty() {
            classify_error(&err)
        } else {
            standardize_failure_class(&result.failure_class)
        };
        let _ = writeln!(log, "{name} failed [{class}]: {err:#}");
        return RunReport {
            err: Some(err),
            failure_class: Some(class),
            remediation: result.remediation,
            observations,
            summary: result.extras,
        };
    }

    let _ = writeln!(log, "{name} complete");
    tracing::info!(phase = name, "{name} complete");
    RunReport {
        observations,
        summary: result.extras,
        ..RunReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Level {
        Header,
        Pass,
        Fail,
    }

    struct LocalObservation {
        level: Level,
        icon: Option<String>,
        message: String,
    }

    impl StandardObservation for LocalObservation {
        fn kind(&self) -> ObservationKind {
            match self.level {
                Level::Header => ObservationKind::Section,
                Level::Pass => ObservationKind::Success,
                Level::Fail => ObservationKind::Error,
            }
        }

        fn icon(&self) -> Option<&str> {
            self.icon.as_deref()
        }

        fn message(&self) -> &str {
            &self.message
        }
    }

    struct LocalResult {
        ok: bool,
        items: Vec<LocalObservation>,
    }

    fn local(level: Level, message: &str) -> LocalObservation {
        LocalObservation {
            level,
            icon: None,
            message: message.to_string(),
        }
    }

    fn extract(result: LocalResult) -> PhaseResult<LocalObservation> {
        if result.ok {
            PhaseResult::success(result.items).with_summary("📊", "2 checks")
        } else {
            PhaseResult::failure(
                anyhow!("check failed"),
                "test_failure",
                "fix the check",
                result.items,
            )
        }
    }

    #[test]
    fn success_converts_in_order_and_appends_summary() {
        let ctx = RunContext::background();
        let mut log: Vec<u8> = Vec::new();
        let report = run_phase(
            &ctx,
            &mut log,
            "demo",
            |_| {
                Ok(LocalResult {
                    ok: true,
                    items: vec![local(Level::Header, "Checks"), local(Level::Pass, "one")],
                })
            },
            extract,
        );
        assert!(report.is_success());
        assert!(report.failure_class.is_none());
        assert_eq!(report.observations.len(), 3);
        assert_eq!(report.observations[0].kind, ObservationKind::Section);
        assert_eq!(report.observations[0].section, "Checks");
        assert!(report.observations[0].text.is_empty());
        assert_eq!(report.observations[1].text, "one");
        assert_eq!(report.observations[2].to_string(), "📊 2 checks");
        assert!(String::from_utf8_lossy(&log).contains("demo complete"));
    }

    #[test]
    fn failure_standardizes_class() {
        let ctx = RunContext::background();
        let mut log: Vec<u8> = Vec::new();
        let report = run_phase(
            &ctx,
            &mut log,
            "demo",
            |_| {
                Ok(LocalResult {
                    ok: false,
                    items: vec![local(Level::Fail, "bad")],
                })
            },
            extract,
        );
        assert_eq!(report.failure_class, Some(FailureClass::System));
        assert_eq!(report.remediation, "fix the check");
        assert_eq!(report.observations.len(), 1);
    }

    #[test]
    fn execute_error_is_system_with_remediation() {
        let ctx = RunContext::background();
        let mut log: Vec<u8> = Vec::new();
        let report = run_phase(
            &ctx,
            &mut log,
            "demo",
            |_| -> Result<LocalResult> { Err(anyhow!("boom")) },
            extract,
        );
        assert_eq!(report.failure_class, Some(FailureClass::System));
        assert_eq!(report.remediation, "Check demo configuration and try again.");
    }

    #[test]
    fn cancelled_context_never_executes() {
        let ctx = RunContext::background();
        ctx.cancel();
        let mut log: Vec<u8> = Vec::new();
        let mut called = false;
        let report = run_phase(
            &ctx,
            &mut log,
            "demo",
            |_| {
                called = true;
                Ok(LocalResult {
                    ok: true,
                    items: Vec::new(),
                })
            },
            extract,
        );
        assert!(!called);
        assert_eq!(report.failure_class, Some(FailureClass::System));
        assert_eq!(
            report.err.as_ref().and_then(|e| e.downcast_ref::<ContextError>()),
            Some(&ContextError::Canceled)
        );
    }

    #[test]
    fn expectation_errors_are_misconfiguration() {
        let ctx = RunContext::background();
        let env = Environment::from_scenario_dir(Path::new("/tmp/demo")).expect("env");
        let mut log: Vec<u8> = Vec::new();
        let report = run_phase_with_expectations(
            &ctx,
            &env,
            &mut log,
            "structure",
            |_| -> Result<()> { Err(anyhow!("bad json")) },
            |_, _| {
                Ok(LocalResult {
                    ok: true,
                    items: Vec::new(),
                })
            },
            extract,
        );
        assert_eq!(report.failure_class, Some(FailureClass::Misconfiguration));
        assert_eq!(
            report.remediation,
            "Fix .vrooli/testing.json so structure settings can be parsed."
        );
    }
}
