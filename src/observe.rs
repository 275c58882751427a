//! Typed observations, failure classes, and the per-phase run report.
//!
//! Observations are what an operator reads; the report is what the executor
//! and the pointer writer consume.
use crate::command::CommandError;
use crate::context::ContextError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of one observation line.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Section,
    Success,
    Warning,
    Error,
    Info,
    Skip,
    Plain,
}

impl ObservationKind {
    /// Icon used when the observation does not carry its own.
    pub fn default_icon(self) -> Option<&'static str> {
        match self {
            ObservationKind::Section | ObservationKind::Plain => None,
            ObservationKind::Success => Some("✅"),
            ObservationKind::Warning => Some("⚠️"),
            ObservationKind::Error => Some("❌"),
            ObservationKind::Info => Some("ℹ️"),
            ObservationKind::Skip => Some("⏭️"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObservationKind::Section => "section",
            ObservationKind::Success => "success",
            ObservationKind::Warning => "warning",
            ObservationKind::Error => "error",
            ObservationKind::Info => "info",
            ObservationKind::Skip => "skip",
            ObservationKind::Plain => "plain",
        }
    }
}

/// One categorized line of operator-visible output.
///
/// Section observations keep their heading in `section`; every other kind
/// uses `text`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Observation {
    pub kind: ObservationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub section: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl Observation {
    fn with_text(kind: ObservationKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            icon: None,
            prefix: String::new(),
            section: String::new(),
            text: text.into(),
        }
    }

    pub fn section(icon: impl Into<String>, text: impl Into<String>) -> Self {
        let icon = icon.into();
        Self {
            kind: ObservationKind::Section,
            icon: (!icon.is_empty()).then_some(icon),
            prefix: String::new(),
            section: text.into(),
            text: String::new(),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::with_text(ObservationKind::Success, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::with_text(ObservationKind::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::with_text(ObservationKind::Error, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::with_text(ObservationKind::Info, text)
    }

    pub fn skip(text: impl Into<String>) -> Self {
        Self::with_text(ObservationKind::Skip, text)
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::with_text(ObservationKind::Plain, text)
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        let icon = icon.into();
        self.icon = (!icon.is_empty()).then_some(icon);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Heading for sections, text for everything else.
    pub fn message(&self) -> &str {
        if self.kind == ObservationKind::Section {
            &self.section
        } else {
            &self.text
        }
    }

    pub fn is_skip(&self) -> bool {
        self.kind == ObservationKind::Skip
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let icon = self
            .icon
            .as_deref()
            .or_else(|| self.kind.default_icon());
        if self.kind == ObservationKind::Section {
            return match icon {
                Some(icon) => write!(f, "{icon} {}", self.section),
                None => write!(f, "{}", self.section),
            };
        }
        let mut line = String::new();
        if let Some(icon) = icon {
            line.push_str(icon);
            line.push(' ');
        }
        if !self.prefix.is_empty() {
            line.push_str(&self.prefix);
            line.push_str(": ");
        }
        line.push_str(&self.text);
        f.write_str(&line)
    }
}

/// Stable one-line renderings for pointer files.
pub fn observations_to_strings(observations: &[Observation]) -> Vec<String> {
    observations
        .iter()
        .map(|observation| observation.to_string())
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Closed set of failure buckets that drive remediation.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Misconfiguration,
    MissingDependency,
    Timeout,
    System,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Misconfiguration => "misconfiguration",
            FailureClass::MissingDependency => "missing_dependency",
            FailureClass::Timeout => "timeout",
            FailureClass::System => "system",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a runner-specific class name onto the closed set; unknown → `system`.
pub fn standardize_failure_class(raw: &str) -> FailureClass {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "misconfiguration" | "configuration" | "config" | "invalid_config" | "stale_bundle" => {
            FailureClass::Misconfiguration
        }
        "missing_dependency" | "dependency" | "missing_tool" | "not_found" => {
            FailureClass::MissingDependency
        }
        "timeout" | "deadline_exceeded" | "timed_out" => FailureClass::Timeout,
        _ => FailureClass::System,
    }
}

/// Classify an arbitrary error by the typed causes it carries.
///
/// Deadline → `timeout`, cancel → `system`, exit 124 → `timeout`,
/// exit 127 or missing executable → `missing_dependency`, else `system`.
pub fn classify_error(err: &anyhow::Error) -> FailureClass {
    for cause in err.chain() {
        if let Some(ctx) = cause.downcast_ref::<ContextError>() {
            return match ctx {
                ContextError::DeadlineExceeded => FailureClass::Timeout,
                ContextError::Canceled => FailureClass::System,
            };
        }
        if let Some(cmd) = cause.downcast_ref::<CommandError>() {
            return match cmd {
                CommandError::NotFound { .. } => FailureClass::MissingDependency,
                CommandError::Interrupted {
                    cause: ContextError::DeadlineExceeded,
                    ..
                } => FailureClass::Timeout,
                CommandError::Exit {
                    code: Some(124), ..
                } => FailureClass::Timeout,
                CommandError::Exit {
                    code: Some(127), ..
                } => FailureClass::MissingDependency,
                _ => FailureClass::System,
            };
        }
    }
    FailureClass::System
}

/// Per-phase outcome produced by a runner.
///
/// `err.is_some()` if and only if `failure_class.is_some()`.
#[derive(Debug, Default)]
pub struct RunReport {
    pub err: Option<anyhow::Error>,
    pub failure_class: Option<FailureClass>,
    pub remediation: String,
    pub observations: Vec<Observation>,
    /// Phase-specific extras copied into the pointer's `summary`.
    pub summary: Option<serde_json::Value>,
}

impl RunReport {
    pub fn passed(observations: Vec<Observation>) -> Self {
        Self {
            observations,
            ..Self::default()
        }
    }

    pub fn failed(
        err: anyhow::Error,
        class: FailureClass,
        remediation: impl Into<String>,
        observations: Vec<Observation>,
    ) -> Self {
        Self {
            err: Some(err),
            failure_class: Some(class),
            remediation: remediation.into(),
            observations,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: serde_json::Value) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn is_success(&self) -> bool {
        self.err.is_none()
    }

    pub fn has_skip(&self) -> bool {
        self.observations.iter().any(Observation::is_skip)
    }
}
