//! Per-phase pointer files and other JSON artifacts.
//!
//! Writes go to a sibling temp file and are renamed into place so readers
//! never observe a half-written pointer.
use crate::executor::{ExecutionResult, PhaseStatus};
use crate::workspace::ScenarioPaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// On-disk summary of one phase under `coverage/phase-results/`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PhasePointer {
    pub phase: String,
    pub scenario: String,
    pub status: PhaseStatus,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhasePointer {
    pub fn from_result(scenario: &str, result: &ExecutionResult) -> Result<Self> {
        Ok(Self {
            phase: result.name.clone(),
            scenario: scenario.to_string(),
            status: result.status,
            updated_at: now_rfc3339()?,
            failure_class: result.classification.map(|class| class.to_string()),
            remediation: result
                .remediation
                .clone()
                .filter(|text| !text.trim().is_empty()),
            observations: result.observations.clone(),
            summary: result.summary.clone(),
            duration_seconds: result.duration_seconds,
            log_path: result.log_path.clone(),
            error: result.error.clone(),
        })
    }
}

/// Current time as RFC3339 UTC.
pub fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("format timestamp")
}

/// Write the pointer for `result` and return its path.
pub fn write_phase_pointer(
    paths: &ScenarioPaths,
    scenario: &str,
    result: &ExecutionResult,
) -> Result<PathBuf> {
    let pointer = PhasePointer::from_result(scenario, result)?;
    let path = paths.phase_pointer_path(&result.name);
    write_json_atomic(&path, &pointer)?;
    Ok(path)
}

/// Read a pointer back, mostly for callers chaining phases.
pub fn read_phase_pointer(paths: &ScenarioPaths, phase: &str) -> Result<PhasePointer> {
    let path = paths.phase_pointer_path(phase);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

/// Serialize `value` as pretty JSON and publish it atomically at `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serialize JSON artifact")?;
    write_bytes_atomic(path, &bytes)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));
    fs::write(&tmp_path, bytes).with_context(|| format!("write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("publish {}", path.display()));
    }
    Ok(())
}

/// Create `dir` and its parents; `.vrooli` trees are private (0700).
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let private = dir
            .components()
            .any(|component| component.as_os_str() == ".vrooli");
        builder.mode(if private { 0o700 } else { 0o755 });
    }
    builder
        .create(dir)
        .with_context(|| format!("create {}", dir.display()))
}
