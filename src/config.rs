//! `.vrooli/testing.json` phase settings.
//!
//! Every section and field is optional; omitted values fall back to the
//! defaults below so a scenario without the file validates with stock rules.
use crate::workspace::ScenarioPaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TestingConfig {
    #[serde(default)]
    pub structure: StructureSettings,
    #[serde(default)]
    pub docs: DocsSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub playbooks: PlaybooksSettings,
    #[serde(default)]
    pub ui_smoke: UiSmokeSettings,
    #[serde(default)]
    pub lint: LintSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StructureSettings {
    #[serde(default)]
    pub additional_dirs: Vec<String>,
    #[serde(default)]
    pub additional_files: Vec<String>,
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_files: Vec<String>,
    #[serde(default)]
    pub validations: StructureValidations,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StructureValidations {
    #[serde(default = "default_true")]
    pub service_json_name_matches_directory: bool,
    #[serde(default = "default_true")]
    pub check_json_validity: bool,
}

impl Default for StructureValidations {
    fn default() -> Self {
        Self {
            service_json_name_matches_directory: true,
            check_json_validity: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DocsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Broken links and absolute paths fail the phase instead of warning.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_true")]
    pub check_links: bool,
    #[serde(default = "default_true")]
    pub check_mermaid: bool,
    #[serde(default = "default_true")]
    pub check_absolute_paths: bool,
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
}

impl Default for DocsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            check_links: true,
            check_mermaid: true,
            check_absolute_paths: true,
            exclude_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PerformanceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_go_build_max_seconds")]
    pub go_build_max_seconds: f64,
    #[serde(default = "default_ui_build_max_seconds")]
    pub ui_build_max_seconds: f64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            go_build_max_seconds: default_go_build_max_seconds(),
            ui_build_max_seconds: default_ui_build_max_seconds(),
        }
    }
}

impl PerformanceSettings {
    pub fn go_build_budget(&self) -> Duration {
        seconds(self.go_build_max_seconds)
    }

    pub fn ui_build_budget(&self) -> Duration {
        seconds(self.ui_build_max_seconds)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlaybooksSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub seeds: SeedSettings,
}

impl Default for PlaybooksSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            seeds: SeedSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SeedSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_seed_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Keep isolated resources after the phase for debugging.
    #[serde(default)]
    pub retain: bool,
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: default_seed_timeout_seconds(),
            retain: false,
        }
    }
}

impl SeedSettings {
    /// Non-positive or non-finite values fall back to the default rather
    /// than expiring before the seed script starts.
    pub fn timeout(&self) -> Duration {
        let timeout = seconds(self.timeout_seconds);
        if timeout.is_zero() {
            seconds(default_seed_timeout_seconds())
        } else {
            timeout
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UiSmokeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_smoke_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for UiSmokeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_smoke_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LintSettings {
    #[serde(default = "default_true")]
    pub go: bool,
    #[serde(default = "default_true")]
    pub ui: bool,
    #[serde(default = "default_true")]
    pub python: bool,
}

impl Default for LintSettings {
    fn default() -> Self {
        Self {
            go: true,
            ui: true,
            python: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_go_build_max_seconds() -> f64 {
    90.0
}

fn default_ui_build_max_seconds() -> f64 {
    180.0
}

fn default_seed_timeout_seconds() -> f64 {
    120.0
}

fn default_smoke_timeout_ms() -> u64 {
    15_000
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Load `.vrooli/testing.json`, or defaults when the file is absent.
pub fn load_testing_config(scenario_dir: &Path) -> Result<TestingConfig> {
    let path = ScenarioPaths::new(scenario_dir.to_path_buf()).testing_config_path();
    if !path.is_file() {
        return Ok(TestingConfig::default());
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

/// Remediation for any phase whose settings failed to parse.
pub fn parse_remediation(phase: &str) -> String {
    format!("Fix .vrooli/testing.json so {phase} settings can be parsed.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_testing_config(dir.path()).expect("defaults");
        assert!(config.structure.validations.check_json_validity);
        assert!(config.structure.validations.service_json_name_matches_directory);
        assert!(config.ui_smoke.enabled);
        assert_eq!(config.playbooks.seeds.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".vrooli")).expect("mkdir");
        std::fs::write(
            dir.path().join(".vrooli/testing.json"),
            r#"{"structure": {"validations": {"check_json_validity": false}},
                "performance": {"go_build_max_seconds": 0.001}}"#,
        )
        .expect("write");
        let config = load_testing_config(dir.path()).expect("parse");
        assert!(!config.structure.validations.check_json_validity);
        assert!(config.structure.validations.service_json_name_matches_directory);
        assert_eq!(config.performance.go_build_budget(), Duration::from_millis(1));
        assert_eq!(config.performance.ui_build_budget(), Duration::from_secs(180));
    }

    #[test]
    fn non_positive_seed_timeout_uses_the_default() {
        for raw in ["0", "-5"] {
            let seeds: SeedSettings =
                serde_json::from_str(&format!(r#"{{"timeout_seconds": {raw}}}"#)).expect("parse");
            assert_eq!(seeds.timeout(), Duration::from_secs(120), "{raw}");
        }
        let seeds: SeedSettings = serde_json::from_str(r#"{"timeout_seconds": 2.5}"#).expect("parse");
        assert_eq!(seeds.timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".vrooli")).expect("mkdir");
        std::fs::write(dir.path().join(".vrooli/testing.json"), "{not json").expect("write");
        assert!(load_testing_config(dir.path()).is_err());
    }
}
