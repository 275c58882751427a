//! Scenario workspace: resolved paths and the service manifest.
//!
//! Centralizing path construction keeps every phase reading and writing the
//! same layout.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Immutable description of the scenario under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub scenario_name: String,
    pub scenario_dir: PathBuf,
    pub test_dir: PathBuf,
    pub app_root: PathBuf,
    pub ui_url: Option<String>,
}

impl Environment {
    /// Resolve a scenario directory into an environment.
    ///
    /// The scenario name is the directory name; the app root is the directory
    /// with a trailing `scenarios/<name>` removed, or the scenario directory
    /// itself when it does not live under `scenarios/`.
    pub fn from_scenario_dir(scenario_dir: &Path) -> Result<Self> {
        let scenario_dir = absolute(scenario_dir)?;
        let scenario_name = scenario_dir
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow!(
                    "cannot derive scenario name from {}",
                    scenario_dir.display()
                )
            })?;
        let app_root = derive_app_root(&scenario_dir, &scenario_name);
        Ok(Self {
            test_dir: scenario_dir.join("test"),
            scenario_name,
            scenario_dir,
            app_root,
            ui_url: None,
        })
    }

    pub fn with_ui_url(mut self, ui_url: Option<String>) -> Self {
        self.ui_url = ui_url.filter(|url| !url.trim().is_empty());
        self
    }

    pub fn paths(&self) -> ScenarioPaths {
        ScenarioPaths::new(self.scenario_dir.clone())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("resolve current directory")?
            .join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Strip a trailing `scenarios/<name>` from `scenario_dir`.
pub fn derive_app_root(scenario_dir: &Path, scenario_name: &str) -> PathBuf {
    let parent = scenario_dir.parent();
    let is_nested = scenario_dir.file_name().and_then(|n| n.to_str()) == Some(scenario_name)
        && parent
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            == Some("scenarios");
    match (is_nested, parent.and_then(Path::parent)) {
        (true, Some(root)) => root.to_path_buf(),
        _ => scenario_dir.to_path_buf(),
    }
}

/// Typed paths into a scenario layout.
#[derive(Debug, Clone)]
pub struct ScenarioPaths {
    root: PathBuf,
}

impl ScenarioPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `.vrooli/` directory path.
    pub fn vrooli_dir(&self) -> PathBuf {
        self.root.join(".vrooli")
    }

    /// Return the `.vrooli/service.json` path.
    pub fn service_manifest_path(&self) -> PathBuf {
        self.vrooli_dir().join("service.json")
    }

    /// Return the `.vrooli/testing.json` path.
    pub fn testing_config_path(&self) -> PathBuf {
        self.vrooli_dir().join("testing.json")
    }

    /// Return the `.vrooli/seed-state.json` path.
    pub fn seed_state_path(&self) -> PathBuf {
        self.vrooli_dir().join("seed-state.json")
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.root.join("coverage")
    }

    /// Return the `coverage/phase-results/` directory path.
    pub fn phase_results_dir(&self) -> PathBuf {
        self.coverage_dir().join("phase-results")
    }

    /// Return the pointer path for one phase.
    pub fn phase_pointer_path(&self, phase: &str) -> PathBuf {
        self.phase_results_dir().join(format!("{phase}.json"))
    }

    pub fn run_summary_path(&self) -> PathBuf {
        self.phase_results_dir().join("summary.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.coverage_dir().join("logs")
    }

    pub fn phase_log_path(&self, phase: &str) -> PathBuf {
        self.logs_dir().join(format!("{phase}.log"))
    }

    pub fn ui_smoke_dir(&self) -> PathBuf {
        self.coverage_dir().join("ui-smoke")
    }

    pub fn requirements_index_path(&self) -> PathBuf {
        self.root.join("requirements").join("index.json")
    }

    pub fn cli_dir(&self) -> PathBuf {
        self.root.join("cli")
    }

    pub fn ui_dir(&self) -> PathBuf {
        self.root.join("ui")
    }

    pub fn api_dir(&self) -> PathBuf {
        self.root.join("api")
    }

    pub fn playbook_registry_path(&self) -> PathBuf {
        self.root.join("test").join("playbooks").join("registry.json")
    }

    pub fn seeds_dir(&self) -> PathBuf {
        self.root.join("bas").join("seeds")
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.seeds_dir().join("migrations")
    }
}

/// Subset of `.vrooli/service.json` the orchestrator reads.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ServiceManifest {
    #[serde(default)]
    pub service: ServiceInfo,
    #[serde(default)]
    pub dependencies: ManifestDependencies,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ServiceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ManifestDependencies {
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDeclaration>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResourceDeclaration {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl ServiceManifest {
    /// Declared resources that are enabled, with their required flag.
    pub fn enabled_resources(&self) -> impl Iterator<Item = (&str, &ResourceDeclaration)> {
        self.dependencies
            .resources
            .iter()
            .filter(|(_, decl)| decl.enabled)
            .map(|(name, decl)| (name.as_str(), decl))
    }

    /// True when a resource of this name or type is declared and enabled.
    pub fn declares_resource(&self, name: &str) -> bool {
        self.enabled_resources().any(|(declared, decl)| {
            declared.eq_ignore_ascii_case(name)
                || decl
                    .kind
                    .as_deref()
                    .is_some_and(|kind| kind.eq_ignore_ascii_case(name))
        })
    }
}

/// Load `.vrooli/service.json`.
pub fn load_service_manifest(scenario_dir: &Path) -> Result<ServiceManifest> {
    let path = ScenarioPaths::new(scenario_dir.to_path_buf()).service_manifest_path();
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

/// Load `.vrooli/service.json` when it exists.
pub fn load_service_manifest_optional(scenario_dir: &Path) -> Result<Option<ServiceManifest>> {
    let path = ScenarioPaths::new(scenario_dir.to_path_buf()).service_manifest_path();
    if !path.is_file() {
        return Ok(None);
    }
    load_service_manifest(scenario_dir).map(Some)
}
