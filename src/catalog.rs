//! Ordered registry of phase specs.
//!
//! Lookup goes through a name index; user-visible iteration always goes
//! through the sorted view so run order is identical on every host.
use crate::command::Log;
use crate::context::RunContext;
use crate::observe::RunReport;
use crate::phases;
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fallback phase timeout for catalogs built without an explicit default.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const LINT_TIMEOUT: Duration = Duration::from_secs(30);
const WEIGHT_STEP: i32 = 10;

/// Canonical phase names in registration order.
pub const CANONICAL_PHASES: [&str; 11] = [
    "structure",
    "dependencies",
    "unit",
    "integration",
    "playbooks",
    "business",
    "performance",
    "lint",
    "docs",
    "standards",
    "smoke",
];

/// Executes one phase.
pub trait PhaseRunner: Send + Sync {
    fn run(&self, ctx: &RunContext, env: &Environment, tools: &Toolbox, log: &mut Log)
        -> RunReport;
}

impl<F> PhaseRunner for F
where
    F: Fn(&RunContext, &Environment, &Toolbox, &mut Log) -> RunReport + Send + Sync,
{
    fn run(
        &self,
        ctx: &RunContext,
        env: &Environment,
        tools: &Toolbox,
        log: &mut Log,
    ) -> RunReport {
        self(ctx, env, tools, log)
    }
}

/// Trim and lowercase a phase name; `None` when nothing is left.
pub fn normalize_phase_name(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

/// True when `name` is safe to use as a pointer or log file stem:
/// non-empty, `[a-z0-9_-]` only.
pub fn is_phase_file_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Catalog entry describing one phase.
#[derive(Clone)]
pub struct Spec {
    pub name: String,
    pub runner: Arc<dyn PhaseRunner>,
    pub optional: bool,
    pub default_timeout: Duration,
    /// Zero asks the catalog to assign the next weight in registration order.
    pub weight: i32,
    pub description: String,
    pub source: String,
}

impl Spec {
    pub fn new(name: &str, runner: Arc<dyn PhaseRunner>) -> Self {
        Self {
            name: name.to_string(),
            runner,
            optional: false,
            default_timeout: Duration::ZERO,
            weight: 0,
            description: String::new(),
            source: "custom".to_string(),
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn descriptor(&self) -> PhaseDescriptor {
        PhaseDescriptor {
            name: self.name.clone(),
            optional: self.optional,
            default_timeout_seconds: self.default_timeout.as_secs_f64(),
            weight: self.weight,
            description: self.description.clone(),
            source: self.source.clone(),
        }
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("name", &self.name)
            .field("optional", &self.optional)
            .field("default_timeout", &self.default_timeout)
            .field("weight", &self.weight)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Serializable phase metadata advertised to callers.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct PhaseDescriptor {
    pub name: String,
    pub optional: bool,
    pub default_timeout_seconds: f64,
    pub weight: i32,
    pub description: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    default_timeout: Duration,
    specs: HashMap<String, Spec>,
    ordered: Vec<String>,
    next_weight: i32,
}

impl Catalog {
    pub fn new(default_timeout: Duration) -> Self {
        let default_timeout = if default_timeout.is_zero() {
            DEFAULT_PHASE_TIMEOUT
        } else {
            default_timeout
        };
        Self {
            default_timeout,
            specs: HashMap::new(),
            ordered: Vec::new(),
            next_weight: 0,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Insert or replace a spec.
    ///
    /// The name is normalized, a zero timeout takes the catalog default, and a
    /// zero weight takes the next slot in registration order (a replaced spec
    /// keeps its previous weight instead).
    pub fn register(&mut self, mut spec: Spec) -> Result<()> {
        spec.name = normalize_phase_name(&spec.name)
            .ok_or_else(|| anyhow!("phase name must not be empty"))?;
        if !is_phase_file_name(&spec.name) {
            return Err(anyhow!(
                "phase name '{}' may only contain a-z, 0-9, '_' and '-'",
                spec.name
            ));
        }
        if spec.default_timeout.is_zero() {
            spec.default_timeout = self.default_timeout;
        }
        if spec.weight == 0 {
            spec.weight = match self.specs.get(&spec.name) {
                Some(existing) => existing.weight,
                None => {
                    let weight = self.next_weight;
                    self.next_weight += WEIGHT_STEP;
                    weight
                }
            };
        } else if spec.weight >= self.next_weight {
            self.next_weight = spec.weight + WEIGHT_STEP;
        }
        self.specs.insert(spec.name.clone(), spec);
        self.rebuild_order();
        Ok(())
    }

    fn rebuild_order(&mut self) {
        let mut ordered: Vec<(&i32, &String)> = self
            .specs
            .values()
            .map(|spec| (&spec.weight, &spec.name))
            .collect();
        ordered.sort();
        self.ordered = ordered.into_iter().map(|(_, name)| name.clone()).collect();
    }

    /// Specs sorted by weight, then name.
    pub fn all(&self) -> Vec<&Spec> {
        self.ordered
            .iter()
            .filter_map(|name| self.specs.get(name))
            .collect()
    }

    pub fn lookup(&self, raw: &str) -> Option<&Spec> {
        let name = normalize_phase_name(raw)?;
        self.specs.get(&name)
    }

    pub fn descriptors(&self) -> Vec<PhaseDescriptor> {
        self.all().into_iter().map(Spec::descriptor).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Catalog seeded with every built-in phase, weights `0, 10, 20, …`.
pub fn default_catalog(default_timeout: Duration) -> Catalog {
    let mut catalog = Catalog::new(default_timeout);
    for spec in builtin_specs() {
        // Built-in names are non-empty literals.
        let _ = catalog.register(spec);
    }
    catalog
}

fn builtin(name: &str, runner: Arc<dyn PhaseRunner>, description: &str) -> Spec {
    Spec::new(name, runner)
        .description(description)
        .source("builtin")
}

fn builtin_specs() -> Vec<Spec> {
    vec![
        builtin(
            "structure",
            Arc::new(phases::structure::StructureRunner),
            "Validates required directories, files, manifests and CLI layout",
        ),
        builtin(
            "dependencies",
            Arc::new(phases::dependencies::DependenciesRunner),
            "Confirms required commands and declared resources are available",
        ),
        builtin(
            "unit",
            Arc::new(phases::unit::UnitRunner),
            "Runs language unit tests (Go, Node, Python, shell)",
        ),
        builtin(
            "integration",
            Arc::new(phases::integration::IntegrationRunner),
            "Exercises the scenario CLI and its bats suites",
        ),
        builtin(
            "playbooks",
            Arc::new(phases::playbooks::PlaybooksRunner),
            "Executes registered UI playbooks through the workflow runner",
        ),
        builtin(
            "business",
            Arc::new(phases::business::BusinessRunner),
            "Validates requirement modules, ids and the children graph",
        ),
        builtin(
            "performance",
            Arc::new(phases::performance::PerformanceRunner),
            "Builds key artifacts and enforces duration budgets",
        )
        .optional(true),
        builtin(
            "lint",
            Arc::new(phases::lint::LintRunner),
            "Runs static analysis for each detected language",
        )
        .timeout(LINT_TIMEOUT),
        builtin(
            "docs",
            Arc::new(phases::docs::DocsRunner),
            "Checks markdown links, mermaid diagrams and host-specific paths",
        ),
        builtin(
            "standards",
            Arc::new(phases::standards::StandardsRunner),
            "Runs the scenario auditor in standards-only mode",
        ),
        builtin(
            "smoke",
            Arc::new(phases::smoke::SmokeRunner),
            "Loads the UI and flags stale bundles",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn PhaseRunner> {
        Arc::new(
            |_: &RunContext, _: &Environment, _: &Toolbox, _: &mut Log| RunReport::default(),
        )
    }

    #[test]
    fn every_canonical_phase_resolves() {
        let catalog = default_catalog(Duration::from_secs(60));
        for name in CANONICAL_PHASES {
            let spec = catalog.lookup(name).expect(name);
            assert!(spec.default_timeout > Duration::ZERO);
            assert_eq!(spec.name, name);
        }
        assert_eq!(catalog.len(), CANONICAL_PHASES.len());
    }

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize_phase_name(" Unit "), Some("unit".to_string()));
        assert_eq!(normalize_phase_name("   "), None);
        assert_eq!(normalize_phase_name(""), None);
        let catalog = default_catalog(Duration::ZERO);
        assert!(catalog.lookup("  STRUCTURE\t").is_some());
        assert!(catalog.lookup(" ").is_none());
    }

    #[test]
    fn all_is_sorted_and_only_performance_is_optional() {
        let catalog = default_catalog(Duration::ZERO);
        let all = catalog.all();
        for pair in all.windows(2) {
            assert!((pair[0].weight, &pair[0].name) < (pair[1].weight, &pair[1].name));
        }
        let names: Vec<&str> = all.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, CANONICAL_PHASES.to_vec());
        assert_eq!(all[0].weight, 0);
        assert_eq!(all[10].weight, 100);
        for spec in all {
            assert_eq!(spec.optional, spec.name == "performance", "{}", spec.name);
        }
    }

    #[test]
    fn default_timeout_falls_back_and_lint_is_short() {
        let catalog = default_catalog(Duration::ZERO);
        assert_eq!(catalog.default_timeout(), DEFAULT_PHASE_TIMEOUT);
        assert_eq!(
            catalog.lookup("unit").expect("unit").default_timeout,
            DEFAULT_PHASE_TIMEOUT
        );
        assert_eq!(catalog.lookup("lint").expect("lint").default_timeout, LINT_TIMEOUT);
    }

    #[test]
    fn register_rejects_empty_and_replaces_in_place() {
        let mut catalog = default_catalog(Duration::from_secs(60));
        assert!(catalog.register(Spec::new("  ", noop())).is_err());

        catalog
            .register(Spec::new("Docs", noop()).description("custom docs"))
            .expect("replace");
        let docs = catalog.lookup("docs").expect("docs");
        assert_eq!(docs.weight, 80);
        assert_eq!(docs.description, "custom docs");
        assert_eq!(catalog.len(), CANONICAL_PHASES.len());

        catalog.register(Spec::new("extra", noop())).expect("append");
        let last = catalog.all().last().map(|spec| spec.name.clone());
        assert_eq!(last.as_deref(), Some("extra"));
    }

    #[test]
    fn equal_weights_tie_break_by_name() {
        let mut catalog = Catalog::new(Duration::from_secs(1));
        catalog.register(Spec::new("beta", noop()).weight(5)).expect("beta");
        catalog.register(Spec::new("alpha", noop()).weight(5)).expect("alpha");
        let names: Vec<&str> = catalog.all().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn descriptors_serialize() {
        let catalog = default_catalog(Duration::from_secs(60));
        let json = serde_json::to_value(catalog.descriptors()).expect("serialize");
        assert_eq!(json[0]["name"], "structure");
        assert_eq!(json[0]["source"], "builtin");
        assert_eq!(json[6]["optional"], true);
    }
}
