//! Requirement modules: required fields, unique ids and the children graph.
use crate::adapter::{run_phase, PhaseResult, StandardObservation};
use crate::catalog::PhaseRunner;
use crate::command::Log;
use crate::context::RunContext;
use crate::observe::{ObservationKind, RunReport};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIndex {
    List(Vec<String>),
    Keyed {
        #[serde(default, alias = "imports")]
        modules: Vec<String>,
    },
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Requirement {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub criticality: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub validation: Vec<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RawModule {
    #[serde(default)]
    requirements: Vec<Requirement>,
}

/// One requirement module loaded from disk.
#[derive(Debug, Clone)]
pub struct RequirementModule {
    pub path: String,
    pub requirements: Vec<Requirement>,
}

/// Module paths listed in `requirements/index.json`, resolved to modules.
pub fn load_modules(index_path: &Path) -> Result<Vec<RequirementModule>> {
    let requirements_dir = index_path.parent().unwrap_or(Path::new("."));
    let bytes = fs::read(index_path).with_context(|| format!("read {}", index_path.display()))?;
    let index: RawIndex =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", index_path.display()))?;
    let paths = match index {
        RawIndex::List(paths) => paths,
        RawIndex::Keyed { modules } => modules,
    };
    let mut modules = Vec::with_capacity(paths.len());
    for rel in paths {
        let path = requirements_dir.join(&rel);
        let bytes = fs::read(&path).with_context(|| format!("read requirement module {rel}"))?;
        let raw: RawModule = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse requirement module {rel}"))?;
        modules.push(RequirementModule {
            path: rel,
            requirements: raw.requirements,
        });
    }
    Ok(modules)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Module { path: String, count: usize },
    MissingField { id: String, module: String, field: &'static str },
    DuplicateId { id: String, first: String, second: String },
    UnknownChild { parent: String, child: String },
    Cycle { path: Vec<String> },
    Unreadable { message: String },
    Clean { total: usize },
}

impl Finding {
    pub fn is_violation(&self) -> bool {
        !matches!(self, Finding::Module { .. } | Finding::Clean { .. })
    }

    fn render(&self) -> String {
        match self {
            Finding::Module { path, count } => format!("{path}: {count} requirement(s)"),
            Finding::MissingField { id, module, field } => {
                let id = if id.is_empty() { "<no id>" } else { id.as_str() };
                format!("{module}: {id} has empty {field}")
            }
            Finding::DuplicateId { id, first, second } => {
                format!("duplicate id {id} in {first} and {second}")
            }
            Finding::UnknownChild { parent, child } => {
                format!("{parent} references unknown child {child}")
            }
            Finding::Cycle { path } => format!("children cycle: {}", path.join(" -> ")),
            Finding::Unreadable { message } => message.clone(),
            Finding::Clean { total } => format!("{total} requirement(s) validated"),
        }
    }
}

/// A finding paired with its rendered text.
#[derive(Debug, Clone)]
pub struct BusinessObservation {
    pub finding: Finding,
    text: String,
}

impl From<Finding> for BusinessObservation {
    fn from(finding: Finding) -> Self {
        let text = finding.render();
        Self { finding, text }
    }
}

impl StandardObservation for BusinessObservation {
    fn kind(&self) -> ObservationKind {
        match self.finding {
            Finding::Module { .. } => ObservationKind::Info,
            Finding::Clean { .. } => ObservationKind::Success,
            _ => ObservationKind::Error,
        }
    }

    fn icon(&self) -> Option<&str> {
        match self.finding {
            Finding::Module { .. } => Some("📋"),
            _ => None,
        }
    }

    fn message(&self) -> &str {
        &self.text
    }
}

/// Validate every module as one id space.
pub fn validate_modules(modules: &[RequirementModule]) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    let mut graph: BTreeMap<&str, &[String]> = BTreeMap::new();
    let mut total = 0;

    for module in modules {
        findings.push(Finding::Module {
            path: module.path.clone(),
            count: module.requirements.len(),
        });
        for req in &module.requirements {
            total += 1;
            let fields: [(&'static str, bool); 5] = [
                ("id", req.id.trim().is_empty()),
                ("title", req.title.trim().is_empty()),
                ("criticality", req.criticality.trim().is_empty()),
                ("status", req.status.trim().is_empty()),
                ("validation", req.validation.is_empty()),
            ];
            for (field, empty) in fields {
                if empty {
                    findings.push(Finding::MissingField {
                        id: req.id.clone(),
                        module: module.path.clone(),
                        field,
                    });
                }
            }
            if req.id.trim().is_empty() {
                continue;
            }
            if let Some(first) = owners.insert(req.id.as_str(), module.path.as_str()) {
                findings.push(Finding::DuplicateId {
                    id: req.id.clone(),
                    first: first.to_string(),
                    second: module.path.clone(),
                });
            }
            graph.entry(req.id.as_str()).or_insert(req.children.as_slice());
        }
    }

    for (&parent, children) in &graph {
        for child in children.iter() {
            if !graph.contains_key(child.as_str()) {
                findings.push(Finding::UnknownChild {
                    parent: parent.to_string(),
                    child: child.clone(),
                });
            }
        }
    }

    findings.extend(find_cycles(&graph).into_iter().map(|path| Finding::Cycle { path }));

    if !findings.iter().any(Finding::is_violation) {
        findings.push(Finding::Clean { total });
    }
    findings
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// One representative path per cycle reachable in `graph`.
fn find_cycles(graph: &BTreeMap<&str, &[String]>) -> Vec<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, &'a [String]>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        let children = graph.get(node).copied().unwrap_or_default();
        for child in children {
            let Some((&child, _)) = graph.get_key_value(child.as_str()) else {
                continue;
            };
            match marks.get(child) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|&n| n == child).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                    path.push(child.to_string());
                    cycles.push(path);
                }
                Some(Mark::Done) => {}
                None => visit(child, graph, marks, stack, cycles),
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
    }

    let mut marks = BTreeMap::new();
    let mut cycles = Vec::new();
    for &node in graph.keys() {
        if !marks.contains_key(node) {
            let mut stack = Vec::new();
            visit(node, graph, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

fn extract(findings: Vec<Finding>) -> PhaseResult<BusinessObservation> {
    let violations: Vec<String> = findings
        .iter()
        .filter(|finding| finding.is_violation())
        .map(Finding::render)
        .collect();
    let modules = findings
        .iter()
        .filter(|finding| matches!(finding, Finding::Module { .. }))
        .count();
    let kinds: BTreeSet<&str> = findings
        .iter()
        .filter_map(|finding| match finding {
            Finding::MissingField { .. } => Some("missing_field"),
            Finding::DuplicateId { .. } => Some("duplicate_id"),
            Finding::UnknownChild { .. } => Some("unknown_child"),
            Finding::Cycle { .. } => Some("cycle"),
            Finding::Unreadable { .. } => Some("unreadable"),
            _ => None,
        })
        .collect();
    let extras = json!({
        "modules": modules,
        "violations": violations.len(),
        "violation_kinds": kinds,
    });
    let observations: Vec<BusinessObservation> = findings.into_iter().map(Into::into).collect();
    if violations.is_empty() {
        return PhaseResult::success(observations).with_extras(extras);
    }
    PhaseResult::failure(
        anyhow!(
            "{} requirement violation(s): {}",
            violations.len(),
            violations.join("; ")
        ),
        "misconfiguration",
        "Fix the listed requirement entries under requirements/ so ids are unique, fields are filled and children resolve without cycles.",
        observations,
    )
    .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusinessRunner;

impl PhaseRunner for BusinessRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, _tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase(
            ctx,
            log,
            "business",
            |_log| {
                Ok(match load_modules(&env.paths().requirements_index_path()) {
                    Ok(modules) => validate_modules(&modules),
                    Err(err) => vec![Finding::Unreadable {
                        message: format!("{err:#}"),
                    }],
                })
            },
            extract,
        )
    }
}
