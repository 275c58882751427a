//! Markdown hygiene: mermaid fences, relative links and host-specific paths.
use crate::adapter::{run_phase_with_expectations, PhaseResult};
use crate::catalog::PhaseRunner;
use crate::command::Log;
use crate::config::{load_testing_config, DocsSettings};
use crate::context::RunContext;
use crate::observe::{Observation, RunReport};
use crate::phases::{display_rel, walk_files};
use crate::toolbox::Toolbox;
use crate::workspace::Environment;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

const MERMAID_KEYWORDS: [&str; 20] = [
    "graph",
    "flowchart",
    "sequenceDiagram",
    "classDiagram",
    "stateDiagram",
    "stateDiagram-v2",
    "erDiagram",
    "gantt",
    "pie",
    "journey",
    "gitGraph",
    "mindmap",
    "timeline",
    "quadrantChart",
    "requirementDiagram",
    "C4Context",
    "sankey-beta",
    "xychart-beta",
    "block-beta",
    "packet-beta",
];

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[[^\]]*\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#)
            .expect("regex for markdown links")
    })
}

fn host_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s`'(\x22=])(/home/[^\s`'\x22)]+|/Users/[^\s`'\x22)]+|/root/[^\s`'\x22)]*|[A-Za-z]:\\[^\s`'\x22)]*)")
            .expect("regex for host paths")
    })
}

/// A problem found in one markdown file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIssue {
    pub file: String,
    pub line: usize,
    pub kind: DocIssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocIssueKind {
    Mermaid,
    BrokenLink,
    AbsolutePath,
}

impl DocIssue {
    fn render(&self) -> String {
        format!("{}:{}: {}", self.file, self.line, self.detail)
    }
}

fn mermaid_problem(block: &[&str]) -> Option<String> {
    let mut lines = block.iter().map(|line| line.trim()).filter(|line| !line.is_empty());
    let Some(mut first) = lines.next() else {
        return Some("empty mermaid diagram".to_string());
    };
    if first == "---" {
        // Front matter; the diagram starts after the closing marker.
        lines.by_ref().find(|line| *line == "---");
        first = lines.find(|line| !line.starts_with("%%"))?;
    }
    while first.starts_with("%%") {
        first = lines.next()?;
    }
    let keyword = first.split_whitespace().next().unwrap_or_default();
    if !MERMAID_KEYWORDS.contains(&keyword) {
        return Some(format!("mermaid diagram starts with unknown keyword {keyword:?}"));
    }

    let mut stack = Vec::new();
    let mut in_quotes = false;
    for ch in block.iter().flat_map(|line| line.chars().chain(std::iter::once('\n'))) {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\n' => in_quotes = false,
            _ if in_quotes => {}
            '(' | '[' | '{' => stack.push(ch),
            ')' | ']' | '}' => {
                let open = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return Some(format!("mermaid diagram has unbalanced {ch:?}"));
                }
            }
            _ => {}
        }
    }
    stack
        .last()
        .map(|open| format!("mermaid diagram leaves {open:?} unclosed"))
}

fn link_is_external(target: &str) -> bool {
    target.starts_with('#')
        || target.starts_with('/')
        || target.contains("://")
        || target.starts_with("mailto:")
        || target.starts_with("tel:")
        || target.starts_with("data:")
}

/// Check one markdown document.
pub fn check_markdown(
    root: &Path,
    file: &Path,
    contents: &str,
    settings: &DocsSettings,
) -> (Vec<DocIssue>, usize) {
    let rel = display_rel(root, file);
    let base = file.parent().unwrap_or(root);
    let mut issues = Vec::new();
    let mut diagrams = 0;
    let lines: Vec<&str> = contents.lines().collect();
    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];
        let trimmed = line.trim_start();
        let issue = |line_no: usize, kind, detail: String| DocIssue {
            file: rel.clone(),
            line: line_no,
            kind,
            detail,
        };

        if let Some(fence) = ["```", "~~~"].into_iter().find(|f| trimmed.starts_with(f)) {
            let lang = trimmed[fence.len()..].trim();
            let start = idx;
            let end = lines[idx + 1..]
                .iter()
                .position(|candidate| candidate.trim_start().starts_with(fence))
                .map(|offset| idx + 1 + offset);
            let body_end = end.unwrap_or(lines.len());
            let body = &lines[idx + 1..body_end];
            if lang.eq_ignore_ascii_case("mermaid") && settings.check_mermaid {
                diagrams += 1;
                if end.is_none() {
                    issues.push(issue(start + 1, DocIssueKind::Mermaid, "unclosed mermaid fence".to_string()));
                } else if let Some(problem) = mermaid_problem(body) {
                    issues.push(issue(start + 1, DocIssueKind::Mermaid, problem));
                }
            } else if settings.check_absolute_paths {
                for (offset, body_line) in body.iter().enumerate() {
                    for caps in host_path_re().captures_iter(body_line) {
                        issues.push(issue(
                            idx + offset + 2,
                            DocIssueKind::AbsolutePath,
                            format!("host-specific path {}", &caps[1]),
                        ));
                    }
                }
            }
            idx = body_end + 1;
            continue;
        }

        if settings.check_links {
            for caps in link_re().captures_iter(line) {
                let target = &caps[1];
                if link_is_external(target) {
                    continue;
                }
                let path_part = target
                    .split(['#', '?'])
                    .next()
                    .unwrap_or_default()
                    .replace("%20", " ");
                if path_part.is_empty() {
                    continue;
                }
                if !base.join(&path_part).exists() {
                    issues.push(issue(
                        idx + 1,
                        DocIssueKind::BrokenLink,
                        format!("broken link {target}"),
                    ));
                }
            }
        }
        if settings.check_absolute_paths {
            for caps in host_path_re().captures_iter(line) {
                issues.push(issue(
                    idx + 1,
                    DocIssueKind::AbsolutePath,
                    format!("host-specific path {}", &caps[1]),
                ));
            }
        }
        idx += 1;
    }
    (issues, diagrams)
}

#[derive(Debug, Default)]
pub struct DocsOutcome {
    pub observations: Vec<Observation>,
    pub files: usize,
    pub diagrams: usize,
    pub errors: Vec<DocIssue>,
    pub warnings: Vec<DocIssue>,
}

fn execute(ctx: &RunContext, root: &Path, settings: &DocsSettings) -> Result<DocsOutcome> {
    let mut outcome = DocsOutcome::default();
    if !settings.enabled {
        outcome
            .observations
            .push(Observation::skip("docs checks disabled in .vrooli/testing.json"));
        return Ok(outcome);
    }
    let files = walk_files(root, &settings.exclude_dirs, |path| {
        path.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
    })?;
    if files.is_empty() {
        outcome
            .observations
            .push(Observation::skip("no markdown files found"));
        return Ok(outcome);
    }
    outcome
        .observations
        .push(Observation::section("📚", "Checking markdown"));
    for file in &files {
        ctx.check()?;
        let contents = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
        let (issues, diagrams) = check_markdown(root, file, &contents, settings);
        outcome.files += 1;
        outcome.diagrams += diagrams;
        for issue in issues {
            let blocking = issue.kind == DocIssueKind::Mermaid || settings.strict;
            if blocking {
                outcome.observations.push(Observation::error(issue.render()));
                outcome.errors.push(issue);
            } else {
                outcome.observations.push(Observation::warning(issue.render()));
                outcome.warnings.push(issue);
            }
        }
    }
    outcome.observations.push(Observation::info(format!(
        "{} file(s), {} mermaid diagram(s), {} warning(s)",
        outcome.files,
        outcome.diagrams,
        outcome.warnings.len()
    )));
    Ok(outcome)
}

fn extract(outcome: DocsOutcome) -> PhaseResult<Observation> {
    let extras = json!({
        "files": outcome.files,
        "mermaid_diagrams": outcome.diagrams,
        "errors": outcome.errors.len(),
        "warnings": outcome.warnings.len(),
    });
    if outcome.errors.is_empty() {
        return PhaseResult::success(outcome.observations).with_extras(extras);
    }
    let first = outcome
        .errors
        .iter()
        .take(3)
        .map(DocIssue::render)
        .collect::<Vec<_>>()
        .join("; ");
    PhaseResult::failure(
        anyhow!("{} documentation issue(s): {first}", outcome.errors.len()),
        "misconfiguration",
        "Fix the listed markdown files: close mermaid fences, repair relative links and replace host-specific paths with repo-relative ones.",
        outcome.observations,
    )
    .with_extras(extras)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocsRunner;

impl PhaseRunner for DocsRunner {
    fn run(&self, ctx: &RunContext, env: &Environment, _tools: &Toolbox, log: &mut Log) -> RunReport {
        run_phase_with_expectations(
            ctx,
            env,
            log,
            "docs",
            |dir| load_testing_config(dir).map(|config| config.docs),
            |settings, _log| execute(ctx, &env.scenario_dir, &settings),
            extract,
        )
    }
}
